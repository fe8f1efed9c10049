//! Session registry: owns every live interactive session.
//!
//! Each Active session has one I/O task that forwards remote output to the
//! owner's event sink in order, and performs the Closing → Closed teardown
//! (flush, handle release, final event) no matter what triggered the close.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use sm_core::config::Config;
use sm_core::error::{ErrorCode, HasErrorCode};
use sm_core::types::{ClientId, Credential, SessionId, SessionState, Target};
use sm_harness::shutdown::ShutdownSignal;
use sm_telemetry::metrics::{
    global_metrics, SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL, SESSIONS_OPENED_TOTAL,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::{ConnectionPool, PoolError, PoolHandle};
use crate::session::{CloseReason, SessionEntry, SessionEvent, SessionInfo, Utf8Carry};
use crate::transport::{ChannelCommand, ChannelEvent, PtySize, TransportError};

/// Where a session's events go. Usually one per client connection.
pub type EventSink = mpsc::Sender<SessionEvent>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("could not start remote shell: {0}")]
    Shell(String),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("client disconnected before the session opened")]
    ClientGone,
}

impl HasErrorCode for SessionError {
    fn code(&self) -> ErrorCode {
        match self {
            SessionError::Pool(e) => e.code(),
            SessionError::Shell(_) => ErrorCode::HandshakeFailed,
            SessionError::NotFound(_) => ErrorCode::SessionNotFound,
            SessionError::Invalid(_) => ErrorCode::ProtocolError,
            SessionError::ClientGone => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    /// Bound on draining remaining output after a close request.
    pub flush_timeout: Duration,
    pub shell_timeout: Duration,
    pub default_size: PtySize,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        let session_timeout = config.session_timeout();
        Self {
            session_timeout,
            sweep_interval: (session_timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(30)),
            flush_timeout: Duration::from_secs(1),
            shell_timeout: config.pool.connect_timeout(),
            default_size: PtySize::default(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub active: usize,
    pub closing: usize,
    pub connecting: usize,
    pub opened_total: u64,
    pub closed_total: u64,
    pub failed_total: u64,
}

struct RegistryInner {
    pool: ConnectionPool,
    settings: RegistrySettings,
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    connecting: AtomicUsize,
    opened: AtomicU64,
    closed: AtomicU64,
    failed: AtomicU64,
}

impl RegistryInner {
    /// `(active, closing)` over the registered sessions.
    fn state_counts(&self) -> (usize, usize) {
        let (mut active, mut closing) = (0, 0);
        for e in self.sessions.iter() {
            match e.state() {
                SessionState::Active => active += 1,
                SessionState::Closing => closing += 1,
                _ => {}
            }
        }
        (active, closing)
    }

    /// Publishes the Active count, the same figure `stats().active` reports.
    fn publish_gauge(&self) -> usize {
        let (active, _) = self.state_counts();
        global_metrics().set_gauge(SESSIONS_ACTIVE, active as f64);
        active
    }
}

/// Decrements the connecting counter however `create_session` exits.
struct ConnectingGuard<'a>(&'a AtomicUsize);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(pool: ConnectionPool, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pool,
                settings,
                sessions: DashMap::new(),
                connecting: AtomicUsize::new(0),
                opened: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    /// Open a session for `client_id`.
    ///
    /// On success the session is Active, `SessionEvent::Opened` has already
    /// been delivered to `sink`, and all later events for it go to `sink`.
    /// On failure nothing is registered and any leased handle is discarded.
    pub async fn create_session(
        &self,
        target: Target,
        credential: &Credential,
        client_id: ClientId,
        sink: EventSink,
    ) -> Result<SessionId> {
        let inner = &self.inner;
        inner.connecting.fetch_add(1, Ordering::Relaxed);
        let _connecting = ConnectingGuard(&inner.connecting);

        let handle = match inner.pool.acquire(&target, credential).await {
            Ok(h) => h,
            Err(e) => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let shell = match self.open_shell(&handle).await {
            Ok(shell) => shell,
            Err(e) => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%target, error = %e, "shell open failed");
                inner.pool.discard(handle);
                return Err(SessionError::Shell(e.to_string()));
            }
        };

        let session_id = SessionId::new();
        let entry = Arc::new(SessionEntry::new(
            session_id,
            client_id,
            target.clone(),
            shell.input,
        ));
        entry.touch();

        // Registered before `Opened` goes out so input racing the
        // notification finds the session. No output flows until the I/O task
        // starts below.
        entry.transition(SessionState::Active);
        inner.sessions.insert(session_id, entry.clone());

        if sink.send(SessionEvent::Opened { session_id }).await.is_err() {
            inner.sessions.remove(&session_id);
            entry.begin_close(CloseReason::ClientGone);
            entry.transition(SessionState::Closed);
            let _ = entry.input.try_send(ChannelCommand::Close);
            inner.pool.release(handle);
            return Err(SessionError::ClientGone);
        }

        inner.opened.fetch_add(1, Ordering::Relaxed);
        inner.publish_gauge();
        global_metrics().increment_counter(SESSIONS_OPENED_TOTAL, &[]);
        info!(%session_id, %client_id, %target, "session active");

        tokio::spawn(run_session(inner.clone(), entry, shell.output, handle, sink));
        Ok(session_id)
    }

    async fn open_shell(
        &self,
        handle: &PoolHandle,
    ) -> std::result::Result<crate::transport::ShellChannel, TransportError> {
        let conn = handle.connection().ok_or(TransportError::Closed)?;
        let timeout = self.inner.settings.shell_timeout;
        tokio::time::timeout(timeout, conn.open_shell(self.inner.settings.default_size))
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)))
    }

    fn active(&self, id: SessionId) -> Result<Arc<SessionEntry>> {
        match self.inner.sessions.get(&id) {
            Some(e) if e.state() == SessionState::Active => Ok(e.clone()),
            _ => Err(SessionError::NotFound(id)),
        }
    }

    /// Forward keystrokes to the remote shell.
    pub async fn send_input(&self, id: SessionId, bytes: Vec<u8>) -> Result<()> {
        let entry = self.active(id)?;
        entry
            .input
            .send_async(ChannelCommand::Data(bytes))
            .await
            .map_err(|_| SessionError::NotFound(id))?;
        entry.touch();
        Ok(())
    }

    pub async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::Invalid(format!(
                "terminal size {cols}x{rows} must be non-zero"
            )));
        }
        let entry = self.active(id)?;
        entry
            .input
            .send_async(ChannelCommand::Resize(PtySize { cols, rows }))
            .await
            .map_err(|_| SessionError::NotFound(id))?;
        entry.touch();
        Ok(())
    }

    /// Mark activity without sending anything.
    pub fn touch(&self, id: SessionId) -> Result<()> {
        self.active(id)?.touch();
        Ok(())
    }

    /// Close a session and wait until it reaches Closed.
    pub async fn close_session(&self, id: SessionId) -> Result<()> {
        self.close_with(id, CloseReason::Requested).await
    }

    async fn close_with(&self, id: SessionId, reason: CloseReason) -> Result<()> {
        let entry = self
            .inner
            .sessions
            .get(&id)
            .map(|e| e.clone())
            .ok_or(SessionError::NotFound(id))?;
        let mut state = entry.subscribe();
        entry.begin_close(reason);
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
        Ok(())
    }

    /// Close every session, concurrently. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        let results = join_all(ids.into_iter().map(|id| self.close_session(id))).await;
        results.into_iter().filter(Result::is_ok).count()
    }

    /// Move every Active session idle for `session_timeout` to Closing.
    pub fn sweep_idle(&self) -> usize {
        let limit = self.inner.settings.session_timeout;
        let mut swept = 0;
        for entry in self.inner.sessions.iter() {
            if entry.state() == SessionState::Active
                && entry.idle_for() >= limit
                && entry.begin_close(CloseReason::IdleTimeout)
            {
                debug!(session_id = %entry.id, idle = ?entry.idle_for(), "closing idle session");
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "idle sessions swept");
        }
        swept
    }

    pub fn spawn_sweeper(&self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.inner.settings.sweep_interval);
            ticker.tick().await;
            let mut stop = shutdown.listener();
            loop {
                tokio::select! {
                    _ = ticker.tick() => { registry.sweep_idle(); }
                    _ = stop.wait() => {
                        debug!("session sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    pub fn describe(&self, id: SessionId) -> Option<SessionInfo> {
        self.inner.sessions.get(&id).map(|e| e.info())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = self.inner.sessions.iter().map(|e| e.info()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    pub fn list_for_client(&self, client_id: ClientId) -> Vec<SessionId> {
        self.inner
            .sessions
            .iter()
            .filter(|e| e.client_id == client_id)
            .map(|e| *e.key())
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = &self.inner;
        let (active, closing) = inner.state_counts();
        RegistryStats {
            active,
            closing,
            connecting: inner.connecting.load(Ordering::Relaxed),
            opened_total: inner.opened.load(Ordering::Relaxed),
            closed_total: inner.closed.load(Ordering::Relaxed),
            failed_total: inner.failed.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-session I/O task
// ---------------------------------------------------------------------------

async fn run_session(
    inner: Arc<RegistryInner>,
    entry: Arc<SessionEntry>,
    output: flume::Receiver<ChannelEvent>,
    handle: PoolHandle,
    sink: EventSink,
) {
    let session_id = entry.id;
    let mut state = entry.subscribe();
    let mut carry = Utf8Carry::default();
    let mut transport_failed = false;
    let mut shell_open = true;

    loop {
        if entry.state() != SessionState::Active {
            break;
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() != SessionState::Active {
                    break;
                }
            }
            event = output.recv_async() => match event {
                Ok(ChannelEvent::Output(bytes)) => {
                    entry.touch();
                    if let Some(text) = carry.push(&bytes) {
                        if sink.send(SessionEvent::Output { session_id, data: text }).await.is_err() {
                            entry.begin_close(CloseReason::ClientGone);
                            break;
                        }
                    }
                }
                Ok(ChannelEvent::Eof) | Err(_) => {
                    shell_open = false;
                    entry.begin_close(CloseReason::RemoteClosed);
                    break;
                }
                Ok(ChannelEvent::Failed(message)) => {
                    shell_open = false;
                    transport_failed = true;
                    entry.begin_close(CloseReason::Error {
                        code: ErrorCode::ConnectFailed,
                        message: format!("remote connection lost: {message}"),
                    });
                    break;
                }
            },
            _ = sink.closed() => {
                entry.begin_close(CloseReason::ClientGone);
                break;
            }
        }
    }

    let reason = entry.take_reason();
    debug!(%session_id, ?reason, "session closing");

    if shell_open {
        let _ = entry.input.try_send(ChannelCommand::Close);
        if reason != CloseReason::ClientGone {
            let flush = async {
                while let Ok(event) = output.recv_async().await {
                    match event {
                        ChannelEvent::Output(bytes) => {
                            if let Some(text) = carry.push(&bytes) {
                                if sink.send(SessionEvent::Output { session_id, data: text }).await.is_err() {
                                    break;
                                }
                            }
                        }
                        ChannelEvent::Eof => break,
                        ChannelEvent::Failed(_) => {
                            transport_failed = true;
                            break;
                        }
                    }
                }
            };
            if tokio::time::timeout(inner.settings.flush_timeout, flush).await.is_err() {
                debug!(%session_id, "output flush timed out");
            }
        }
    }
    if let Some(rest) = carry.finish() {
        let _ = sink.send(SessionEvent::Output { session_id, data: rest }).await;
    }

    if transport_failed || !handle.is_alive() {
        inner.pool.discard(handle);
    } else {
        inner.pool.release(handle);
    }

    inner.sessions.remove(&session_id);
    inner.closed.fetch_add(1, Ordering::Relaxed);
    inner.publish_gauge();
    global_metrics().increment_counter(SESSIONS_CLOSED_TOTAL, &[]);
    entry.transition(SessionState::Closed);
    info!(%session_id, client_id = %entry.client_id, ?reason, "session closed");

    let _ = sink.send(SessionEvent::Closed { session_id, reason }).await;
}
