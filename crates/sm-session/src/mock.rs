//! In-process transport used by tests and by the daemon's `--mock` mode.
//!
//! Shells echo whatever they receive. Hosts can be scripted to refuse TCP,
//! reject credentials or fail to open a shell, and every open connection can
//! be dropped or hung up from the outside to simulate remote failures.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use sm_core::types::{Credential, Target};
use tokio::sync::Notify;
use tracing::debug;

use crate::transport::{
    ChannelCommand, ChannelEvent, Connector, PtySize, RemoteConnection, ShellChannel,
    TransportError,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// MockConnector
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    unreachable: Mutex<HashSet<String>>,
    reject_auth: Mutex<HashSet<String>>,
    shell_failures: Mutex<HashSet<String>>,
    connect_delay: Mutex<Duration>,
    banner: Mutex<Option<Vec<u8>>>,
    connections: Mutex<Vec<Weak<MockConnInner>>>,
    resizes: Mutex<Vec<PtySize>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    shells_opened: AtomicUsize,
    probes: AtomicUsize,
}

/// Scriptable [`Connector`]. Clones share state.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// TCP connects to `host` fail.
    pub fn unreachable(self, host: &str) -> Self {
        lock(&self.state.unreachable).insert(host.to_string());
        self
    }

    /// Authentication against `host` is rejected.
    pub fn reject_auth(self, host: &str) -> Self {
        lock(&self.state.reject_auth).insert(host.to_string());
        self
    }

    /// Connections to `host` succeed but cannot open a shell.
    pub fn fail_shell(self, host: &str) -> Self {
        lock(&self.state.shell_failures).insert(host.to_string());
        self
    }

    /// Every connect takes `delay` before completing.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *lock(&self.state.connect_delay) = delay;
        self
    }

    /// Each new shell emits `banner` before anything else.
    pub fn with_banner(self, banner: impl Into<Vec<u8>>) -> Self {
        *lock(&self.state.banner) = Some(banner.into());
        self
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn shells_opened(&self) -> usize {
        self.state.shells_opened.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn resizes(&self) -> Vec<PtySize> {
        lock(&self.state.resizes).clone()
    }

    /// Connections that have not been closed yet.
    pub fn live_connections(&self) -> usize {
        self.each_connection(|_| ()).len()
    }

    /// Simulate a network failure on every open connection.
    pub fn drop_all(&self) {
        self.each_connection(|conn| {
            conn.alive.store(false, Ordering::SeqCst);
            conn.end_shell(Some(ChannelEvent::Failed("connection reset by peer".into())));
        });
    }

    /// Every open shell exits cleanly; connections stay usable.
    pub fn hang_up_all(&self) {
        self.each_connection(|conn| conn.end_shell(Some(ChannelEvent::Eof)));
    }

    /// Keepalive probes start failing; open shells are untouched.
    pub fn mark_unhealthy_all(&self) {
        self.each_connection(|conn| conn.alive.store(false, Ordering::SeqCst));
    }

    fn each_connection<R>(&self, f: impl Fn(&MockConnInner) -> R) -> Vec<R> {
        let mut conns = lock(&self.state.connections);
        conns.retain(|w| {
            w.upgrade()
                .map(|c| !c.closed.load(Ordering::SeqCst))
                .unwrap_or(false)
        });
        conns.iter().filter_map(Weak::upgrade).map(|c| f(c.as_ref())).collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &Target,
        _credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteConnection>, TransportError> {
        let delay = *lock(&self.state.connect_delay);
        if !delay.is_zero() {
            tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .map_err(|_| TransportError::Timeout(timeout))?;
        }

        if lock(&self.state.unreachable).contains(&target.host) {
            return Err(TransportError::Connect {
                target: target.to_string(),
                reason: "connection refused".into(),
            });
        }
        if lock(&self.state.reject_auth).contains(&target.host) {
            return Err(TransportError::Auth(target.username.clone()));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::new(MockConnInner {
            host: target.host.clone(),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            shell: Mutex::new(None),
            state: self.state.clone(),
        });
        lock(&self.state.connections).push(Arc::downgrade(&inner));
        debug!(%target, "mock connection opened");
        Ok(Box::new(MockConnection { inner }))
    }
}

// ---------------------------------------------------------------------------
// MockConnection
// ---------------------------------------------------------------------------

struct ShellControl {
    output: flume::Sender<ChannelEvent>,
    stop: Arc<Notify>,
}

struct MockConnInner {
    host: String,
    alive: AtomicBool,
    closed: AtomicBool,
    shell: Mutex<Option<ShellControl>>,
    state: Arc<MockState>,
}

impl MockConnInner {
    fn end_shell(&self, last: Option<ChannelEvent>) {
        if let Some(ctl) = lock(&self.shell).take() {
            if let Some(ev) = last {
                let _ = ctl.output.try_send(ev);
            }
            ctl.stop.notify_one();
        }
    }
}

pub struct MockConnection {
    inner: Arc<MockConnInner>,
}

#[async_trait]
impl RemoteConnection for MockConnection {
    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.inner.state.probes.fetch_add(1, Ordering::SeqCst);
        if self.is_alive() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        if lock(&self.inner.state.shell_failures).contains(&self.inner.host) {
            return Err(TransportError::Channel("pty request denied".into()));
        }

        let (channel, out_tx, in_rx) = ShellChannel::pair();
        if let Some(banner) = lock(&self.inner.state.banner).clone() {
            let _ = out_tx.try_send(ChannelEvent::Output(banner));
        }
        let stop = Arc::new(Notify::new());
        *lock(&self.inner.shell) = Some(ShellControl {
            output: out_tx.clone(),
            stop: stop.clone(),
        });
        self.inner.state.shells_opened.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.state.resizes).push(size);

        let state = self.inner.state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    cmd = in_rx.recv_async() => match cmd {
                        Ok(ChannelCommand::Data(bytes)) => {
                            tokio::select! {
                                _ = stop.notified() => break,
                                sent = out_tx.send_async(ChannelEvent::Output(bytes)) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(ChannelCommand::Resize(size)) => lock(&state.resizes).push(size),
                        Ok(ChannelCommand::Close) => {
                            let _ = out_tx.try_send(ChannelEvent::Eof);
                            break;
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        Ok(channel)
    }

    async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.end_shell(None);
            self.inner.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
