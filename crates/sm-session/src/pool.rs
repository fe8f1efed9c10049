//! Bounded pool of authenticated remote connections.
//!
//! Every live connection, idle or leased, owns one permit of a semaphore
//! sized `max_sessions`, so the pool can never hold more live connections
//! than that. Idle connections are keyed by target + credential fingerprint
//! and are only handed back to requests with the same key.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sm_core::config::Config;
use sm_core::error::{ErrorCode, HasErrorCode};
use sm_core::types::{Credential, CredentialFingerprint, HandleId, Target};
use sm_harness::shutdown::ShutdownSignal;
use sm_telemetry::metrics::{global_metrics, POOL_ACQUIRE_SECONDS};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::{Connector, RemoteConnection, TransportError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection pool exhausted ({max} connections busy, waited {waited:?})")]
    Exhausted { max: usize, waited: Duration },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl From<TransportError> for PoolError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Auth(_) => PoolError::Auth(err.to_string()),
            TransportError::Connect { .. } | TransportError::Timeout(_) => {
                PoolError::Connect(err.to_string())
            }
            other => PoolError::Handshake(other.to_string()),
        }
    }
}

impl HasErrorCode for PoolError {
    fn code(&self) -> ErrorCode {
        match self {
            PoolError::Exhausted { .. } => ErrorCode::PoolExhausted,
            PoolError::Connect(_) => ErrorCode::ConnectFailed,
            PoolError::Handshake(_) => ErrorCode::HandshakeFailed,
            PoolError::Auth(_) => ErrorCode::AuthFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub idle_ttl: Duration,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub reap_interval: Duration,
    pub max_lifetime: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.max_sessions,
            idle_ttl: config.pool.idle_ttl(),
            acquire_timeout: config.pool.acquire_timeout(),
            connect_timeout: config.pool.connect_timeout(),
            reap_interval: config.pool.reap_interval(),
            max_lifetime: config.pool.max_lifetime(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Key / entries
// ---------------------------------------------------------------------------

/// Idle connections are only reused for an identical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub target: Target,
    pub fingerprint: CredentialFingerprint,
}

impl PoolKey {
    pub fn new(target: &Target, credential: &Credential) -> Self {
        Self {
            target: target.clone(),
            fingerprint: credential.fingerprint(&target.username),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.target, self.fingerprint.short())
    }
}

/// A live connection plus the capacity slot it occupies.
struct Slot {
    id: HandleId,
    key: PoolKey,
    conn: Arc<dyn RemoteConnection>,
    permit: OwnedSemaphorePermit,
    created_at: Instant,
    last_used: Instant,
}

impl Slot {
    fn expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() >= max_lifetime
    }
}

#[derive(Debug, Clone, Copy)]
struct LeaseInfo {
    since: Instant,
}

// ---------------------------------------------------------------------------
// PoolHandle
// ---------------------------------------------------------------------------

/// Exclusive lease on one pooled connection.
///
/// Give it back with [`ConnectionPool::release`] or
/// [`ConnectionPool::discard`]. Dropping it without doing either discards the
/// connection.
pub struct PoolHandle {
    slot: Option<Slot>,
    pool: Arc<PoolInner>,
}

impl PoolHandle {
    pub fn id(&self) -> HandleId {
        self.slot.as_ref().map(|s| s.id).unwrap_or_default()
    }

    pub fn key(&self) -> Option<&PoolKey> {
        self.slot.as_ref().map(|s| &s.key)
    }

    /// The underlying connection. `None` only after the lease was returned.
    pub fn connection(&self) -> Option<&Arc<dyn RemoteConnection>> {
        self.slot.as_ref().map(|s| &s.conn)
    }

    pub fn is_alive(&self) -> bool {
        self.slot.as_ref().map(|s| s.conn.is_alive()).unwrap_or(false)
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("id", &self.id())
            .field("key", &self.key().map(ToString::to_string))
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            warn!(handle_id = %slot.id, "pool handle dropped without release, discarding");
            self.pool.leased.remove(&slot.id);
            self.pool.retire(slot, "dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    evicted: AtomicU64,
    reaped: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time pool figures.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub max: usize,
    /// Live connections (idle + in use).
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub created: u64,
    pub reused: u64,
    pub released: u64,
    pub discarded: u64,
    pub evicted: u64,
    pub reaped: u64,
    pub exhausted: u64,
}

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: usize,
    pub unhealthy: usize,
    pub kept: usize,
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

struct PoolInner {
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    capacity: Arc<Semaphore>,
    idle: DashMap<PoolKey, Vec<Slot>>,
    idle_count: AtomicUsize,
    leased: DashMap<HandleId, LeaseInfo>,
    waiting: AtomicUsize,
    freed: Notify,
    counters: Counters,
}

impl PoolInner {
    /// Close a connection in the background and free its capacity slot.
    fn retire(&self, slot: Slot, why: &'static str) {
        debug!(handle_id = %slot.id, key = %slot.key, why, "retiring connection");
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        let Slot { conn, permit, .. } = slot;
        drop(permit);
        self.freed.notify_waiters();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move { conn.close().await });
        }
    }

    fn take_idle(&self, key: &PoolKey) -> Option<Slot> {
        let mut entry = self.idle.get_mut(key)?;
        let slot = entry.pop();
        if slot.is_some() {
            self.idle_count.fetch_sub(1, Ordering::Relaxed);
        }
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.idle.remove_if(key, |_, v| v.is_empty());
        }
        slot
    }

    /// Remove the least recently used idle connection whose key differs from
    /// `keep`.
    fn take_lru_idle_except(&self, keep: &PoolKey) -> Option<Slot> {
        let victim_key = self
            .idle
            .iter()
            .filter(|e| e.key() != keep)
            .filter_map(|e| e.value().first().map(|s| (e.key().clone(), s.last_used)))
            .min_by_key(|(_, used)| *used)
            .map(|(k, _)| k)?;

        let mut entry = self.idle.get_mut(&victim_key)?;
        if entry.is_empty() {
            return None;
        }
        let slot = entry.remove(0);
        self.idle_count.fetch_sub(1, Ordering::Relaxed);
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.idle.remove_if(&victim_key, |_, v| v.is_empty());
        }
        Some(slot)
    }

    fn park(&self, mut slot: Slot) {
        slot.last_used = Instant::now();
        // Oldest first, so LRU eviction takes index 0 and reuse pops the freshest.
        self.idle.entry(slot.key.clone()).or_default().push(slot);
        self.idle_count.fetch_add(1, Ordering::Relaxed);
        self.freed.notify_waiters();
    }
}

/// Shared, cloneable pool of remote connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, settings: PoolSettings) -> Self {
        info!(
            max = settings.max_connections,
            idle_ttl = ?settings.idle_ttl,
            acquire_timeout = ?settings.acquire_timeout,
            "creating connection pool"
        );
        Self {
            inner: Arc::new(PoolInner {
                capacity: Arc::new(Semaphore::new(settings.max_connections)),
                settings,
                connector,
                idle: DashMap::new(),
                idle_count: AtomicUsize::new(0),
                leased: DashMap::new(),
                waiting: AtomicUsize::new(0),
                freed: Notify::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Lease a connection for `target`.
    ///
    /// Reuses a healthy idle connection with the same key, otherwise opens a
    /// new one if capacity allows, otherwise evicts another key's idle
    /// connection, otherwise waits for capacity up to `acquire_timeout`.
    pub async fn acquire(&self, target: &Target, credential: &Credential) -> Result<PoolHandle> {
        let inner = &self.inner;
        let key = PoolKey::new(target, credential);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + inner.settings.acquire_timeout;

        loop {
            let freed = inner.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            while let Some(slot) = inner.take_idle(&key) {
                if slot.conn.is_alive() && !slot.expired(inner.settings.max_lifetime) {
                    inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                    debug!(handle_id = %slot.id, %key, "reusing idle connection");
                    return Ok(self.lease(slot, started));
                }
                inner.retire(slot, "stale on reuse");
            }

            if let Ok(permit) = inner.capacity.clone().try_acquire_owned() {
                let slot = self.open(key.clone(), credential, permit).await?;
                return Ok(self.lease(slot, started));
            }

            if let Some(victim) = inner.take_lru_idle_except(&key) {
                inner.counters.evicted.fetch_add(1, Ordering::Relaxed);
                debug!(handle_id = %victim.id, victim = %victim.key, for_key = %key, "evicting idle connection");
                inner.retire(victim, "evicted");
                continue;
            }

            inner.waiting.fetch_add(1, Ordering::Relaxed);
            let woke = tokio::time::timeout_at(deadline, freed).await;
            inner.waiting.fetch_sub(1, Ordering::Relaxed);
            if woke.is_err() {
                inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                let waited = started.elapsed();
                warn!(%key, ?waited, "connection pool exhausted");
                return Err(PoolError::Exhausted {
                    max: inner.settings.max_connections,
                    waited,
                });
            }
        }
    }

    async fn open(
        &self,
        key: PoolKey,
        credential: &Credential,
        permit: OwnedSemaphorePermit,
    ) -> Result<Slot> {
        let inner = &self.inner;
        let timeout = inner.settings.connect_timeout;
        let connected = tokio::time::timeout(
            timeout,
            inner.connector.connect(&key.target, credential, timeout),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout(timeout)));

        match connected {
            Ok(conn) => {
                inner.counters.created.fetch_add(1, Ordering::Relaxed);
                let now = Instant::now();
                let slot = Slot {
                    id: HandleId::new(),
                    key,
                    conn: Arc::from(conn),
                    permit,
                    created_at: now,
                    last_used: now,
                };
                info!(handle_id = %slot.id, key = %slot.key, "opened remote connection");
                Ok(slot)
            }
            Err(e) => {
                drop(permit);
                inner.freed.notify_waiters();
                warn!(%key, error = %e, "remote connect failed");
                Err(e.into())
            }
        }
    }

    fn lease(&self, slot: Slot, started: Instant) -> PoolHandle {
        self.inner
            .leased
            .insert(slot.id, LeaseInfo { since: Instant::now() });
        global_metrics().record_histogram(POOL_ACQUIRE_SECONDS, started.elapsed().as_secs_f64());
        PoolHandle {
            slot: Some(slot),
            pool: self.inner.clone(),
        }
    }

    /// Return a lease. Healthy connections go back to the idle set; dead or
    /// over-age ones are closed and their slot freed.
    ///
    /// Returning a handle this pool does not have on lease is an invariant
    /// violation: the connection is closed and the event logged.
    pub fn release(&self, mut handle: PoolHandle) {
        let Some(slot) = handle.slot.take() else {
            error!("release of an already-returned pool handle");
            return;
        };
        let inner = &self.inner;

        if !Arc::ptr_eq(&handle.pool, inner) || inner.leased.remove(&slot.id).is_none() {
            error!(handle_id = %slot.id, key = %slot.key, "release of a handle that is not on lease, discarding");
            handle.pool.leased.remove(&slot.id);
            handle.pool.retire(slot, "invariant violation");
            return;
        }

        if !slot.conn.is_alive() {
            inner.retire(slot, "unhealthy on release");
        } else if slot.expired(inner.settings.max_lifetime) {
            inner.retire(slot, "max lifetime reached");
        } else {
            inner.counters.released.fetch_add(1, Ordering::Relaxed);
            debug!(handle_id = %slot.id, key = %slot.key, "connection returned to idle set");
            inner.park(slot);
        }
    }

    /// Return a lease whose connection must not be reused.
    pub fn discard(&self, mut handle: PoolHandle) {
        if let Some(slot) = handle.slot.take() {
            if handle.pool.leased.remove(&slot.id).is_none() {
                error!(handle_id = %slot.id, "discard of a handle that is not on lease");
            }
            handle.pool.retire(slot, "discarded by holder");
        }
    }

    /// One reaper pass: close idle connections past `idle_ttl` or
    /// `max_lifetime`, then probe the rest and close any that fail.
    pub async fn reap(&self) -> ReapReport {
        let inner = &self.inner;
        let mut report = ReapReport::default();
        let keys: Vec<PoolKey> = inner.idle.iter().map(|e| e.key().clone()).collect();

        for key in keys {
            let Some((_, slots)) = inner.idle.remove(&key) else {
                continue;
            };
            inner.idle_count.fetch_sub(slots.len(), Ordering::Relaxed);

            let mut survivors = Vec::with_capacity(slots.len());
            for slot in slots {
                if slot.last_used.elapsed() >= inner.settings.idle_ttl
                    || slot.expired(inner.settings.max_lifetime)
                {
                    report.expired += 1;
                    inner.retire(slot, "idle ttl");
                    continue;
                }
                let probe = tokio::time::timeout(inner.settings.connect_timeout, slot.conn.probe())
                    .await
                    .unwrap_or(Err(TransportError::Timeout(inner.settings.connect_timeout)));
                match probe {
                    Ok(()) => survivors.push(slot),
                    Err(e) => {
                        report.unhealthy += 1;
                        debug!(handle_id = %slot.id, error = %e, "keepalive probe failed");
                        inner.retire(slot, "keepalive failed");
                    }
                }
            }

            report.kept += survivors.len();
            if !survivors.is_empty() {
                inner.idle_count.fetch_add(survivors.len(), Ordering::Relaxed);
                let mut entry = inner.idle.entry(key).or_default();
                // Anything parked meanwhile is newer than the survivors.
                let parked = std::mem::take(&mut *entry);
                *entry = survivors;
                entry.extend(parked);
                drop(entry);
                inner.freed.notify_waiters();
            }
        }

        let reaped = (report.expired + report.unhealthy) as u64;
        inner.counters.reaped.fetch_add(reaped, Ordering::Relaxed);
        if reaped > 0 {
            info!(expired = report.expired, unhealthy = report.unhealthy, "pool reaper pass");
        }
        report
    }

    /// Run [`reap`](Self::reap) every `reap_interval` until shutdown.
    pub fn spawn_reaper(&self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.settings.reap_interval);
            ticker.tick().await;
            let mut stop = shutdown.listener();
            loop {
                tokio::select! {
                    _ = ticker.tick() => { pool.reap().await; }
                    _ = stop.wait() => {
                        debug!("pool reaper stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Close every idle connection. Leased ones are left to their holders.
    pub async fn close_idle(&self) -> usize {
        let inner = &self.inner;
        let keys: Vec<PoolKey> = inner.idle.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for key in keys {
            if let Some((_, slots)) = inner.idle.remove(&key) {
                inner.idle_count.fetch_sub(slots.len(), Ordering::Relaxed);
                for slot in slots {
                    closed += 1;
                    slot.conn.close().await;
                    inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    drop(slot.permit);
                }
            }
        }
        inner.freed.notify_waiters();
        if closed > 0 {
            info!(closed, "closed idle connections");
        }
        closed
    }

    /// Connections currently on lease together with how long they have been out.
    pub fn leases(&self) -> Vec<(HandleId, Duration)> {
        self.inner
            .leased
            .iter()
            .map(|e| (*e.key(), e.value().since.elapsed()))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let c = &inner.counters;
        let max = inner.settings.max_connections;
        PoolStats {
            max,
            size: max.saturating_sub(inner.capacity.available_permits()),
            idle: inner.idle_count.load(Ordering::Relaxed),
            in_use: inner.leased.len(),
            waiting: inner.waiting.load(Ordering::Relaxed),
            created: c.created.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            reaped: c.reaped.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
        }
    }
}
