use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use sm_bridge::http_api::{api_router, AppState};
use sm_bridge::multiplexer::{Multiplexer, MuxSettings};
use sm_bridge::ws::WsSettings;
use sm_core::config::Config;
use sm_harness::rate_limiter::ServiceLimits;
use sm_harness::shutdown::ShutdownSignal;
use sm_intelligence::chat::{AiChatService, FixedProviderFactory, HttpProviderFactory, ProviderFactory};
use sm_intelligence::llm::MockProvider;
use sm_session::mock::MockConnector;
use sm_session::pool::{ConnectionPool, PoolSettings};
use sm_session::registry::{RegistrySettings, SessionRegistry};
use sm_session::transport::Connector;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which remote transport and AI backend the daemon wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Real SSH hosts and HTTP AI providers.
    #[default]
    Live,
    /// In-process echo shells and canned AI answers. No network access.
    Mock,
}

/// Configuration for daemon loop intervals.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// How often gauges are sampled and caches pruned (default: 15s).
    pub report_secs: u64,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self { report_secs: 15 }
    }
}

/// The shellmux server process: connection pool, session registry,
/// multiplexer and AI chat behind one axum router.
///
/// Background loops (pool reaper, idle-session sweeper, metrics reporter)
/// stop when the `ShutdownSignal` fires; the HTTP server then drains and
/// every session and pooled connection is closed.
pub struct Daemon {
    config: Config,
    state: Arc<AppState>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build a daemon around explicit transport and AI backends.
    pub fn with_parts(
        config: Config,
        connector: Arc<dyn Connector>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        let pool = ConnectionPool::new(connector, PoolSettings::from_config(&config));
        let registry = SessionRegistry::new(pool, RegistrySettings::from_config(&config));
        let limits = Arc::new(ServiceLimits::per_minute(
            config.rate_limit.connect_per_minute,
            config.rate_limit.ai_per_minute,
        ));
        let mux = Multiplexer::new(registry, limits.clone(), MuxSettings::from_config(&config));
        let chat = Arc::new(AiChatService::from_config(&config, providers));
        let state = Arc::new(AppState::new(mux, chat, limits, WsSettings::from_config(&config)));

        Self {
            config,
            state,
            intervals: DaemonIntervals::default(),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn new(config: Config, backend: Backend) -> Result<Self> {
        let (connector, providers) = backends(backend)?;
        info!(?backend, "backends selected");
        Ok(Self::with_parts(config, connector, providers))
    }

    /// Override the default loop intervals.
    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> Router {
        api_router(
            self.state.clone(),
            self.config.security.api_key(),
            &self.config.security.allowed_origins,
        )
    }

    /// Spawn the pool reaper, idle sweeper and metrics reporter.
    pub fn spawn_background_loops(&self) -> Vec<JoinHandle<()>> {
        let registry = self.state.registry();
        vec![
            registry.pool().spawn_reaper(self.shutdown.clone()),
            registry.spawn_sweeper(self.shutdown.clone()),
            tokio::spawn(Self::report_loop(
                self.state.clone(),
                Duration::from_secs(self.intervals.report_secs.max(1)),
                self.shutdown.clone(),
            )),
        ]
    }

    async fn report_loop(state: Arc<AppState>, every: Duration, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(every);
        let mut stop = shutdown.listener();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snap = state.publish_gauges();
                    let expired = state.chat.purge_expired();
                    let pruned = state.limits.prune();
                    debug!(
                        sessions = snap.sessions.active,
                        pool_size = snap.pool.size,
                        pool_idle = snap.pool.idle,
                        clients = snap.clients.clients,
                        cache_entries = snap.cache.entries,
                        expired,
                        pruned,
                        "stats sampled"
                    );
                }
                _ = stop.wait() => {
                    debug!("metrics reporter stopping");
                    break;
                }
            }
        }
    }

    /// Serve on a pre-bound listener until shutdown, then close everything.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr().context("listener has no local address")?;
        if self.config.security.api_key().is_some() {
            info!("API key authentication enabled");
        } else {
            warn!(
                env = %self.config.security.api_key_env,
                "no API key configured, authentication disabled"
            );
        }

        let loops = self.spawn_background_loops();
        let router = self.router();
        let shutdown = self.shutdown.clone();
        let mux = self.state.mux.clone();
        info!(%bind_addr, max_sessions = self.config.max_sessions, "shellmux listening");

        // Upgraded sockets outlive the HTTP connection, so close them here
        // rather than waiting for clients to hang up.
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.wait().await;
                let sessions = mux.close_all().await;
                info!(sessions, "websocket clients closed");
            })
            .await;
        if let Err(e) = &served {
            error!(error = %e, "API server error");
        }
        // The server can also stop on its own; make sure the loops follow.
        if !self.shutdown.is_shutting_down() {
            self.shutdown.trigger();
        }

        self.drain().await;
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        info!("daemon stopped");
        served.context("API server failed")
    }

    /// Bind `server.host:server.port` and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.config.server.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Close every client, then any sessions left over, then idle connections.
    pub async fn drain(&self) {
        let client_sessions = self.state.mux.close_all().await;
        let orphaned = self.state.registry().close_all().await;
        let idle = self.state.registry().pool().close_idle().await;
        info!(client_sessions, orphaned, idle, "drained sessions and pooled connections");
    }
}

fn backends(backend: Backend) -> Result<(Arc<dyn Connector>, Arc<dyn ProviderFactory>)> {
    match backend {
        Backend::Mock => Ok((
            Arc::new(MockConnector::new()),
            Arc::new(FixedProviderFactory::new(Arc::new(MockProvider::new()))),
        )),
        Backend::Live => Ok((live_connector()?, Arc::new(HttpProviderFactory::new()))),
    }
}

#[cfg(feature = "ssh")]
fn live_connector() -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(sm_session::ssh::SshConnector::new()))
}

#[cfg(not(feature = "ssh"))]
fn live_connector() -> Result<Arc<dyn Connector>> {
    anyhow::bail!("built without the `ssh` feature; run with --mock")
}
