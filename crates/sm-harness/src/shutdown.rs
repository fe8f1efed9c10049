use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative shutdown coordinator shared by the background loops (pool
/// reaper, idle sweeper, metrics reporter) and the HTTP server.
///
/// The triggered flag lives in a `watch` channel, so a task that subscribes
/// after `trigger()` still observes it.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let mut listener = shutdown.listener();
///
/// tokio::select! {
///     _ = listener.wait() => { /* graceful cleanup */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    triggered: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (triggered, _) = watch::channel(false);
        Self {
            triggered: Arc::new(triggered),
        }
    }

    /// A handle whose `wait()` resolves once shutdown is triggered.
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.triggered.subscribe(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.triggered.borrow()
    }

    /// Trigger shutdown. Idempotent.
    pub fn trigger(&self) {
        let fired = self.triggered.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        });
        if fired {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolves once shutdown is triggered.
    pub async fn wait(&self) {
        self.listener().wait().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub async fn wait(&mut self) {
        // The sender lives inside the signal; if every signal clone is gone
        // nobody can trigger anymore, which we treat as shutdown too.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
