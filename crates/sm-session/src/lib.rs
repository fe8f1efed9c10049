//! Remote shell sessions for shellmux.
//!
//! A [`pool::ConnectionPool`] bounds and recycles authenticated transport
//! connections; the [`registry::SessionRegistry`] runs interactive shells on
//! leased connections and streams their output to per-client event sinks.
//! Transports plug in through [`transport::Connector`]: [`ssh`] for real
//! hosts and [`mock`] for tests and demo mode.

pub mod mock;
pub mod pool;
pub mod registry;
pub mod session;
#[cfg(feature = "ssh")]
pub mod ssh;
pub mod transport;

pub use pool::{ConnectionPool, PoolError, PoolHandle, PoolSettings, PoolStats};
pub use registry::{EventSink, RegistrySettings, SessionError, SessionRegistry};
pub use session::{CloseReason, SessionEvent, SessionInfo};
