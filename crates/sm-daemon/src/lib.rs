//! The shellmux server process.
//!
//! [`daemon::Daemon`] wires the connection pool, session registry,
//! multiplexer and AI chat service from a [`sm_core::config::Config`],
//! serves them over HTTP/WebSocket and owns the background loops.

pub mod daemon;

pub use daemon::{Backend, Daemon, DaemonIntervals};
