//! The seam between the pool and a concrete remote-shell transport.
//!
//! A [`Connector`] opens authenticated [`RemoteConnection`]s; each connection
//! can host one interactive [`ShellChannel`] at a time. Channel I/O runs over
//! bounded `flume` queues so blocking transports can pump from a plain thread.

use std::time::Duration;

use async_trait::async_trait;
use sm_core::error::{ErrorCode, HasErrorCode};
use sm_core::types::{Credential, Target};
use thiserror::Error;

/// Capacity of the per-channel output and input queues.
pub const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("could not reach {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("authentication rejected for {0}")]
    Auth(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection is closed")]
    Closed,
}

impl HasErrorCode for TransportError {
    fn code(&self) -> ErrorCode {
        match self {
            TransportError::Connect { .. } | TransportError::Timeout(_) => {
                ErrorCode::ConnectFailed
            }
            TransportError::Handshake(_)
            | TransportError::Channel(_)
            | TransportError::Closed => ErrorCode::HandshakeFailed,
            TransportError::Auth(_) => ErrorCode::AuthFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Shell channel
// ---------------------------------------------------------------------------

/// Terminal dimensions requested for a shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Remote to local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Output(Vec<u8>),
    /// The remote side closed the shell cleanly.
    Eof,
    /// The channel died; the connection should not be reused.
    Failed(String),
}

/// Local to remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Data(Vec<u8>),
    Resize(PtySize),
    Close,
}

/// An open interactive shell. Dropping `input` closes the shell too.
#[derive(Debug)]
pub struct ShellChannel {
    pub output: flume::Receiver<ChannelEvent>,
    pub input: flume::Sender<ChannelCommand>,
}

impl ShellChannel {
    /// Create the two queue pairs. Returns the channel plus the transport-side
    /// ends (`output` sender, `input` receiver).
    pub fn pair() -> (
        Self,
        flume::Sender<ChannelEvent>,
        flume::Receiver<ChannelCommand>,
    ) {
        let (out_tx, out_rx) = flume::bounded(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = flume::bounded(CHANNEL_CAPACITY);
        (
            Self {
                output: out_rx,
                input: in_tx,
            },
            out_tx,
            in_rx,
        )
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One authenticated transport connection.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Cheap local liveness flag; flips to `false` after any transport failure.
    fn is_alive(&self) -> bool;

    /// Active keepalive round. Errors mean the connection is unusable.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Start an interactive shell with a PTY of the given size.
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, TransportError>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

/// Opens connections to targets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// TCP connect, protocol handshake and authentication, bounded by `timeout`.
    async fn connect(
        &self,
        target: &Target,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteConnection>, TransportError>;
}
