//! SSH transport on top of `ssh2` (libssh2).
//!
//! libssh2 is blocking, so connect/handshake/auth and shell setup run on the
//! blocking pool, and each open shell gets a dedicated pump thread that
//! drives the channel in non-blocking mode.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sm_core::types::{Credential, Target};
use ssh2::{Channel, HashType, Session};
use tracing::{debug, info, warn};

use crate::transport::{
    ChannelCommand, ChannelEvent, Connector, PtySize, RemoteConnection, ShellChannel,
    TransportError,
};

/// Sleep between pump iterations that moved no data.
const PUMP_IDLE_SLEEP: Duration = Duration::from_millis(10);
/// Unwritten input the pump holds before it stops reading the input queue.
const MAX_PENDING_INPUT: usize = 64 * 1024;
/// Seconds between libssh2 keepalive messages.
const KEEPALIVE_INTERVAL_SECS: u32 = 30;
const TERM: &str = "xterm-256color";

/// `LIBSSH2_ERROR_EAGAIN`
const EAGAIN: i32 = -37;

fn is_would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(EAGAIN))
}

// ---------------------------------------------------------------------------
// SshConnector
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }

    fn connect_blocking(
        target: &Target,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Session, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            target: target.to_string(),
            reason,
        };

        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("host did not resolve".into()))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == ErrorKind::TimedOut {
                TransportError::Timeout(timeout)
            } else {
                connect_err(e.to_string())
            }
        })?;
        let _ = tcp.set_nodelay(true);

        let mut session = Session::new().map_err(|e| TransportError::Handshake(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        if let Some(hash) = session.host_key_hash(HashType::Sha256) {
            let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
            debug!(%target, host_key_sha256 = %hex, "ssh host key");
        }

        let auth = match credential {
            Credential::Password(password) => {
                session.userauth_password(&target.username, password)
            }
            Credential::Key {
                private_key,
                passphrase,
            } => session.userauth_pubkey_memory(
                &target.username,
                None,
                private_key,
                passphrase.as_deref(),
            ),
        };
        if let Err(e) = auth {
            debug!(%target, error = %e, "ssh authentication failed");
            return Err(TransportError::Auth(target.username.clone()));
        }
        if !session.authenticated() {
            return Err(TransportError::Auth(target.username.clone()));
        }

        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
        info!(%target, "ssh session authenticated");
        Ok(session)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &Target,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteConnection>, TransportError> {
        let t = target.clone();
        let c = credential.clone();
        let work = tokio::task::spawn_blocking(move || Self::connect_blocking(&t, &c, timeout));

        let session = tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::Handshake(format!("connect task failed: {e}")))??;

        Ok(Box::new(SshConnection {
            session: Arc::new(session),
            alive: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            label: target.to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// SshConnection
// ---------------------------------------------------------------------------

pub struct SshConnection {
    session: Arc<Session>,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    label: String,
}

impl SshConnection {
    fn open_blocking(session: &Session, size: PtySize) -> Result<Channel, TransportError> {
        session.set_blocking(true);
        let mut channel = session
            .channel_session()
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        channel
            .request_pty(
                TERM,
                None,
                Some((size.cols as u32, size.rows as u32, 0, 0)),
            )
            .map_err(|e| TransportError::Channel(format!("pty request: {e}")))?;
        channel
            .shell()
            .map_err(|e| TransportError::Channel(format!("shell: {e}")))?;
        session.set_blocking(false);
        Ok(channel)
    }
}

#[async_trait]
impl RemoteConnection for SshConnection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let session = self.session.clone();
        let result = tokio::task::spawn_blocking(move || match session.keepalive_send() {
            Ok(_) => Ok(()),
            Err(e) if is_would_block(&e) => Ok(()),
            Err(e) => Err(TransportError::Channel(format!("keepalive: {e}"))),
        })
        .await
        .map_err(|e| TransportError::Channel(e.to_string()))
        .and_then(|r| r);

        if result.is_err() {
            self.alive.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        let session = self.session.clone();
        let channel = tokio::task::spawn_blocking(move || Self::open_blocking(&session, size))
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))??;

        let (shell, out_tx, in_rx) = ShellChannel::pair();
        let alive = self.alive.clone();
        let label = self.label.clone();
        std::thread::Builder::new()
            .name("ssh-pump".into())
            .spawn(move || pump(channel, out_tx, in_rx, alive, label))
            .map_err(|e| TransportError::Channel(format!("spawn pump thread: {e}")))?;
        Ok(shell)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        let session = self.session.clone();
        let _ = tokio::task::spawn_blocking(move || {
            session.set_blocking(true);
            let _ = session.disconnect(None, "closing", None);
        })
        .await;
        debug!(target = %self.label, "ssh connection closed");
    }
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

/// Moves bytes between a non-blocking channel and the flume queues until
/// either side ends.
fn pump(
    mut channel: Channel,
    output: flume::Sender<ChannelEvent>,
    input: flume::Receiver<ChannelCommand>,
    alive: Arc<AtomicBool>,
    label: String,
) {
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    let mut pending_resize: Option<PtySize> = None;

    let last = loop {
        let mut progressed = false;

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    break Some(ChannelEvent::Eof);
                }
            }
            Ok(n) => {
                progressed = true;
                if output.send(ChannelEvent::Output(buf[..n].to_vec())).is_err() {
                    break None;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                alive.store(false, Ordering::SeqCst);
                break Some(ChannelEvent::Failed(e.to_string()));
            }
        }

        let close_requested = drain_input(&input, &mut pending, &mut pending_resize);

        if !pending.is_empty() {
            match channel.write(&pending) {
                Ok(n) => {
                    pending.drain(..n);
                    progressed = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    alive.store(false, Ordering::SeqCst);
                    break Some(ChannelEvent::Failed(e.to_string()));
                }
            }
        }

        if let Some(size) = pending_resize {
            match channel.request_pty_size(size.cols as u32, size.rows as u32, None, None) {
                Ok(()) => pending_resize = None,
                Err(e) if is_would_block(&e) => {}
                Err(e) => {
                    warn!(target = %label, error = %e, "pty resize failed");
                    pending_resize = None;
                }
            }
        }

        if close_requested {
            let _ = channel.flush();
            break None;
        }

        if !progressed {
            std::thread::sleep(PUMP_IDLE_SLEEP);
        }
    };

    if let Some(event) = last {
        let _ = output.send(event);
    }
    let _ = channel.close();
    debug!(target = %label, "ssh pump finished");
}

/// Move queued commands into `pending` / `pending_resize`. Returns `true`
/// once a close was requested or every sender is gone.
///
/// Stops at [`MAX_PENDING_INPUT`] so a stalled remote window leaves data in
/// the bounded queue and senders wait.
fn drain_input(
    input: &flume::Receiver<ChannelCommand>,
    pending: &mut Vec<u8>,
    pending_resize: &mut Option<PtySize>,
) -> bool {
    while pending.len() < MAX_PENDING_INPUT {
        match input.try_recv() {
            Ok(ChannelCommand::Data(bytes)) => pending.extend_from_slice(&bytes),
            Ok(ChannelCommand::Resize(size)) => *pending_resize = Some(size),
            Ok(ChannelCommand::Close) | Err(flume::TryRecvError::Disconnected) => return true,
            Err(flume::TryRecvError::Empty) => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_stops_at_the_pending_cap() {
        let (tx, rx) = flume::bounded(8);
        for _ in 0..4 {
            tx.send(ChannelCommand::Data(vec![b'x'; 40 * 1024])).unwrap();
        }
        let mut pending = Vec::new();
        let mut resize = None;

        assert!(!drain_input(&rx, &mut pending, &mut resize));
        assert_eq!(pending.len(), 80 * 1024);
        assert_eq!(rx.len(), 2);

        // Nothing more is taken until the remote drains what is held.
        assert!(!drain_input(&rx, &mut pending, &mut resize));
        assert_eq!(rx.len(), 2);

        pending.clear();
        tx.send(ChannelCommand::Close).unwrap();
        assert!(!drain_input(&rx, &mut pending, &mut resize));
        assert_eq!(rx.len(), 1);
        pending.clear();
        assert!(drain_input(&rx, &mut pending, &mut resize));
    }

    #[test]
    fn resize_and_disconnect_are_reported() {
        let (tx, rx) = flume::bounded(4);
        tx.send(ChannelCommand::Resize(PtySize { cols: 120, rows: 40 })).unwrap();
        drop(tx);
        let mut pending = Vec::new();
        let mut resize = None;
        assert!(drain_input(&rx, &mut pending, &mut resize));
        assert_eq!(resize, Some(PtySize { cols: 120, rows: 40 }));
        assert!(pending.is_empty());
    }
}
