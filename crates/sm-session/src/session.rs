//! Per-session data types shared by the registry and its consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sm_core::error::ErrorCode;
use sm_core::types::{ClientId, SessionId, SessionState, Target};
use tokio::sync::watch;

use crate::transport::ChannelCommand;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloseReason {
    /// `close_session` was called.
    Requested,
    /// No input or output for `session_timeout`.
    IdleTimeout,
    /// The remote shell exited.
    RemoteClosed,
    /// The owning client stopped listening for events.
    ClientGone,
    /// Transport failure.
    Error { code: ErrorCode, message: String },
}

impl CloseReason {
    /// The error to surface to the client, if this close was a failure.
    pub fn as_error(&self) -> Option<(ErrorCode, &str)> {
        match self {
            CloseReason::Error { code, message } => Some((*code, message.as_str())),
            _ => None,
        }
    }
}

/// Everything a session reports back to its owner, in order.
///
/// `Opened` always precedes the session's first `Output`, and `Closed` is
/// always the last event for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened {
        session_id: SessionId,
    },
    Output {
        session_id: SessionId,
        data: String,
    },
    Closed {
        session_id: SessionId,
        reason: CloseReason,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::Opened { session_id }
            | SessionEvent::Output { session_id, .. }
            | SessionEvent::Closed { session_id, .. } => *session_id,
        }
    }
}

/// Serializable snapshot of one session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub target: Target,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
}

// ---------------------------------------------------------------------------
// UTF-8 carry
// ---------------------------------------------------------------------------

/// Turns an arbitrary byte stream into text without splitting multi-byte
/// characters across chunks. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Feed bytes; returns the text that is complete so far, if any.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }

        let keep = rest.len();
        let drain_to = self.pending.len() - keep;
        self.pending.drain(..drain_to);
        (!out.is_empty()).then_some(out)
    }

    /// Flush whatever is left, lossily.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry-side record of a live session.
pub(crate) struct SessionEntry {
    pub id: SessionId,
    pub client_id: ClientId,
    pub target: Target,
    pub created_at: DateTime<Utc>,
    pub input: flume::Sender<ChannelCommand>,
    state: watch::Sender<SessionState>,
    reason: Mutex<Option<CloseReason>>,
    epoch: Instant,
    /// Millis since `epoch` of the last input or output.
    last_activity: AtomicU64,
}

impl SessionEntry {
    pub fn new(
        id: SessionId,
        client_id: ClientId,
        target: Target,
        input: flume::Sender<ChannelCommand>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id,
            client_id,
            target,
            created_at: Utc::now(),
            input,
            state,
            reason: Mutex::new(None),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Apply a state transition if the state machine allows it.
    pub fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Move Active → Closing, recording `reason`. Returns `false` when the
    /// session was already on its way out, in which case the first reason wins.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(&SessionState::Closing) {
                *lock(&self.reason) = Some(reason);
                *current = SessionState::Closing;
                true
            } else {
                false
            }
        })
    }

    pub fn take_reason(&self) -> CloseReason {
        lock(&self.reason).take().unwrap_or(CloseReason::Requested)
    }

    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            client_id: self.client_id,
            target: self.target.clone(),
            state: self.state(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
        }
    }
}
