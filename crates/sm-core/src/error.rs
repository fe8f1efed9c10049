use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, client-facing error codes carried in `error` messages and
/// HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailed,
    ConnectFailed,
    HandshakeFailed,
    PoolExhausted,
    SessionNotFound,
    ProfileNotFound,
    ProtocolError,
    CacheComputeError,
    RateLimited,
    Unauthorized,
    UnsupportedProvider,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::ConnectFailed => "connect_failed",
            ErrorCode::HandshakeFailed => "handshake_failed",
            ErrorCode::PoolExhausted => "pool_exhausted",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::ProfileNotFound => "profile_not_found",
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::CacheComputeError => "cache_compute_error",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::UnsupportedProvider => "unsupported_provider",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error that can reach a client.
pub trait HasErrorCode {
    fn code(&self) -> ErrorCode;
}
