//! WebSocket wire protocol.
//!
//! Every frame is one JSON text message tagged by `type`. Inbound frames are
//! decoded once into [`ClientMessage`]; anything that does not decode is a
//! [`ProtocolError`] answered with `error{code: "protocol_error"}`.

use serde::{Deserialize, Deserializer, Serialize};
use sm_core::error::{ErrorCode, HasErrorCode};
use sm_core::types::{Credential, SessionId, Target};
use thiserror::Error;

fn default_port() -> u16 {
    22
}

/// Client → server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
        username: String,
        /// A bare string is a password; an object carries a private key.
        #[serde(alias = "password", deserialize_with = "credential")]
        credential: Credential,
    },
    Data {
        session_id: SessionId,
        data: String,
    },
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    Disconnect {
        session_id: SessionId,
    },
    Ping {
        session_id: SessionId,
    },
}

impl ClientMessage {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
                session_id: None,
                reason: e.to_string(),
            })?;
        let session_id = value
            .get("session_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());

        match value.get("type").and_then(|t| t.as_str()) {
            None => Err(ProtocolError::Malformed {
                session_id,
                reason: "missing `type` field".into(),
            }),
            Some(kind) if !Self::KINDS.contains(&kind) => Err(ProtocolError::UnknownType {
                session_id,
                kind: kind.to_string(),
            }),
            Some(_) => serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
                session_id,
                reason: e.to_string(),
            }),
        }
    }

    const KINDS: &'static [&'static str] = &["connect", "data", "resize", "disconnect", "ping"];

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Connect { .. } => "connect",
            ClientMessage::Data { .. } => "data",
            ClientMessage::Resize { .. } => "resize",
            ClientMessage::Disconnect { .. } => "disconnect",
            ClientMessage::Ping { .. } => "ping",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCredential {
    Password(String),
    Key {
        private_key: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

fn credential<'de, D: Deserializer<'de>>(d: D) -> Result<Credential, D::Error> {
    Ok(match RawCredential::deserialize(d)? {
        RawCredential::Password(p) => Credential::Password(p),
        RawCredential::Key {
            private_key,
            passphrase,
        } => Credential::Key {
            private_key,
            passphrase: passphrase.filter(|p| !p.is_empty()),
        },
    })
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: SessionId,
    },
    Data {
        session_id: SessionId,
        data: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        code: ErrorCode,
        message: String,
    },
    Disconnected {
        session_id: SessionId,
    },
    Pong {
        session_id: SessionId,
    },
}

impl ServerMessage {
    pub fn error(session_id: Option<SessionId>, err: &(impl HasErrorCode + std::fmt::Display)) -> Self {
        ServerMessage::Error {
            session_id,
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::Data { .. } => "data",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Disconnected { .. } => "disconnected",
            ServerMessage::Pong { .. } => "pong",
        }
    }
}

/// The parts of a `connect` needed to open a session.
pub fn connect_target(host: &str, port: u16, username: &str) -> Result<Target, ProtocolError> {
    if host.trim().is_empty() || username.trim().is_empty() {
        return Err(ProtocolError::Malformed {
            session_id: None,
            reason: "connect needs a non-empty host and username".into(),
        });
    }
    if port == 0 {
        return Err(ProtocolError::Malformed {
            session_id: None,
            reason: "port must be between 1 and 65535".into(),
        });
    }
    Ok(Target::new(host.trim(), port, username.trim()))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {reason}")]
    Malformed {
        session_id: Option<SessionId>,
        reason: String,
    },

    #[error("unknown message type `{kind}`")]
    UnknownType {
        session_id: Option<SessionId>,
        kind: String,
    },

    #[error("binary frames are not supported")]
    Binary,
}

impl ProtocolError {
    /// Session the offending frame named, when it could be read.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            ProtocolError::Malformed { session_id, .. }
            | ProtocolError::UnknownType { session_id, .. } => *session_id,
            ProtocolError::Binary => None,
        }
    }
}

impl HasErrorCode for ProtocolError {
    fn code(&self) -> ErrorCode {
        ErrorCode::ProtocolError
    }
}
