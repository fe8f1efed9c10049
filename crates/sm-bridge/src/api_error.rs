//! HTTP API error type.
//!
//! Every error body is `{"error": <message>, "code": <stable code>}` so HTTP
//! clients see the same codes as WebSocket clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sm_core::error::{ErrorCode, HasErrorCode};
use sm_intelligence::chat::ChatError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// An error with a client-facing code.
    #[error("{message}")]
    Coded { code: ErrorCode, message: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        ApiError::Coded {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Coded { code, .. } => *code,
            ApiError::BadRequest(_) => ErrorCode::ProtocolError,
            ApiError::InternalError(_) => ErrorCode::Internal,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError::coded(err.code(), err.to_string())
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::ProtocolError | ErrorCode::UnsupportedProvider => StatusCode::BAD_REQUEST,
        ErrorCode::SessionNotFound | ErrorCode::ProfileNotFound => StatusCode::NOT_FOUND,
        ErrorCode::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::AuthFailed
        | ErrorCode::ConnectFailed
        | ErrorCode::HandshakeFailed
        | ErrorCode::CacheComputeError => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let message = match self {
            ApiError::Coded { message, .. } => message,
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": message,
            "code": code,
        }));
        (status_for(code), body).into_response()
    }
}
