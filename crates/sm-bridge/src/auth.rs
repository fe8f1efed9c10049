//! Pre-shared API key middleware.
//!
//! When a key is configured, every request must carry it in the `X-API-Key`
//! header, an `Authorization: Bearer <key>` header, or (for browsers opening
//! a WebSocket, which cannot set headers) a `token` query parameter. With no
//! key configured every request passes as the anonymous principal.
//!
//! Accepted requests get a [`Principal`] extension that rate limiting and
//! cache scoping key on.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::FromRequestParts,
    http::{request::Parts, Request, Response},
    response::IntoResponse,
};
use sm_core::crypto::sha256_hex;
use sm_core::error::ErrorCode;
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::debug;

use crate::api_error::ApiError;

/// Who is calling. Derived from the key, never the key itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(pub String);

impl Principal {
    pub fn anonymous() -> Self {
        Principal("anonymous".into())
    }

    fn for_key(key: &str) -> Self {
        let digest = sha256_hex(&[key.as_bytes()]);
        Principal(format!("key-{}", &digest[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Principal>()
            .cloned()
            .unwrap_or_else(Principal::anonymous))
    }
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AuthLayer {
    /// `None` = auth disabled.
    api_key: Option<Arc<String>>,
}

impl AuthLayer {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::new),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            api_key: self.api_key.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthMiddleware
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    api_key: Option<Arc<String>>,
}

fn provided_key(req: &Request<Body>) -> Option<String> {
    let headers = req.headers();
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .or_else(|| {
            req.uri().query().and_then(|q| {
                q.split('&')
                    .filter_map(|pair| pair.split_once('='))
                    .find(|(k, _)| *k == "token")
                    .map(|(_, v)| v.to_string())
            })
        })
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let api_key = self.api_key.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(expected) = api_key else {
                req.extensions_mut().insert(Principal::anonymous());
                return inner.call(req).await;
            };

            match provided_key(&req) {
                Some(ref token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => {
                    req.extensions_mut().insert(Principal::for_key(token));
                    inner.call(req).await
                }
                _ => {
                    debug!(path = %req.uri().path(), "rejected unauthenticated request");
                    Ok(ApiError::coded(ErrorCode::Unauthorized, "missing or invalid API key")
                        .into_response())
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
