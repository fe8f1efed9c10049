use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use uuid::Uuid;

use crate::metrics::{global_metrics, API_REQUEST_SECONDS};

/// Records `api_requests_total{method,path,status}` and request latency.
///
/// Also stamps every response with `x-request-id` (reusing the caller's
/// header when present) and runs the handler inside an `http_request` span.
pub async fn metrics_middleware(mut request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().as_simple().to_string());

    if let Ok(value) = request_id.parse() {
        request.headers_mut().insert("x-request-id", value);
    }

    let span = tracing::info_span!("http_request", request_id = %request_id, %method, %path);
    let start = Instant::now();
    let mut response = {
        use tracing::Instrument;
        next.run(request).instrument(span).await
    };

    let status = response.status().as_u16().to_string();
    let m = global_metrics();
    m.increment_counter(
        "api_requests_total",
        &[("method", method.as_str()), ("path", path.as_str()), ("status", status.as_str())],
    );
    m.record_histogram(API_REQUEST_SECONDS, start.elapsed().as_secs_f64());

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
