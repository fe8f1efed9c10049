use axum::{body::Body, http::Request, routing::get, Router};
use sm_telemetry::logging::{self, LogFormat};
use sm_telemetry::metrics::{global_metrics, MetricsCollector, SESSIONS_ACTIVE};
use sm_telemetry::middleware::metrics_middleware;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[test]
fn init_logging_is_idempotent() {
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");
    logging::init("test-service", "info", LogFormat::Json);

    tracing::info!(key = "value", "log line after init");
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[test]
fn global_metrics_is_a_singleton() {
    assert!(std::ptr::eq(global_metrics(), global_metrics()));
}

#[test]
fn json_export_contains_gauges() {
    let m = MetricsCollector::new();
    m.set_gauge(SESSIONS_ACTIVE, 3.0);
    m.increment_counter("ws_messages_total", &[("type", "connect")]);

    let json = m.export_json();
    assert_eq!(json["gauges"][SESSIONS_ACTIVE], 3.0);
    assert_eq!(json["counters"]["ws_messages_total{type=\"connect\"}"], 1);
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

#[tokio::test]
async fn middleware_counts_requests_and_sets_request_id() {
    let app = Router::new()
        .route("/api/health", get(|| async { "ok" }))
        .layer(axum::middleware::from_fn(metrics_middleware));

    let before = global_metrics().get_counter(
        "api_requests_total",
        &[("method", "GET"), ("path", "/api/health"), ("status", "200")],
    );

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .header("x-request-id", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-request-id"], "req-123");

    let after = global_metrics().get_counter(
        "api_requests_total",
        &[("method", "GET"), ("path", "/api/health"), ("status", "200")],
    );
    assert_eq!(after, before + 1);
}
