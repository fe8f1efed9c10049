//! Observability for shellmux services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus/JSON export
//! - **Middleware**: axum layer recording request counts, latency and request ids

pub mod logging;
pub mod metrics;
pub mod middleware;
