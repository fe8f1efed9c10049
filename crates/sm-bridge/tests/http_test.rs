use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use sm_bridge::http_api::{api_router, AppState};
use sm_bridge::multiplexer::{Multiplexer, MuxSettings};
use sm_bridge::protocol::ServerMessage;
use sm_bridge::ws::WsSettings;
use sm_harness::rate_limiter::{RateLimitConfig, ServiceLimits};
use sm_intelligence::cache::CacheSettings;
use sm_intelligence::chat::{AiChatService, ChatSettings, FixedProviderFactory};
use sm_intelligence::llm::{LlmRole, MockProvider};
use sm_session::mock::MockConnector;
use sm_session::pool::{ConnectionPool, PoolSettings};
use sm_session::registry::{RegistrySettings, SessionRegistry};
use tower::ServiceExt;

struct Harness {
    state: Arc<AppState>,
    provider: MockProvider,
}

fn harness(limits: ServiceLimits) -> Harness {
    let pool = ConnectionPool::new(
        Arc::new(MockConnector::new()),
        PoolSettings {
            max_connections: 4,
            ..PoolSettings::default()
        },
    );
    let registry = SessionRegistry::new(pool, RegistrySettings::default());
    let limits = Arc::new(limits);
    let mux = Multiplexer::new(registry, limits.clone(), MuxSettings::default());

    let provider = MockProvider::new();
    let chat = AiChatService::new(
        ChatSettings {
            retry_count: 0,
            ..ChatSettings::default()
        },
        CacheSettings::new(32, Duration::from_secs(60)),
        Arc::new(FixedProviderFactory::new(Arc::new(provider.clone()))),
    );
    let state = Arc::new(AppState::new(mux, Arc::new(chat), limits, WsSettings::default()));
    Harness { state, provider }
}

fn app(h: &Harness, api_key: Option<&str>) -> Router {
    api_router(h.state.clone(), api_key.map(str::to_string), &[])
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/ai/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn ask(message: &str) -> Value {
    json!({ "message": message, "ai_config": { "provider": "claude", "model": "m" } })
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness(ServiceLimits::unlimited());
    let req = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
    let (status, body) = send(app(&h, None), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn chat_answers_then_serves_from_cache() {
    let h = harness(ServiceLimits::unlimited());

    let (status, first) = send(app(&h, None), chat_request(ask("uptime?"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["response"], "Mock response to: uptime?");
    assert_eq!(first["cached"], false);
    assert!(first["command"].is_null());
    assert_eq!(first["model"], "m");
    assert_eq!(first["tokens_used"], 15);
    assert!(first["latency_ms"].is_u64());

    let (_, second) = send(app(&h, None), chat_request(ask("uptime?"))).await;
    assert_eq!(second["cached"], true);
    assert!(second["tokens_used"].is_null());
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test]
async fn chat_rejects_bad_input() {
    let h = harness(ServiceLimits::unlimited());

    let (status, body) = send(app(&h, None), chat_request(json!({ "message": "hi" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "protocol_error");

    let gemini = json!({ "message": "hi", "ai_config": { "provider": "gemini", "model": "g" } });
    let (status, body) = send(app(&h, None), chat_request(gemini)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "unsupported_provider");
    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn chat_is_rate_limited() {
    let h = harness(ServiceLimits::new(
        RateLimitConfig::per_minute(100),
        RateLimitConfig::per_minute(1),
    ));

    let (status, _) = send(app(&h, None), chat_request(ask("a"))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(app(&h, None), chat_request(ask("b"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "rate_limited");
}

#[tokio::test]
async fn chat_mentions_the_callers_live_session() {
    let h = harness(ServiceLimits::unlimited());
    let mux = h.state.mux.clone();
    let mut conn = mux.register_client("anonymous");
    mux.handle_frame(
        conn.id,
        &json!({ "type": "connect", "host": "web1", "username": "deploy", "credential": "pw" })
            .to_string(),
    )
    .await;
    let sid = match tokio::time::timeout(Duration::from_secs(2), conn.outbound.recv()).await {
        Ok(Some(ServerMessage::Connected { session_id })) => session_id,
        other => panic!("expected connected, got {other:?}"),
    };

    let mut body = ask("what is using disk?");
    body["session_id"] = json!(sid.to_string());
    let (status, _) = send(app(&h, None), chat_request(body)).await;
    assert_eq!(status, StatusCode::OK);

    let (messages, _) = &h.provider.captured_requests()[0];
    assert_eq!(messages[0].role, LlmRole::System);
    assert!(messages[0].content.contains("deploy@web1:22"));

    // Another principal naming the same session gets no context.
    let mut body = ask("what is using disk?");
    body["session_id"] = json!(sid.to_string());
    let req = Request::builder()
        .method("POST")
        .uri("/api/ai/chat")
        .header("content-type", "application/json")
        .header("x-api-key", "k")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, _) = send(app(&h, Some("k")), req).await;
    assert_eq!(status, StatusCode::OK);
    let (messages, _) = &h.provider.captured_requests()[1];
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, LlmRole::User);
}

#[tokio::test]
async fn api_key_is_enforced() {
    let h = harness(ServiceLimits::unlimited());

    let req = Request::builder().uri("/api/stats").body(Body::empty()).unwrap();
    let (status, body) = send(app(&h, Some("k")), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let req = Request::builder()
        .uri("/api/stats")
        .header("authorization", "Bearer k")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&h, Some("k")), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pool"]["max"], 4);
    assert_eq!(body["sessions"]["active"], 0);
    assert_eq!(body["cache"]["entries"], 0);
    assert_eq!(body["clients"]["clients"], 0);
}

#[tokio::test]
async fn metrics_exports_service_gauges() {
    let h = harness(ServiceLimits::unlimited());
    let resp = app(&h, None)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    for gauge in ["sessions_active", "pool_size", "pool_idle", "cache_hit_rate", "cache_inflight"] {
        assert!(text.contains(&format!("# TYPE {gauge} gauge")), "missing {gauge}");
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn connection_profiles_crud() {
    let h = harness(ServiceLimits::unlimited());

    let (status, saved) = send(
        app(&h, None),
        json_request(
            "POST",
            "/api/configs",
            json!({
                "name": "prod web",
                "host": "web1",
                "username": "deploy",
                "password": "hunter2",
                "ai_config": { "provider": "openai", "model": "gpt-4o", "api_key": "sk-secret" }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["port"], 22);
    assert_eq!(saved["ai_config"]["model"], "gpt-4o");
    assert!(saved.get("password").is_none());
    assert!(saved["ai_config"].get("api_key").is_none());
    let id = saved["id"].as_str().unwrap().to_string();

    let (status, listed) = send(app(&h, None), empty_request("GET", "/api/configs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, fetched) = send(app(&h, None), empty_request("GET", &format!("/api/configs/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "prod web");

    let (status, _) = send(app(&h, None), empty_request("DELETE", &format!("/api/configs/{id}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(app(&h, None), empty_request("GET", &format!("/api/configs/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "profile_not_found");

    let (status, body) = send(app(&h, None), empty_request("DELETE", &format!("/api/configs/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "profile_not_found");
}

#[tokio::test]
async fn invalid_profile_is_rejected() {
    let h = harness(ServiceLimits::unlimited());
    let (status, body) = send(
        app(&h, None),
        json_request("POST", "/api/configs", json!({ "host": " ", "username": "deploy" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "protocol_error");
    assert!(h.state.profiles.is_empty());
}
