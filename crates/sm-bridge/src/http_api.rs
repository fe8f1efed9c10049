use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sm_core::error::ErrorCode;
use sm_core::types::{ProfileId, SessionState};
use sm_harness::rate_limiter::ServiceLimits;
use sm_intelligence::cache::CacheStats;
use sm_intelligence::chat::{AiChatService, AiRequest, AiResponse};
use sm_session::pool::PoolStats;
use sm_session::registry::{RegistryStats, SessionRegistry};
use sm_telemetry::metrics::{
    global_metrics, CACHE_HIT_RATE, CACHE_INFLIGHT, POOL_IDLE, POOL_SIZE, SESSIONS_ACTIVE,
};
use sm_telemetry::middleware::metrics_middleware;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};

use crate::api_error::ApiError;
use crate::auth::{AuthLayer, Principal};
use crate::multiplexer::{MuxStats, Multiplexer};
use crate::profiles::{ConnectionProfile, ProfileStore, SaveProfile};
use crate::ws::{self, WsSettings};

/// Shared application state for all HTTP/WS handlers.
pub struct AppState {
    pub mux: Multiplexer,
    pub chat: Arc<AiChatService>,
    pub limits: Arc<ServiceLimits>,
    pub ws: WsSettings,
    pub profiles: ProfileStore,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub pool: PoolStats,
    pub sessions: RegistryStats,
    pub cache: CacheStats,
    pub clients: MuxStats,
}

impl AppState {
    pub fn new(
        mux: Multiplexer,
        chat: Arc<AiChatService>,
        limits: Arc<ServiceLimits>,
        ws: WsSettings,
    ) -> Self {
        Self {
            mux,
            chat,
            limits,
            ws,
            profiles: ProfileStore::new(),
            start_time: Instant::now(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.mux.registry()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            pool: self.registry().pool().stats(),
            sessions: self.registry().stats(),
            cache: self.chat.cache_stats(),
            clients: self.mux.stats(),
        }
    }

    /// Sample the live gauges into the global collector.
    pub fn publish_gauges(&self) -> StatsSnapshot {
        let snap = self.snapshot();
        let m = global_metrics();
        m.set_gauge(SESSIONS_ACTIVE, snap.sessions.active as f64);
        m.set_gauge(POOL_SIZE, snap.pool.size as f64);
        m.set_gauge(POOL_IDLE, snap.pool.idle as f64);
        m.set_gauge(CACHE_HIT_RATE, snap.cache.hit_rate);
        m.set_gauge(CACHE_INFLIGHT, snap.cache.inflight as f64);
        snap
    }
}

/// Build the router with all HTTP and WebSocket routes.
///
/// When `api_key` is `Some`, every route requires it (see [`AuthLayer`]).
/// An empty `allowed_origins` allows any origin.
pub fn api_router(state: Arc<AppState>, api_key: Option<String>, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/ai/chat", post(ai_chat))
        .route("/api/configs", get(list_profiles).post(save_profile))
        .route("/api/configs/{id}", get(get_profile).delete(delete_profile))
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(axum_middleware::from_fn(metrics_middleware))
        .layer(AuthLayer::new(api_key))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::very_permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparsable allowed origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.snapshot())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.publish_gauges();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        global_metrics().export_prometheus(),
    )
}

/// POST /api/ai/chat
async fn ai_chat(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    payload: Result<Json<AiRequest>, JsonRejection>,
) -> Result<Json<AiResponse>, ApiError> {
    if let Err(e) = state.limits.check_ai(principal.as_str()) {
        return Err(ApiError::coded(ErrorCode::RateLimited, e.to_string()));
    }
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let target = request
        .session_id
        .and_then(|sid| session_context(&state, &principal, sid));
    debug!(principal = %principal.0, with_context = target.is_some(), "ai chat request");

    let reply = state
        .chat
        .ask(request, principal.as_str(), target.as_deref())
        .await?;
    Ok(Json(reply))
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> Json<Vec<ConnectionProfile>> {
    Json(state.profiles.list())
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ProfileId>,
) -> Result<Json<ConnectionProfile>, ApiError> {
    state.profiles.get(id).map(Json)
}

/// POST /api/configs
async fn save_profile(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SaveProfile>, JsonRejection>,
) -> Result<Json<ConnectionProfile>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    state.profiles.save(body).map(Json)
}

async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ProfileId>,
) -> Result<StatusCode, ApiError> {
    state.profiles.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `user@host:port` of a live session owned by the caller.
fn session_context(
    state: &AppState,
    principal: &Principal,
    session: sm_core::types::SessionId,
) -> Option<String> {
    let owner = state.mux.owner_of(session)?;
    if state.mux.principal_of(owner).as_deref() != Some(principal.as_str()) {
        return None;
    }
    state
        .registry()
        .describe(session)
        .filter(|info| info.state == SessionState::Active)
        .map(|info| info.target.to_string())
}
