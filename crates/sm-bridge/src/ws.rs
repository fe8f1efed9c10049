//! `GET /ws`: one socket, many sessions.
//!
//! Per socket there is a receive loop (this task) feeding the multiplexer and
//! a writer task draining the client's outbound queue. The writer also sends
//! a Ping frame every [`HEARTBEAT_INTERVAL`] to detect half-open TCP
//! connections; the receive loop closes the socket after `idle_timeout` of
//! client silence.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sm_core::config::Config;
use sm_core::types::ClientId;
use sm_telemetry::metrics::{global_metrics, WS_MESSAGES_TOTAL};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::auth::Principal;
use crate::http_api::AppState;
use crate::multiplexer::{ClientConnection, Multiplexer};
use crate::protocol::{ProtocolError, ServerMessage};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WsSettings {
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl WsSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.server.ws_idle_timeout.max(1)),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl Default for WsSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> impl IntoResponse {
    let mux = state.mux.clone();
    let settings = state.ws.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, mux, settings, principal))
}

async fn handle_socket(socket: WebSocket, mux: Multiplexer, settings: WsSettings, principal: Principal) {
    let ClientConnection { id, outbound } = mux.register_client(principal.0.clone());
    info!(client_id = %id, principal = %principal.0, "websocket connected");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(sink, outbound, settings.heartbeat_interval));

    tokio::select! {
        _ = read_frames(stream, &mux, id, settings.idle_timeout) => {}
        _ = &mut writer => debug!(client_id = %id, "websocket writer ended"),
    }

    let closed = mux.close_client(id).await;
    writer.abort();
    info!(client_id = %id, sessions_closed = closed, "websocket disconnected");
}

async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    mux: &Multiplexer,
    id: ClientId,
    idle_timeout: Duration,
) {
    loop {
        let frame = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!(client_id = %id, error = %e, "websocket read failed");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                info!(client_id = %id, ?idle_timeout, "websocket idle timeout, closing");
                return;
            }
        };

        match frame {
            Message::Text(text) => {
                global_metrics().increment_counter(WS_MESSAGES_TOTAL, &[("direction", "in")]);
                mux.handle_frame(id, text.as_str()).await;
            }
            Message::Binary(_) => mux.reject(id, ProtocolError::Binary).await,
            Message::Close(_) => return,
            // Ping/Pong are answered by the socket layer; they still reset
            // the idle timer above.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                global_metrics().increment_counter(
                    WS_MESSAGES_TOTAL,
                    &[("direction", "out"), ("type", msg.kind())],
                );
                if sink.send(Message::Text(msg.encode().into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    debug!("heartbeat ping failed, connection lost");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
