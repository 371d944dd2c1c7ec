//! HTTP surface: WebSocket upgrades and the admin API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{is_tailnet_addr, Claims, TokenManager};
use crate::config::{AuthMode, HubConfig};

use super::agent_link::run_agent;
use super::client_link::run_client;
use super::link::{Inbound, Outbound, OutboundSender, LINK_BUFFER};
use super::registry::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub tokens: Arc<TokenManager>,
    pub config: Arc<HubConfig>,
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/ws/client", get(ws_client))
        .route("/ws/agent", get(ws_agent))
        .route("/api/lock", post(api_lock))
        .route("/api/sessions", get(api_sessions));
    if state.config.auth_mode == AuthMode::Token {
        router = router.route("/api/ws-token", post(api_ws_token));
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bridge a WebSocket onto channel-based link halves.
///
/// One task owns the socket: it drains the outbound queue (so control and
/// data frames are written one at a time, never interleaved) and forwards
/// inbound frames. Cancelling the returned token, or either side dropping
/// its channel, closes the socket.
fn spawn_socket_pump(
    socket: WebSocket,
) -> (mpsc::Receiver<Inbound>, OutboundSender, CancellationToken) {
    let (inbound_tx, inbound_rx) = mpsc::channel(LINK_BUFFER);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(LINK_BUFFER);
    let cancel = CancellationToken::new();
    let pump_cancel = cancel.clone();

    tokio::spawn(async move {
        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                _ = pump_cancel.cancelled() => break,
                outbound = outbound_rx.recv() => {
                    let Some(outbound) = outbound else { break };
                    let message = match outbound {
                        Outbound::Control(msg) => match serde_json::to_string(&msg) {
                            Ok(json) => Message::Text(json.into()),
                            Err(err) => {
                                warn!(error = %err, "failed to serialize control message");
                                continue;
                            }
                        },
                        Outbound::Data(bytes) => Message::Binary(bytes.into()),
                    };
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(Inbound::Text(text.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            if inbound_tx.send(Inbound::Binary(bytes.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        // Ping/pong are answered by axum itself.
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    }
                }
            }
        }
        // Make sure the link loop unblocks even if it was parked elsewhere.
        pump_cancel.cancel();
    });

    (inbound_rx, outbound_tx, cancel)
}

#[derive(Debug, Deserialize)]
struct AgentQuery {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    agent_secret: String,
}

async fn ws_agent(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.config.agent_secret_matches(&query.agent_id, &query.agent_secret) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        let (inbound, outbound, cancel) = spawn_socket_pump(socket);
        run_agent(hub, query.agent_id, outbound, inbound, cancel).await;
    })
}

#[derive(Debug, Deserialize)]
struct ClientQuery {
    #[serde(default)]
    token: String,
}

async fn ws_client(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ClientQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(claims) = authorize_client(&state, addr, &query.token) else {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    };
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        let (inbound, outbound, cancel) = spawn_socket_pump(socket);
        run_client(hub, claims, outbound, inbound, cancel).await;
    })
}

fn authorize_client(state: &AppState, addr: SocketAddr, token: &str) -> Option<Claims> {
    if state.config.tailnet_only && !is_tailnet_addr(addr.ip()) {
        return None;
    }
    match state.config.auth_mode {
        AuthMode::Tailnet => Some(Claims::default()),
        AuthMode::Token => state.tokens.verify(token).ok(),
    }
}

fn admin_authorized(config: &HubConfig, headers: &HeaderMap) -> bool {
    if config.admin_token.is_empty() {
        return false;
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {}", config.admin_token))
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    write: bool,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
}

async fn api_ws_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TokenRequest>,
) -> Response {
    if !admin_authorized(&state.config, &headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    if request.agent_id.is_empty() || request.session_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "bad request").into_response();
    }
    let claims = Claims {
        agent_id: request.agent_id,
        session_id: request.session_id,
        write: request.write,
        expires_at: None,
    };
    match state.tokens.issue(&claims, state.config.token_ttl()) {
        Ok(token) => Json(TokenResponse { token }).into_response(),
        Err(err) => {
            warn!(error = %err, "token issuance failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "error").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct LockRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    writer: String,
}

async fn api_lock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LockRequest>,
) -> Response {
    if !admin_authorized(&state.config, &headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    if request.agent_id.is_empty() || request.session_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "bad request").into_response();
    }
    let enabled = match request.writer.trim().to_ascii_lowercase().as_str() {
        "" | "web" => true,
        "none" => false,
        _ => return (StatusCode::BAD_REQUEST, "bad request").into_response(),
    };
    if state
        .hub
        .set_web_writable(&request.agent_id, &request.session_id, enabled)
        .await
    {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "not found").into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    #[serde(default)]
    agent_id: String,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    sessions: Vec<String>,
}

async fn api_sessions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<SessionsQuery>,
) -> Response {
    match state.config.auth_mode {
        AuthMode::Token => {
            if !admin_authorized(&state.config, &headers) {
                return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
            }
        }
        AuthMode::Tailnet => {
            if state.config.tailnet_only && !is_tailnet_addr(addr.ip()) {
                return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
            }
        }
    }
    if query.agent_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "bad request").into_response();
    }
    match state.hub.request_sessions(&query.agent_id).await {
        Some(sessions) => Json(SessionsResponse { sessions }).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "agent not available").into_response(),
    }
}
