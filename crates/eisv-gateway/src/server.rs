//! HTTP and WebSocket transport

use crate::rpc::{self, CallContext};
use crate::state::AppState;
use crate::ws::{handle_connection, ConnectParams};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use eisv_core::{RpcRequest, RpcResponse, SessionKey};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const SESSION_HEADER: &str = "x-session-id";
pub const CLIENT_HEADER: &str = "x-client-id";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until `cancel` fires, then finish in-flight requests.
pub async fn serve(state: Arc<AppState>, cancel: CancellationToken) -> anyhow::Result<()> {
    let config = state.config.current();
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {}:{}: {}", config.server.bind, config.server.port, e))?;

    info!("EISV governance v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  RPC:       http://{}/rpc", bind_addr);
    info!("  WebSocket: ws://{}/ws", bind_addr);
    info!("  Storage:   {}", state.store.backend());
    info!("  Auth:      {}", if state.auth.required() { "token" } else { "none" });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("gateway stopped");
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

async fn rpc_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Json<RpcResponse> {
    let req: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => return Json(RpcResponse::parse_error(e.to_string())),
    };
    if let Err(e) = state.auth.verify_header(header_str(&headers, AUTHORIZATION.as_str())) {
        warn!("rpc auth failed: {}", e);
        return Json(RpcResponse::from_error(req.id, &e));
    }

    let session = header_str(&headers, SESSION_HEADER)
        .or_else(|| req.params.get("session_key").and_then(|v| v.as_str()))
        .map(SessionKey::new);
    let client = header_str(&headers, CLIENT_HEADER).map(str::to_string);
    let ctx = CallContext::new(session, client);

    let result = rpc::dispatch(&req.method, req.params, &state, &ctx).await;
    Json(rpc::to_response(req.id, result))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, params))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(rpc::health(&state).await)
}
