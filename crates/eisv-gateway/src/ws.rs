//! WebSocket connection handling
//!
//! Carries the same RPC protocol as `POST /rpc` and pushes lifecycle and
//! dialectic events to every connected client.

use crate::rpc::{self, CallContext};
use crate::state::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use eisv_core::{EventMessage, IncomingMessage, RpcResponse, SessionKey};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Query parameters of `GET /ws`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    /// Session key; a fresh one per connection when absent.
    pub session: Option<String>,
    /// Logical client id used to rebind after a reconnect.
    pub client: Option<String>,
    pub token: Option<String>,
}

impl ConnectParams {
    fn session_key(&self) -> SessionKey {
        match self.session.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => SessionKey::new(s),
            None => SessionKey::new(format!("ws-{}", uuid::Uuid::new_v4())),
        }
    }
}

pub async fn handle_connection(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = state.events.subscribe();

    let session = params.session_key();
    let ctx = CallContext::new(
        Some(session.clone()),
        params.client.clone().filter(|c| !c.trim().is_empty()),
    );
    let mut authenticated = state.auth.verify_token(params.token.as_deref()).is_ok();

    let info_event = EventMessage::info(env!("CARGO_PKG_VERSION"), session.as_str());
    if let Ok(json) = serde_json::to_string(&info_event) {
        let _ = ws_tx.send(WsMessage::Text(json)).await;
    }
    info!("ws client connected (session {})", session);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        for response in handle_text_message(&text, &state, &mut authenticated, &ctx).await {
                            if ws_tx.send(WsMessage::Text(response)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("ws client disconnected (session {})", session);
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return;
                    }
                    _ => {}
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("ws client lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("event bus closed");
                        return;
                    }
                }
            }
        }
    }
}

/// One text frame in, zero or more JSON frames out.
async fn handle_text_message(
    text: &str,
    state: &AppState,
    authenticated: &mut bool,
    ctx: &CallContext,
) -> Vec<String> {
    let reply = match serde_json::from_str::<IncomingMessage>(text) {
        Ok(IncomingMessage::Rpc(req)) if req.method == "auth" => {
            let token = req.params.get("token").and_then(|t| t.as_str());
            match state.auth.verify_token(token) {
                Ok(()) => {
                    *authenticated = true;
                    serde_json::to_string(&RpcResponse::ok(req.id, serde_json::json!({ "ok": true })))
                }
                Err(e) => {
                    warn!("Auth failed: {}", e);
                    serde_json::to_string(&RpcResponse::from_error(req.id, &e))
                }
            }
        }
        Ok(IncomingMessage::Rpc(req)) => {
            let response = if *authenticated {
                let result = rpc::dispatch(&req.method, req.params, state, ctx).await;
                rpc::to_response(req.id, result)
            } else {
                RpcResponse::auth_error(req.id, "not authenticated")
            };
            serde_json::to_string(&response)
        }
        Ok(IncomingMessage::Auth { token }) => match state.auth.verify_token(token.as_deref()) {
            Ok(()) => {
                *authenticated = true;
                serde_json::to_string(&EventMessage::auth_result(true, None))
            }
            Err(e) => {
                warn!("Auth failed: {}", e);
                serde_json::to_string(&EventMessage::auth_result(false, Some(&e.to_string())))
            }
        },
        Err(e) => {
            debug!("unparseable ws frame: {}", text.chars().take(100).collect::<String>());
            serde_json::to_string(&RpcResponse::parse_error(e.to_string()))
        }
    };
    reply.into_iter().collect()
}
