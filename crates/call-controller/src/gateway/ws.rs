//! WebSocket endpoint.
//!
//! `GET /ws` upgrades to a call socket. Authentication happens upstream:
//! the edge proxy verifies the caller's token and forwards the user id in
//! [`AUTHENTICATED_USER_HEADER`]. Requests without it are refused before the
//! upgrade.
//!
//! Each socket gets two tasks: a writer draining the socket's outbound
//! queue, and the reader loop below, which handles frames one at a time.

use super::frames::{ClientEnvelope, ServerFrame};
use super::hub::SOCKET_OUTBOUND_BUFFER;
use super::Gateway;
use crate::observability::metrics;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use common::types::UserId;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Header carrying the caller's verified user id.
pub const AUTHENTICATED_USER_HEADER: &str = "x-authenticated-user";

/// Build the gateway router.
pub fn gateway_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(gateway)
        .layer(TraceLayer::new_for_http())
}

/// The caller's user id, if the edge proxy supplied a well-formed one.
#[must_use]
pub fn authenticated_user(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(AUTHENTICATED_USER_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .map(UserId)
}

async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = authenticated_user(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if gateway.controller().status().is_draining {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, gateway, user_id))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, user_id: UserId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(SOCKET_OUTBOUND_BUFFER);
    let connection_id = gateway.hub().connect(user_id, tx.clone());
    info!(target: "cc.gateway", user_id = %user_id, connection_id, "Call socket opened");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        match message {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientEnvelope>(&text) {
                    Ok(envelope) => gateway.handle_frame(user_id, envelope).await,
                    Err(e) => {
                        metrics::record_gateway_frame("unknown", "malformed");
                        ServerFrame::malformed(&e.to_string())
                    }
                };
                match serde_json::to_string(&reply) {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "cc.gateway", error = %e, "Reply not serializable");
                    }
                }
            }
            Message::Close(_) => break,
            // Binary frames are not part of the protocol; ping/pong is
            // answered by the transport.
            _ => {}
        }
    }

    if gateway.hub().disconnect(user_id, connection_id) {
        gateway.disconnect(user_id).await;
    }
    writer.abort();
    info!(target: "cc.gateway", user_id = %user_id, connection_id, "Call socket closed");
}
