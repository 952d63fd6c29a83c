// =============================================================================
// WebSocket Handler - Push-based trade events
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. A `connected` greeting with the ids of the trades currently open.
//   2. Every `TradeEvent` as it is emitted, serialised as JSON.
//
// A client that falls behind the broadcast ring gets a `lagged` notice with
// the number of skipped events and keeps receiving from the newest one.
// Ping frames are answered with Pong; the connection ends on Close or error.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::events::TradeEvent;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    // Subscribe before the greeting so nothing emitted in between is lost.
    let mut events = state.events().subscribe();
    let clients = state.ws_client_connected();
    info!(clients, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    let greeting = serde_json::json!({
        "event": "connected",
        "open_trades": state.executor.store().active_ids().await,
    });
    if send_json(&mut sender, &greeting).await.is_err() {
        cleanup(&state);
        return;
    }

    loop {
        tokio::select! {
            ev = events.recv() => {
                match ev {
                    Ok(event) => {
                        if let Err(e) = send_event(&mut sender, &event).await {
                            debug!(error = %e, "WebSocket send failed, disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagging behind event stream");
                        let notice = serde_json::json!({ "event": "lagged", "skipped": skipped });
                        if send_json(&mut sender, &notice).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state);
}

async fn send_event<S>(sender: &mut S, event: &TradeEvent) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Not a network error; keep the connection.
            warn!(
                error = %e,
                event = event.name(),
                trade_id = event.trade_id().unwrap_or("-"),
                "failed to serialise event"
            );
            Ok(())
        }
    }
}

async fn send_json<S>(sender: &mut S, value: &serde_json::Value) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    sender.send(Message::Text(value.to_string())).await
}

fn cleanup(state: &Arc<AppState>) {
    let clients = state.ws_client_disconnected();
    info!(clients, "WebSocket client disconnected");
}
