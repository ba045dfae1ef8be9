//! Room WebSocket endpoint.
//!
//! Each accepted connection runs two tasks: a write pump draining the
//! client's bounded outbound channel, and a read pump feeding frames into
//! the room manager. The hub owns the outbound sender; when it drops the
//! client (leave, disband, overflow) the write pump winds down and closes
//! the socket.

use crate::api::rooms::AppState;
use crate::error::AppError;
use crate::models::ws::{ErrorData, JoinLeaveData};
use crate::models::{RoomWsMessageType, WsFrame};
use crate::services::room_manager::ClientCtx;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::services::room_hub::CLIENT_BUFFER;

/// Server-side keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    user_id: i64,
    #[allow(dead_code)]
    username: String,
    token: String,
}

pub fn ws_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws/room/:room_id", get(room_ws))
}

async fn room_ws(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let claims = state.auth.verify_token(&query.token)?;
    // The token is authoritative; the userId query parameter must agree.
    if claims.sub != query.user_id {
        return Err(AppError::Unauthorized);
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(state, claims, room_id, socket)))
}

async fn handle_socket(
    state: Arc<AppState>,
    claims: crate::services::auth::Claims,
    room_id: String,
    socket: WebSocket,
) {
    let (out_tx, out_rx) = mpsc::channel::<WsFrame>(CLIENT_BUFFER);

    let ctx = match state.manager.connect(&claims, &room_id, out_tx).await {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(%room_id, user_id = claims.sub, "ws connect rejected: {e}");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1008,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (sender, receiver) = socket.split();
    let user_id = ctx.user_id;
    let write_task = tokio::spawn(write_pump(sender, out_rx, user_id));

    read_pump(&state, &ctx, receiver).await;

    // The read side is done; detach from the room and let the write pump
    // finish on its own channel closure.
    state.manager.disconnect(&ctx).await;
    drop(ctx);
    let _ = write_task.await;
    debug!(%room_id, user_id, "ws connection closed");
}

/// Drain the outbound channel to the socket, interleaved with keepalive
/// pings. Channel closure is the exit signal: a leave or disband delivered
/// as the final frame makes it a normal close (1000), anything else closes
/// 1011 so the client knows to reconnect.
async fn write_pump(
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<WsFrame>,
    user_id: i64,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut normal_close = false;

    loop {
        tokio::select! {
            maybe_frame = out_rx.recv() => {
                let Some(frame) = maybe_frame else { break };
                normal_close = is_terminal_frame(&frame, user_id);
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(user_id, "unserializable outbound frame: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    return;
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }

    let (code, reason) = if normal_close {
        (1000, "bye")
    } else {
        (1011, "connection dropped")
    };
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// A disband, or a leave acknowledging this user, ends the session for good.
fn is_terminal_frame(frame: &WsFrame, user_id: i64) -> bool {
    match frame.kind {
        RoomWsMessageType::RoomDisband => true,
        RoomWsMessageType::Leave => frame
            .payload::<JoinLeaveData>()
            .map(|d| d.user_id == user_id)
            .unwrap_or(false),
        _ => false,
    }
}

async fn read_pump(
    state: &Arc<AppState>,
    ctx: &ClientCtx,
    mut receiver: futures::stream::SplitStream<WebSocket>,
) {
    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(user_id = ctx.user_id, "ws read error: {e}");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                let frame: WsFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        send_error(ctx, "validation", &format!("malformed frame: {e}"));
                        continue;
                    }
                };
                if let Err(e) = state.manager.handle_frame(ctx, frame).await {
                    match e {
                        AppError::Unauthorized
                        | AppError::Forbidden
                        | AppError::NotMember
                        | AppError::NotOwner
                        | AppError::NotMaster => {
                            warn!(user_id = ctx.user_id, room_id = %ctx.room_id, "rejected frame: {e}")
                        }
                        AppError::Cancelled => {}
                        _ => debug!(user_id = ctx.user_id, "frame handling failed: {e}"),
                    }
                    send_error(ctx, e.kind(), &e.to_string());
                }
            }
            Message::Close(_) => break,
            // Protocol-level ping/pong is handled by the transport; the
            // application heartbeat is the JSON ping frame.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }
}

fn send_error(ctx: &ClientCtx, kind: &str, message: &str) {
    let frame = WsFrame::server(
        RoomWsMessageType::Error,
        &ctx.room_id,
        &ErrorData {
            kind: kind.to_string(),
            message: message.to_string(),
        },
    );
    let _ = ctx.out.try_send(frame);
}
