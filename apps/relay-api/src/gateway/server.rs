//! WebSocket upgrade handler and per-connection event loop.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_common::id::{prefix, prefixed_ulid};
use tokio::sync::mpsc;

use crate::AppState;

use super::connection::{ConnectionHandle, Outbound};
use super::events::{CLOSE_NORMAL, SHUTDOWN_REASON};

type WsSink = SplitSink<WebSocket, Message>;

/// Router for the subscriber listener. Any path upgrades.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/{*path}", get(ws_upgrade))
}

/// Upgrade with the payload size limit applied to inbound messages. The
/// subscriber listener does not negotiate permessage-deflate; frames go out
/// uncompressed.
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let max_message_size = state.config.max_payload_bytes();
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (conn, outbound_rx) = ConnectionHandle::channel(prefixed_ulid(prefix::CONNECTION));

    if !state.lifecycle.on_connect(&conn) {
        let _ = send_close(&mut ws_tx, CLOSE_NORMAL, SHUTDOWN_REASON).await;
        return;
    }

    let writer = tokio::spawn(run_writer(ws_tx, outbound_rx));
    run_reader(&state, &conn, ws_rx, writer).await;

    // Close and error both land here.
    state.lifecycle.on_close(&conn);
}

/// Drain the connection's outbound queue into the socket.
async fn run_writer(mut ws_tx: WsSink, mut outbound_rx: mpsc::Receiver<Outbound>) {
    while let Some(frame) = outbound_rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = send_close(&mut ws_tx, code, reason).await;
                break;
            }
        }
    }
}

/// Feed inbound frames to the lifecycle manager until the peer goes away or
/// the writer stops.
async fn run_reader(
    state: &AppState,
    conn: &std::sync::Arc<ConnectionHandle>,
    mut ws_rx: SplitStream<WebSocket>,
    mut writer: tokio::task::JoinHandle<()>,
) {
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.lifecycle.on_message(conn, text.as_str().as_bytes());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        state.lifecycle.on_message(conn, &bytes);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %conn.id(), "ws read error");
                        break;
                    }
                }
            }

            // Writer finished: the peer stopped accepting frames or we sent a close.
            _ = &mut writer => {
                return;
            }
        }
    }

    writer.abort();
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
