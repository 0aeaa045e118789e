//! Progress WebSocket: periodic JSON snapshots of every live transfer.

use crate::server::state::AppState;
use crate::transfer::progress::UPDATE_INTERVAL;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Redraw cadence pushed to clients; well above the 100 ms floor.
const TICK: Duration = Duration::from_millis(500);

pub async fn progress_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_progress(socket, state))
}

async fn stream_progress(mut socket: WebSocket, state: AppState) {
    let mut ticker = tokio::time::interval(TICK.max(UPDATE_INTERVAL));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = state.progress.snapshot();
                let payload = json!({
                    "type": "progress",
                    "transfers": snapshot.transfers,
                    "total_expected": snapshot.total_expected,
                    "total_received": snapshot.total_received,
                    "timestamp": unix_millis(),
                });
                let text = match serde_json::to_string(&payload) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break; // peer went away
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // pings and stray messages
                }
            }
        }
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
