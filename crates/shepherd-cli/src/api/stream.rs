//! Observer WebSocket stream.
//!
//! `GET /tasks/{id}/events?after=N` upgrades to a WebSocket carrying JSON
//! `task_event` messages followed by one `task_complete` sentinel, after
//! which the server closes with a normal-closure code. Reconnecting
//! clients pass `after` to resume past what they already saw; a client
//! observing a sequence jump may reconnect to ask the ring for a replay,
//! and accepts the gap once the ring has rolled past it.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use shepherd_core::events::{StreamMessage, TaskCompletion};

use super::AppState;
use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Resume after this sequence number.
    #[serde(default)]
    pub after: Option<u64>,
}

/// GET /tasks/{id}/events -- upgrade and stream.
pub async fn stream_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // Reject unknown tasks before the upgrade.
    let task = state.store.get(id).await?;

    // After a restart the in-memory log is empty; re-seed the sentinel for
    // finished tasks so late observers still get a clean close.
    if task.is_terminal() {
        state.events.complete(TaskCompletion {
            task_id: task.id,
            status: task.phase,
            pr_url: task.result_pr_url.clone(),
            error: task.result_error.clone(),
        });
    }

    let after = query.after.unwrap_or(0);
    Ok(ws.on_upgrade(move |socket| stream_to_observer(socket, state, id, after)))
}

async fn stream_to_observer(mut socket: WebSocket, state: AppState, id: Uuid, after: u64) {
    let mut subscription = state.events.subscribe(id, after);

    loop {
        tokio::select! {
            item = subscription.next() => match item {
                Ok(Some(msg)) => {
                    let complete = matches!(msg, StreamMessage::TaskComplete(_));
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(task_id = %id, error = %e, "unserializable stream message");
                            break;
                        }
                    };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        return;
                    }
                    if complete {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: "task complete".into(),
                            })))
                            .await;
                        return;
                    }
                }
                Ok(None) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "stream ended".into(),
                        })))
                        .await;
                    return;
                }
                Err(lagged) => {
                    // Too slow: drop this observer; it reconnects with an
                    // `after` cursor and catches up from the ring.
                    tracing::warn!(task_id = %id, %lagged, "dropping slow observer");
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AGAIN,
                            reason: "subscriber lagged; reconnect with after".into(),
                        })))
                        .await;
                    return;
                }
            },
            incoming = socket.recv() => match incoming {
                // The protocol is server-to-client; pings and closes are the
                // only client frames we react to.
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
