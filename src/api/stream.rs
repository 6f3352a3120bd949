//! Push delivery of progress snapshots over SSE and WebSocket.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::session::{ProgressSnapshot, ProgressStream};

use super::routes::{error_response, ApiResult, AppState};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
enum ClientCommand {
    Cancel,
}

fn event_name(snapshot: &ProgressSnapshot) -> &'static str {
    if snapshot.is_terminal() {
        "done"
    } else {
        "progress"
    }
}

fn snapshot_event(snapshot: &ProgressSnapshot) -> Event {
    Event::default()
        .event(event_name(snapshot))
        .id(snapshot.sequence.to_string())
        .json_data(snapshot)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// SSE stream of progress snapshots. The first event is the current state,
/// the last one is named `done`.
pub(super) async fn session_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut snapshots = state.scheduler.subscribe(id).await.map_err(error_response)?;

    let stream = async_stream::stream! {
        while let Some(snapshot) = snapshots.next().await {
            yield Ok(snapshot_event(&snapshot));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

/// WebSocket variant of [`session_events`]. Clients may send
/// `{"t":"cancel"}` to cancel the session.
pub(super) async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    // Subscribe before upgrading so an unknown id is a plain 404.
    let snapshots = state.scheduler.subscribe(id).await.map_err(error_response)?;
    Ok(ws.on_upgrade(move |socket| handle_session_socket(socket, state, id, snapshots)))
}

async fn handle_session_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    id: Uuid,
    mut snapshots: ProgressStream,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Snapshots -> WS
    let mut send_task = tokio::spawn(async move {
        while let Some(snapshot) = snapshots.next().await {
            let text = match serde_json::to_string(&snapshot) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(session_id = %id, "Failed to encode snapshot: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // WS -> commands
    let scheduler = Arc::clone(&state.scheduler);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(t) => match serde_json::from_str::<ClientCommand>(&t) {
                    Ok(ClientCommand::Cancel) => {
                        if let Err(e) = scheduler.cancel(id).await {
                            tracing::debug!(session_id = %id, "Cancel over WebSocket failed: {}", e);
                        }
                    }
                    Err(e) => tracing::debug!("Ignoring client message {:?}: {}", t, e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use chrono::Utc;

    fn snapshot(status: SessionStatus, sequence: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            session_id: Uuid::new_v4(),
            sequence,
            status,
            progress: 0.5,
            completed_tasks: 1,
            total_tasks: 2,
            current_tasks: vec!["BIOS".to_string()],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_client_command_parse() {
        let cmd: ClientCommand = serde_json::from_str(r#"{"t":"cancel"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Cancel));
        assert!(serde_json::from_str::<ClientCommand>(r#"{"t":"pause"}"#).is_err());
    }

    #[test]
    fn test_terminal_snapshot_is_done_event() {
        assert_eq!(event_name(&snapshot(SessionStatus::Running, 3)), "progress");
        assert_eq!(event_name(&snapshot(SessionStatus::Completed, 4)), "done");
        assert_eq!(event_name(&snapshot(SessionStatus::Cancelled, 5)), "done");
    }
}
