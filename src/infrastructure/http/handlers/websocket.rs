//! WebSocket Handler - 与 SSE 相同的事件流，消息格式 `{"event": ..., "data": ...}`

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use super::events::open_event_stream;
use super::reconstruction::parse_task_id;
use crate::domain::reconstruction::TaskId;
use crate::infrastructure::events::PushEvent;
use crate::infrastructure::http::error::ApiError;
use crate::infrastructure::http::state::AppState;

/// 任务事件 WebSocket
pub async fn reconstruction_websocket(
    ws: WebSocketUpgrade,
    Path(task_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let events = open_event_stream(&state, task_id.clone()).await?;
    Ok(ws.on_upgrade(move |socket| handle_task_socket(socket, task_id, events)))
}

async fn handle_task_socket(
    socket: WebSocket,
    task_id: TaskId,
    mut events: BoxStream<'static, PushEvent>,
) {
    let (mut sender, mut receiver) = socket.split();

    tracing::info!(task_id = %task_id, "WebSocket connected");

    let forward_id = task_id.clone();
    let receive_id = task_id.clone();

    // 事件转发任务
    let mut forward_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let msg = match serde_json::to_string(&event) {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize event");
                    continue;
                }
            };

            if let Err(e) = sender.send(msg).await {
                tracing::debug!(task_id = %forward_id, error = %e, "Failed to send WebSocket message");
                return;
            }
            if event.is_close() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // 接收客户端消息，只关心关闭
    let mut receive_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    tracing::info!(task_id = %receive_id, "WebSocket closed by client");
                    break;
                }
                Err(e) => {
                    tracing::debug!(task_id = %receive_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    // 等待任一任务完成
    tokio::select! {
        _ = &mut forward_task => receive_task.abort(),
        _ = &mut receive_task => forward_task.abort(),
    }

    tracing::info!(task_id = %task_id, "WebSocket disconnected");
}
