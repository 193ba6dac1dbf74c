//! Event Stream Handlers - SSE
//!
//! 订阅时先回放当前状态和已可用的产物，任务已结束则回放后立即关闭。

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;

use super::reconstruction::parse_task_id;
use crate::application::GetTaskStatus;
use crate::domain::reconstruction::TaskId;
use crate::infrastructure::events::PushEvent;
use crate::infrastructure::http::error::ApiError;
use crate::infrastructure::http::state::AppState;

/// 打开任务事件流：connect → 回放 → 实时事件，直到 close
pub(crate) async fn open_event_stream(
    state: &AppState,
    task_id: TaskId,
) -> Result<BoxStream<'static, PushEvent>, ApiError> {
    // 未知任务直接 404，不建通道
    state.store.get(&task_id).await?;

    // 先建通道再读快照，快照之后的事件不会丢
    let mut subscription = state.events.open(&task_id);
    let connect = subscription
        .receiver
        .try_recv()
        .unwrap_or(PushEvent::Connect {});

    let view = match state
        .get_status_handler
        .handle(GetTaskStatus {
            task_id: task_id.clone(),
        })
        .await
    {
        Ok(view) => view,
        Err(e) => {
            state.events.close_channel(&task_id, subscription.channel_id);
            return Err(e.into());
        }
    };

    let status = view.task.status();
    let mut replay = vec![
        connect,
        PushEvent::Status {
            task_id: task_id.to_string(),
            status,
            error: view.task.error_message().map(str::to_string),
        },
    ];
    replay.extend(view.files.into_iter().map(|file| PushEvent::Result {
        task_id: task_id.to_string(),
        name: file.name,
        url: file.url,
    }));

    if status.is_terminal() {
        state.events.close_channel(&task_id, subscription.channel_id);
        replay.push(PushEvent::Close {
            reason: status.as_str().to_ascii_lowercase(),
        });
        tracing::debug!(task_id = %task_id, %status, "Replayed finished task");
        return Ok(stream::iter(replay).boxed());
    }

    tracing::debug!(
        task_id = %task_id,
        channel_id = subscription.channel_id,
        "Event subscriber attached"
    );

    let live = stream::unfold(
        (subscription.receiver, false),
        |(mut receiver, closed)| async move {
            if closed {
                return None;
            }
            let event = receiver.recv().await?;
            let closed = event.is_close();
            Some((event, (receiver, closed)))
        },
    );

    Ok(stream::iter(replay).chain(live).boxed())
}

/// SSE 事件流
pub async fn subscribe_events(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let events = open_event_stream(&state, task_id).await?;

    let sse_stream = events.map(|event| {
        Ok::<Event, Infallible>(Event::default().event(event.name()).data(event.data_json()))
    });
    Ok(Sse::new(sse_stream))
}
