//! Inference Connection Handlers

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::infrastructure::http::dto::{ApiResponse, ConnectionDto};
use crate::infrastructure::http::state::AppState;

fn snapshot(state: &AppState) -> ConnectionDto {
    ConnectionDto {
        connection: state.transport.status(),
        pending_tasks: state.coordinator.pending_count(),
    }
}

/// 推理通道状态
pub async fn connection_status(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<ConnectionDto>> {
    Json(ApiResponse::success(snapshot(&state)))
}

/// 手动重置推理通道，所有在途任务失败
pub async fn reset_connection(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<ConnectionDto>> {
    tracing::warn!(
        pending_tasks = state.coordinator.pending_count(),
        "Manual inference connection reset requested"
    );
    state.transport.reset().await;
    Json(ApiResponse::success(snapshot(&state)))
}
