//! Ping Handler
//!
//! 健康检查，附带推理通道状态

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::application::ConnectionStatus;
use crate::infrastructure::http::state::AppState;

/// Ping 响应
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub inference: ConnectionStatus,
    pub pending_tasks: usize,
    pub subscribers: usize,
}

/// Ping endpoint - 健康检查
pub async fn ping(State(state): State<Arc<AppState>>) -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        inference: state.transport.status(),
        pending_tasks: state.coordinator.pending_count(),
        subscribers: state.events.subscriber_count(),
    })
}
