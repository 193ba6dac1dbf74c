//! HTTP Routes
//!
//! API Endpoints:
//! - /api/ping                                    GET   健康检查
//! - /api/reconstruction/submit                   POST  提交图片（原始二进制 body）
//! - /api/reconstruction/status/{task_id}         GET   任务状态 + 已有产物
//! - /api/reconstruction/tasks                    GET   用户任务分页列表
//! - /api/reconstruction/cancel/{task_id}         POST  取消任务
//! - /api/reconstruction/delete/{task_id}         POST  逻辑删除
//! - /api/reconstruction/events/{task_id}         GET   SSE 事件流
//! - /api/reconstruction/files/{task_id}/{name}   GET   下载产物
//! - /api/reconstruction/callback/result/{id}     POST  回调：结果分片（multipart）
//! - /api/reconstruction/callback/status          POST  回调：状态变更
//! - /api/inference/connection                    GET   推理通道状态
//! - /api/inference/connection/reset              POST  手动重置推理通道
//! - /ws/reconstruction/{task_id}                 WS    WebSocket 事件流

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

/// 创建所有路由
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/api", api_routes())
        .route(
            "/ws/reconstruction/:task_id",
            get(handlers::reconstruction_websocket),
        )
}

/// API 路由
fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ping", get(handlers::ping))
        .nest("/reconstruction", reconstruction_routes())
        .nest("/inference", inference_routes())
}

/// Reconstruction 路由
fn reconstruction_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/submit", post(handlers::submit_reconstruction))
        .route("/status/:task_id", get(handlers::get_task_status))
        .route("/tasks", get(handlers::list_tasks))
        .route("/cancel/:task_id", post(handlers::cancel_reconstruction))
        .route("/delete/:task_id", post(handlers::delete_reconstruction))
        .route("/events/:task_id", get(handlers::subscribe_events))
        .route("/files/:task_id/:name", get(handlers::download_artifact))
        .route("/callback/result/:task_id", post(handlers::result_callback))
        .route("/callback/status", post(handlers::status_callback))
}

/// Inference 路由
fn inference_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/connection", get(handlers::connection_status))
        .route("/connection/reset", post(handlers::reset_connection))
}
