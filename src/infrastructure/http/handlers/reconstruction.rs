//! Reconstruction HTTP Handlers

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::application::{
    CancelReconstruction, DeleteReconstruction, GetArtifact, GetTaskStatus, ListTasks,
    SubmitReconstruction,
};
use crate::domain::reconstruction::{TaskId, TaskStatus};
use crate::infrastructure::http::dto::{
    events_url, ApiResponse, Empty, SubmitResponseDto, TaskDto, TaskPageDto, TaskViewDto,
};
use crate::infrastructure::http::error::ApiError;
use crate::infrastructure::http::state::AppState;

const DEFAULT_PAGE_SIZE: u32 = 10;

/// 解析路径中的任务 ID
pub(crate) fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    TaskId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

// ============================================================================
// Submit
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitParams {
    pub user_id: i64,
    #[serde(default)]
    pub source_image_id: Option<i64>,
    /// 同步等待终态（有上限）
    #[serde(default)]
    pub wait: bool,
}

/// 提交图片（请求体为原始图片字节）
pub async fn submit_reconstruction(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SubmitParams>,
    body: Bytes,
) -> Result<Json<ApiResponse<SubmitResponseDto>>, ApiError> {
    let result = state
        .submit_handler
        .handle(SubmitReconstruction {
            user_id: params.user_id,
            source_image_id: params.source_image_id,
            image: body.to_vec(),
            wait: params.wait,
        })
        .await?;

    let task = result.task;
    Ok(Json(ApiResponse::success(SubmitResponseDto {
        task_id: task.id().to_string(),
        status: task.status(),
        events_url: events_url(task.id().as_str()),
        error: task.error_message().map(str::to_string),
        wait_elapsed: result.wait_elapsed,
    })))
}

// ============================================================================
// Status / List
// ============================================================================

/// 查询任务状态
pub async fn get_task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskViewDto>>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let view = state
        .get_status_handler
        .handle(GetTaskStatus { task_id })
        .await?;
    Ok(Json(ApiResponse::success(view.into())))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksParams {
    pub user_id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

/// 用户任务列表
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<ApiResponse<TaskPageDto>>, ApiError> {
    let status = match params.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            TaskStatus::from_str(&raw.to_ascii_uppercase())
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown status filter: {}", raw)))?,
        ),
    };

    let page = state
        .list_tasks_handler
        .handle(ListTasks {
            user_id: params.user_id,
            status,
            page: params.page.unwrap_or(1),
            page_size: params.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        })
        .await?;

    Ok(Json(ApiResponse::success(page.into())))
}

// ============================================================================
// Cancel / Delete
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    #[serde(default)]
    pub reason: Option<String>,
}

/// 取消任务
pub async fn cancel_reconstruction(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(params): Query<CancelParams>,
) -> Result<Json<ApiResponse<TaskDto>>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let task = state
        .cancel_handler
        .handle(CancelReconstruction {
            task_id,
            reason: params.reason,
        })
        .await?;
    Ok(Json(ApiResponse::success((&task).into())))
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub user_id: i64,
}

/// 逻辑删除任务
pub async fn delete_reconstruction(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    state
        .delete_handler
        .handle(DeleteReconstruction {
            task_id,
            user_id: params.user_id,
        })
        .await?;
    Ok(Json(ApiResponse::ok()))
}

// ============================================================================
// Files
// ============================================================================

/// 下载产物
pub async fn download_artifact(
    State(state): State<Arc<AppState>>,
    Path((task_id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let content = state
        .get_artifact_handler
        .handle(GetArtifact { task_id, name })
        .await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content.content_type)
        .header(header::CONTENT_LENGTH, content.data.len())
        .body(Body::from(content.data))
        .map_err(|e| ApiError::Internal(format!("Failed to build response: {}", e)))
}
