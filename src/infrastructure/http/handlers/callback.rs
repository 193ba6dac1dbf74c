//! Callback Handlers - HTTP 回调模式的入站接口
//!
//! 推理服务把结果分片和状态变更 POST 回来，统一经 coordinator 投递。

use axum::{
    extract::{Multipart, Path, State},
    Json,
};
use std::sync::Arc;

use super::reconstruction::parse_task_id;
use crate::application::{IngestResultPart, IngestStatusUpdate};
use crate::infrastructure::http::dto::{ApiResponse, CallbackAckDto, StatusCallbackRequest};
use crate::infrastructure::http::error::ApiError;
use crate::infrastructure::http::state::AppState;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// 结果分片回调（multipart: name, content_type, file）
pub async fn result_callback(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<CallbackAckDto>>, ApiError> {
    let task_id = parse_task_id(&task_id)?;

    let mut name: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut file_name: Option<String> = None;
    let mut file_content_type: Option<String> = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::BadRequest(format!("Failed to read multipart field: {}", e))
    })? {
        let field_name = field.name().unwrap_or_default().to_string();

        match field_name.as_str() {
            "name" => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("Failed to read name: {}", e)))?,
                );
            }
            "content_type" | "contentType" => {
                content_type = Some(field.text().await.map_err(|e| {
                    ApiError::BadRequest(format!("Failed to read content_type: {}", e))
                })?);
            }
            "file" => {
                file_name = field.file_name().map(str::to_string);
                file_content_type = field.content_type().map(str::to_string);
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let name = name
        .filter(|n| !n.trim().is_empty())
        .or(file_name)
        .ok_or_else(|| ApiError::BadRequest("Missing part name".to_string()))?;
    let bytes = bytes.ok_or_else(|| ApiError::BadRequest("Missing file field".to_string()))?;
    let content_type = content_type
        .filter(|c| !c.trim().is_empty())
        .or(file_content_type)
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    let status = state
        .ingest_part_handler
        .handle(IngestResultPart {
            task_id: task_id.clone(),
            name,
            content_type,
            bytes,
        })
        .await?;

    Ok(Json(ApiResponse::success(CallbackAckDto {
        task_id: task_id.to_string(),
        status,
    })))
}

/// 状态回调
pub async fn status_callback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StatusCallbackRequest>,
) -> Result<Json<ApiResponse<CallbackAckDto>>, ApiError> {
    let task_id = parse_task_id(&req.task_id)?;

    tracing::info!(task_id = %task_id, status = %req.status, "Status callback received");

    let status = state
        .ingest_status_handler
        .handle(IngestStatusUpdate {
            task_id: task_id.clone(),
            status: req.status,
            error: req.error,
        })
        .await?;

    Ok(Json(ApiResponse::success(CallbackAckDto {
        task_id: task_id.to_string(),
        status,
    })))
}
