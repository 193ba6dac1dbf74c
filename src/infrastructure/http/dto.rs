//! Data Transfer Objects

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::{ArtifactFile, ConnectionStatus, ModelRecord, TaskPage, TaskView};
use crate::domain::reconstruction::{ArtifactUrls, ReconstructionTask, TaskStatus};

// ============================================================================
// 统一响应结构
// ============================================================================

/// 统一 API 响应格式
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub errno: i32,
    pub error: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    /// 成功响应
    pub fn success(data: T) -> Self {
        Self {
            errno: 0,
            error: String::new(),
            data: Some(data),
        }
    }
}

/// 空数据响应
#[derive(Debug, Serialize)]
pub struct Empty {}

impl ApiResponse<Empty> {
    /// 成功但无数据
    pub fn ok() -> Self {
        Self::success(Empty {})
    }
}

// ============================================================================
// Reconstruction DTOs
// ============================================================================

/// 事件流地址
pub fn events_url(task_id: &str) -> String {
    format!("/api/reconstruction/events/{}", task_id)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponseDto {
    pub task_id: String,
    pub status: TaskStatus,
    pub events_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 同步提交时等待上限先到
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub wait_elapsed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactUrlsDto {
    pub geometry_url: Option<String>,
    pub material_url: Option<String>,
    pub texture_url: Option<String>,
    pub pixel_image_url: Option<String>,
    pub xyz_image_url: Option<String>,
}

impl From<&ArtifactUrls> for ArtifactUrlsDto {
    fn from(urls: &ArtifactUrls) -> Self {
        Self {
            geometry_url: urls.geometry.clone(),
            material_url: urls.material.clone(),
            texture_url: urls.texture.clone(),
            pixel_image_url: urls.pixel_image.clone(),
            xyz_image_url: urls.xyz_image.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDto {
    pub task_id: String,
    pub user_id: i64,
    pub source_image_id: Option<i64>,
    pub status: TaskStatus,
    pub result_model_id: Option<i64>,
    pub error_message: Option<String>,
    /// 秒
    pub processing_time: Option<i64>,
    #[serde(flatten)]
    pub artifacts: ArtifactUrlsDto,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl From<&ReconstructionTask> for TaskDto {
    fn from(task: &ReconstructionTask) -> Self {
        Self {
            task_id: task.id().to_string(),
            user_id: task.user_id(),
            source_image_id: task.source_image_id(),
            status: task.status(),
            result_model_id: task.result_model_id(),
            error_message: task.error_message().map(str::to_string),
            processing_time: task.processing_secs(),
            artifacts: task.artifacts().into(),
            create_time: task.created_at(),
            update_time: task.updated_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileDto {
    pub name: String,
    pub url: String,
}

impl From<ArtifactFile> for FileDto {
    fn from(file: ArtifactFile) -> Self {
        Self {
            name: file.name,
            url: file.url,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDto {
    pub id: i64,
    pub name: String,
    pub format: String,
    #[serde(flatten)]
    pub artifacts: ArtifactUrlsDto,
    pub create_time: DateTime<Utc>,
}

impl From<ModelRecord> for ModelDto {
    fn from(model: ModelRecord) -> Self {
        Self {
            id: model.id,
            name: model.name,
            format: model.format,
            artifacts: (&model.artifacts).into(),
            create_time: model.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskViewDto {
    #[serde(flatten)]
    pub task: TaskDto,
    pub events_url: String,
    pub files: Vec<FileDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelDto>,
}

impl From<TaskView> for TaskViewDto {
    fn from(view: TaskView) -> Self {
        Self {
            events_url: events_url(view.task.id().as_str()),
            task: (&view.task).into(),
            files: view.files.into_iter().map(FileDto::from).collect(),
            model: view.model.map(ModelDto::from),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPageDto {
    pub items: Vec<TaskDto>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl From<TaskPage> for TaskPageDto {
    fn from(page: TaskPage) -> Self {
        Self {
            items: page.items.iter().map(TaskDto::from).collect(),
            total: page.total,
            page: page.page,
            page_size: page.page_size,
        }
    }
}

// ============================================================================
// Callback DTOs
// ============================================================================

/// 推理服务状态回调
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCallbackRequest {
    #[serde(alias = "task_id")]
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAckDto {
    pub task_id: String,
    pub status: TaskStatus,
}

// ============================================================================
// Connection DTOs
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDto {
    #[serde(flatten)]
    pub connection: ConnectionStatus,
    pub pending_tasks: usize,
}
