//! Repository Ports - 出站端口
//!
//! 定义数据持久化的抽象接口
//! 具体实现在 infrastructure 层（SQLite）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::reconstruction::{ArtifactUrls, ReconstructionTask, TaskId, TaskStatus};

/// Repository 错误
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Duplicate entity: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

// ============================================================================
// Task Repository
// ============================================================================

/// 用户任务列表查询
#[derive(Debug, Clone)]
pub struct TaskListQuery {
    pub user_id: i64,
    pub status: Option<TaskStatus>,
    /// 从 1 开始
    pub page: u32,
    pub page_size: u32,
}

impl TaskListQuery {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) as i64 - 1) * self.page_size as i64
    }
}

/// 分页结果
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub items: Vec<ReconstructionTask>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Task Repository Port
///
/// 更新使用乐观锁：只有当库中 version 等于 `expected_version` 时才写入。
#[async_trait]
pub trait TaskRepositoryPort: Send + Sync {
    /// 插入新任务
    async fn insert(&self, task: &ReconstructionTask) -> Result<(), RepositoryError>;

    /// 根据 ID 查找（包含已逻辑删除的任务）
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<ReconstructionTask>, RepositoryError>;

    /// 条件更新，返回是否写入成功
    async fn update(
        &self,
        task: &ReconstructionTask,
        expected_version: i64,
    ) -> Result<bool, RepositoryError>;

    /// 用户任务列表（按创建时间倒序，排除已删除）
    async fn list_by_user(&self, query: &TaskListQuery) -> Result<TaskPage, RepositoryError>;
}

// ============================================================================
// Model Catalog
// ============================================================================

/// 待登记的结果模型
#[derive(Debug, Clone)]
pub struct ModelDraft {
    pub task_id: TaskId,
    pub user_id: i64,
    pub source_image_id: Option<i64>,
    pub name: String,
    pub format: String,
    pub artifacts: ArtifactUrls,
}

impl ModelDraft {
    pub fn for_task(task: &ReconstructionTask) -> Self {
        Self {
            task_id: task.id().clone(),
            user_id: task.user_id(),
            source_image_id: task.source_image_id(),
            name: format!("3D Model - {}", task.id()),
            format: "OBJ".to_string(),
            artifacts: task.artifacts().clone(),
        }
    }
}

/// 已登记的结果模型
#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub id: i64,
    pub task_id: TaskId,
    pub user_id: i64,
    pub source_image_id: Option<i64>,
    pub name: String,
    pub format: String,
    pub artifacts: ArtifactUrls,
    pub created_at: DateTime<Utc>,
}

/// Model Catalog Port
///
/// 模型元数据由外部协作方管理，这里只需要登记并拿回模型 ID。
#[async_trait]
pub trait ModelCatalogPort: Send + Sync {
    /// 登记模型，同一任务重复登记返回同一个 ID
    async fn register(&self, draft: &ModelDraft) -> Result<i64, RepositoryError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<ModelRecord>, RepositoryError>;
}
