//! Reconstruction Queries - 重建任务读操作

use crate::application::ports::ModelRecord;
use crate::domain::reconstruction::{ReconstructionTask, TaskId, TaskStatus};

/// 查询任务当前状态
#[derive(Debug, Clone)]
pub struct GetTaskStatus {
    pub task_id: TaskId,
}

/// 已存储的产物
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub name: String,
    pub url: String,
}

/// 任务视图：当前状态 + 已经可用的产物
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task: ReconstructionTask,
    pub files: Vec<ArtifactFile>,
    pub model: Option<ModelRecord>,
}

/// 用户任务列表
#[derive(Debug, Clone)]
pub struct ListTasks {
    pub user_id: i64,
    pub status: Option<TaskStatus>,
    pub page: u32,
    pub page_size: u32,
}

/// 读取单个产物
#[derive(Debug, Clone)]
pub struct GetArtifact {
    pub task_id: TaskId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactContent {
    pub data: Vec<u8>,
    pub content_type: &'static str,
}
