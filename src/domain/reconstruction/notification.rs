//! Reconstruction Context - 入站通知
//!
//! 推理服务（WebSocket 帧或 HTTP 回调）推送的进度统一建模为一个和类型，
//! 由 ResultAssembler 显式分派。

use super::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskNotification {
    /// 一个具名结果分片
    Part {
        name: String,
        content_type: String,
        bytes: Vec<u8>,
    },
    /// 状态变更（processing / completed / failed）
    StatusUpdate {
        status: TaskStatus,
        error: Option<String>,
    },
}

impl TaskNotification {
    pub fn failed(error: impl Into<String>) -> Self {
        TaskNotification::StatusUpdate {
            status: TaskStatus::Failed,
            error: Some(error.into()),
        }
    }

    /// 将推理服务的状态字符串转换为通知
    ///
    /// 未知状态按失败处理。
    pub fn from_wire_status(status: &str, error: Option<String>) -> Self {
        match TaskStatus::from_wire(status) {
            Some(status) => TaskNotification::StatusUpdate {
                status,
                error: error.filter(|e| !e.trim().is_empty()),
            },
            None => TaskNotification::failed(format!("Unknown task status: {}", status)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskNotification::Part { .. } => "part",
            TaskNotification::StatusUpdate { .. } => "status",
        }
    }
}
