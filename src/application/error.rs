//! 应用层错误定义
//!
//! 统一的命令/查询错误类型。前五个变体是编排层的失败分类，
//! 其 Display 文本会原样写入任务的 error_message。

use std::time::Duration;
use thiserror::Error;

use crate::domain::reconstruction::ReconstructionError;

/// 应用层错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    /// 引用了不存在的任务
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// 连接级失败，触发全部在途关联状态的清理
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// 在超时上限内未收到终态信号
    #[error("Submission timed out after {}s", .0.as_secs())]
    SubmissionTimeout(Duration),

    /// 结果压缩包损坏
    #[error("Archive corruption: {0}")]
    ArchiveCorruption(String),

    /// 存储读写失败
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// 调用方主动取消
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// 资源未找到
    #[error("{resource_type} not found: {id}")]
    NotFound {
        resource_type: &'static str,
        id: String,
    },

    /// 验证错误
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// 状态无效
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// 仓储错误
    #[error("Repository error: {0}")]
    RepositoryError(String),

    /// 外部服务错误
    #[error("External service error: {0}")]
    ExternalServiceError(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ApplicationError {
    pub fn unknown_task(id: impl std::fmt::Display) -> Self {
        Self::UnknownTask(id.to_string())
    }

    /// 创建 NotFound 错误
    pub fn not_found(resource_type: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// 创建验证错误
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    /// 创建状态无效错误
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// 创建内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }
}

impl From<crate::application::ports::RepositoryError> for ApplicationError {
    fn from(err: crate::application::ports::RepositoryError) -> Self {
        Self::RepositoryError(err.to_string())
    }
}

impl From<crate::application::ports::ArtifactStorageError> for ApplicationError {
    fn from(err: crate::application::ports::ArtifactStorageError) -> Self {
        use crate::application::ports::ArtifactStorageError;
        match err {
            ArtifactStorageError::NotFound(key) => Self::not_found("Artifact", key),
            other => Self::StorageFailure(other.to_string()),
        }
    }
}

impl From<crate::application::ports::TransportError> for ApplicationError {
    fn from(err: crate::application::ports::TransportError) -> Self {
        Self::TransportFailure(err.to_string())
    }
}

impl From<ReconstructionError> for ApplicationError {
    fn from(err: ReconstructionError) -> Self {
        match err {
            ReconstructionError::InvalidTaskId(_) | ReconstructionError::InvalidPartName(_) => {
                Self::ValidationError(err.to_string())
            }
            _ => Self::InvalidState(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classified_messages() {
        assert_eq!(
            ApplicationError::SubmissionTimeout(Duration::from_secs(300)).to_string(),
            "Submission timed out after 300s"
        );
        assert!(ApplicationError::TransportFailure("Connection closed".into())
            .to_string()
            .starts_with("Transport failure"));
    }
}
