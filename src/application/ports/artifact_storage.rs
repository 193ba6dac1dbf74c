//! Artifact Storage Port - 出站端口
//!
//! 结果产物按 `<prefix>/<taskId>/<partName>` 存放，每个任务一个扁平命名空间

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::reconstruction::TaskId;

/// 产物存储错误
#[derive(Debug, Error)]
pub enum ArtifactStorageError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact name: {0:?}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// 已保存的产物
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// `<prefix>/<taskId>/<name>`
    pub key: String,
    /// 对外访问 URL
    pub url: String,
    pub size: u64,
}

/// 产物名只能是单个路径段
pub fn validate_artifact_name(name: &str) -> Result<(), ArtifactStorageError> {
    let invalid = name.is_empty()
        || name.len() > 255
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.chars().any(|c| c.is_control());
    if invalid {
        return Err(ArtifactStorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Artifact Storage Port
#[async_trait]
pub trait ArtifactStoragePort: Send + Sync {
    /// 存储键
    fn artifact_key(&self, task_id: &TaskId, name: &str) -> String;

    /// 对外访问 URL
    fn public_url(&self, task_id: &TaskId, name: &str) -> String;

    /// 保存（覆盖同名产物）
    async fn save(
        &self,
        task_id: &TaskId,
        name: &str,
        data: &[u8],
    ) -> Result<StoredArtifact, ArtifactStorageError>;

    async fn read(&self, task_id: &TaskId, name: &str) -> Result<Vec<u8>, ArtifactStorageError>;

    /// 列出任务命名空间下的全部产物名（排序），命名空间不存在时返回空
    async fn list(&self, task_id: &TaskId) -> Result<Vec<String>, ArtifactStorageError>;
}
