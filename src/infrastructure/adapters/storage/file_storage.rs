//! File Storage - 文件系统产物存储实现
//!
//! 实现 ArtifactStoragePort trait，目录布局 `<root>/<prefix>/<taskId>/<name>`

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::application::ports::{
    validate_artifact_name, ArtifactStorageError, ArtifactStoragePort, StoredArtifact,
};
use crate::domain::reconstruction::TaskId;

/// 文件系统产物存储
pub struct FileArtifactStorage {
    /// `<root>/<prefix>`
    base_dir: PathBuf,
    prefix: String,
    /// 对外访问地址，例如 `http://localhost:8090`
    public_base_url: String,
}

impl FileArtifactStorage {
    /// 创建新的文件存储
    pub async fn new(
        root_dir: impl AsRef<Path>,
        prefix: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Result<Self, ArtifactStorageError> {
        let prefix = prefix.into();
        let base_dir = root_dir.as_ref().join(&prefix);

        // 确保目录存在
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| ArtifactStorageError::IoError(e.to_string()))?;

        Ok(Self {
            base_dir,
            prefix,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// 获取存储根目录
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.base_dir.join(task_id.as_str())
    }

    fn artifact_path(&self, task_id: &TaskId, name: &str) -> Result<PathBuf, ArtifactStorageError> {
        validate_artifact_name(name)?;
        Ok(self.task_dir(task_id).join(name))
    }
}

#[async_trait]
impl ArtifactStoragePort for FileArtifactStorage {
    fn artifact_key(&self, task_id: &TaskId, name: &str) -> String {
        format!("{}/{}/{}", self.prefix, task_id, name)
    }

    fn public_url(&self, task_id: &TaskId, name: &str) -> String {
        format!(
            "{}/api/reconstruction/files/{}/{}",
            self.public_base_url, task_id, name
        )
    }

    async fn save(
        &self,
        task_id: &TaskId,
        name: &str,
        data: &[u8],
    ) -> Result<StoredArtifact, ArtifactStorageError> {
        let path = self.artifact_path(task_id, name)?;

        // 确保任务目录存在
        fs::create_dir_all(self.task_dir(task_id))
            .await
            .map_err(|e| ArtifactStorageError::IoError(e.to_string()))?;

        // 先写临时文件再改名，读者不会看到写了一半的产物
        let staging = self.task_dir(task_id).join(format!(".{}.part", name));
        fs::write(&staging, data)
            .await
            .map_err(|e| ArtifactStorageError::IoError(e.to_string()))?;
        fs::rename(&staging, &path)
            .await
            .map_err(|e| ArtifactStorageError::IoError(e.to_string()))?;

        tracing::debug!(
            task_id = %task_id,
            name,
            size = data.len(),
            "Artifact saved"
        );

        Ok(StoredArtifact {
            key: self.artifact_key(task_id, name),
            url: self.public_url(task_id, name),
            size: data.len() as u64,
        })
    }

    async fn read(&self, task_id: &TaskId, name: &str) -> Result<Vec<u8>, ArtifactStorageError> {
        let path = self.artifact_path(task_id, name)?;

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                ArtifactStorageError::NotFound(self.artifact_key(task_id, name)),
            ),
            Err(e) => Err(ArtifactStorageError::IoError(e.to_string())),
        }
    }

    async fn list(&self, task_id: &TaskId) -> Result<Vec<String>, ArtifactStorageError> {
        let dir = self.task_dir(task_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ArtifactStorageError::IoError(e.to_string())),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ArtifactStorageError::IoError(e.to_string()))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }
}
