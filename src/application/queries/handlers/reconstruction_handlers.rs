//! Reconstruction Query Handlers

use std::sync::Arc;

use crate::application::error::ApplicationError;
use crate::application::ports::{
    validate_artifact_name, ArtifactStoragePort, ModelCatalogPort, TaskListQuery, TaskPage,
};
use crate::application::queries::reconstruction_queries::*;
use crate::application::task_state::TaskStateStore;

const MAX_PAGE_SIZE: u32 = 100;

/// 按扩展名推断产物的 Content-Type
pub fn artifact_content_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "obj" => "model/obj",
        "mtl" => "model/mtl",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// GetTaskStatus Handler - 状态轮询
///
/// 始终返回当前已知状态；只有任务确实不存在时才报错。
pub struct GetTaskStatusHandler {
    store: Arc<TaskStateStore>,
    storage: Arc<dyn ArtifactStoragePort>,
    models: Arc<dyn ModelCatalogPort>,
}

impl GetTaskStatusHandler {
    pub fn new(
        store: Arc<TaskStateStore>,
        storage: Arc<dyn ArtifactStoragePort>,
        models: Arc<dyn ModelCatalogPort>,
    ) -> Self {
        Self {
            store,
            storage,
            models,
        }
    }

    pub async fn handle(&self, query: GetTaskStatus) -> Result<TaskView, ApplicationError> {
        let task = self.store.get(&query.task_id).await?;

        // 产物列表只是附加信息，读取失败不影响状态返回
        let files = match self.storage.list(&query.task_id).await {
            Ok(names) => names
                .into_iter()
                .map(|name| ArtifactFile {
                    url: self.storage.public_url(&query.task_id, &name),
                    name,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(task_id = %query.task_id, error = %e, "Failed to list artifacts");
                Vec::new()
            }
        };

        let model = match task.result_model_id() {
            Some(model_id) => self.models.find_by_id(model_id).await.unwrap_or_else(|e| {
                tracing::warn!(task_id = %query.task_id, model_id, error = %e, "Failed to load result model");
                None
            }),
            None => None,
        };

        Ok(TaskView { task, files, model })
    }
}

/// ListTasks Handler
pub struct ListTasksHandler {
    store: Arc<TaskStateStore>,
}

impl ListTasksHandler {
    pub fn new(store: Arc<TaskStateStore>) -> Self {
        Self { store }
    }

    pub async fn handle(&self, query: ListTasks) -> Result<TaskPage, ApplicationError> {
        if query.page_size == 0 || query.page_size > MAX_PAGE_SIZE {
            return Err(ApplicationError::validation(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        self.store
            .list(&TaskListQuery {
                user_id: query.user_id,
                status: query.status,
                page: query.page.max(1),
                page_size: query.page_size,
            })
            .await
    }
}

/// GetArtifact Handler - 读取已存储产物
pub struct GetArtifactHandler {
    storage: Arc<dyn ArtifactStoragePort>,
}

impl GetArtifactHandler {
    pub fn new(storage: Arc<dyn ArtifactStoragePort>) -> Self {
        Self { storage }
    }

    pub async fn handle(&self, query: GetArtifact) -> Result<ArtifactContent, ApplicationError> {
        validate_artifact_name(&query.name)
            .map_err(|e| ApplicationError::validation(e.to_string()))?;

        let data = self.storage.read(&query.task_id, &query.name).await?;

        Ok(ArtifactContent {
            data,
            content_type: artifact_content_type(&query.name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_content_type() {
        assert_eq!(artifact_content_type("pixel_images.png"), "image/png");
        assert_eq!(artifact_content_type("texture.JPEG"), "image/jpeg");
        assert_eq!(artifact_content_type("model.obj"), "model/obj");
        assert_eq!(artifact_content_type("model.mtl"), "model/mtl");
        assert_eq!(artifact_content_type("output3d.zip"), "application/zip");
        assert_eq!(artifact_content_type("notes"), "application/octet-stream");
    }
}
