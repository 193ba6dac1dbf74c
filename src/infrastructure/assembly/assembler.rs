//! Result Assembler - 结果分片组装
//!
//! 消费按任务解复用后的 `TaskNotification`：
//! - `Part`: 原样落盘，压缩包额外解包归类，记录已收分片，齐全后完成任务
//! - `StatusUpdate`: 推进状态机，`completed` 需要必需分片齐全
//!
//! 组装过程中的任何存储/解包失败都会把任务置为 FAILED，不会停在 PROCESSING。
//! 同一任务的通知按到达顺序串行处理，不同任务之间互不阻塞。

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::archive::unpack_archive_blocking;
use crate::application::error::ApplicationError;
use crate::application::ports::{
    validate_artifact_name, ArtifactStoragePort, ModelCatalogPort, ModelDraft, NotificationSink,
};
use crate::application::task_state::TaskStateStore;
use crate::domain::reconstruction::{
    is_archive_part, missing_required_parts, ArtifactRole, TaskId, TaskNotification, TaskStatus,
};
use crate::infrastructure::events::EventBroadcaster;
use crate::infrastructure::memory::PartialResultRegistry;

const SERVICE_FAILURE: &str = "Inference service reported failure";

/// 结果组装器
pub struct ResultAssembler {
    store: Arc<TaskStateStore>,
    storage: Arc<dyn ArtifactStoragePort>,
    models: Arc<dyn ModelCatalogPort>,
    events: Arc<EventBroadcaster>,
    partials: Arc<PartialResultRegistry>,
    /// 每个任务一把锁，任务没有在途通知时移除
    task_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ResultAssembler {
    pub fn new(
        store: Arc<TaskStateStore>,
        storage: Arc<dyn ArtifactStoragePort>,
        models: Arc<dyn ModelCatalogPort>,
        events: Arc<EventBroadcaster>,
        partials: Arc<PartialResultRegistry>,
    ) -> Self {
        Self {
            store,
            storage,
            models,
            events,
            partials,
            task_locks: DashMap::new(),
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    async fn lock_task(&self, task_id: &TaskId) -> OwnedMutexGuard<()> {
        let lock = self
            .task_locks
            .entry(task_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn unlock_task(&self, task_id: &TaskId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        // 只剩表里这一份引用时才移除，等待中的调用方仍持有同一把锁
        self.task_locks
            .remove_if(task_id.as_str(), |_, lock| Arc::strong_count(lock) == 1);
    }

    /// 处理一个结果分片
    pub async fn on_part(
        &self,
        task_id: &TaskId,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<TaskStatus, ApplicationError> {
        let guard = self.lock_task(task_id).await;
        let outcome = self.handle_part(task_id, name, content_type, bytes).await;
        self.unlock_task(task_id, guard);
        outcome
    }

    async fn handle_part(
        &self,
        task_id: &TaskId,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<TaskStatus, ApplicationError> {
        let task = self.store.get(task_id).await?;
        if task.status().is_terminal() {
            tracing::warn!(
                task_id = %task_id,
                name,
                status = %task.status(),
                "Result part for finished task ignored"
            );
            return Ok(task.status());
        }

        match self.assemble_part(task_id, name, content_type, bytes).await {
            Ok(status) => Ok(status),
            Err(e) => {
                tracing::error!(task_id = %task_id, name, error = %e, "Result assembly failed");
                self.fail(task_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn assemble_part(
        &self,
        task_id: &TaskId,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<TaskStatus, ApplicationError> {
        validate_artifact_name(name).map_err(|e| ApplicationError::StorageFailure(e.to_string()))?;

        self.promote(task_id).await?;

        let stored = self.storage.save(task_id, name, &bytes).await?;
        tracing::info!(
            task_id = %task_id,
            name,
            content_type,
            size = stored.size,
            "Result part stored"
        );

        if is_archive_part(name, content_type) {
            let files = unpack_archive_blocking(bytes).await?;
            tracing::debug!(task_id = %task_id, name, files = files.len(), "Archive unpacked");

            // 按包内顺序写入，同一角色后者覆盖前者
            for file in files {
                let inner = self.storage.save(task_id, &file.name, &file.data).await?;
                if let Some(role) = file.role {
                    self.store
                        .update_result_artifact(task_id, role, &inner.url)
                        .await?;
                }
                self.events.publish_result(task_id, &file.name, &inner.url);
            }
        } else if let Some(role) = ArtifactRole::from_part_name(name) {
            self.store
                .update_result_artifact(task_id, role, &stored.url)
                .await?;
        }
        self.events.publish_result(task_id, name, &stored.url);

        let received = self.partials.record(task_id, name);
        let missing = missing_required_parts(&received);
        if missing.is_empty() {
            return self.finalize(task_id).await;
        }

        tracing::debug!(task_id = %task_id, ?missing, "Waiting for remaining parts");
        Ok(TaskStatus::Processing)
    }

    /// 处理状态通知
    pub async fn on_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<TaskStatus, ApplicationError> {
        let guard = self.lock_task(task_id).await;
        let outcome = self.handle_status(task_id, status, error).await;
        self.unlock_task(task_id, guard);
        outcome
    }

    async fn handle_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<TaskStatus, ApplicationError> {
        let task = self.store.get(task_id).await?;
        if task.status().is_terminal() {
            if task.status() != status {
                tracing::warn!(
                    task_id = %task_id,
                    current = %task.status(),
                    reported = %status,
                    "Status update for finished task ignored"
                );
            }
            return Ok(task.status());
        }

        match status {
            TaskStatus::Pending => Ok(task.status()),
            TaskStatus::Processing => {
                self.partials.touch(task_id);
                self.promote(task_id).await?;
                Ok(TaskStatus::Processing)
            }
            TaskStatus::Completed => {
                let missing = missing_required_parts(&self.partials.received(task_id));
                if missing.is_empty() {
                    match self.finalize(task_id).await {
                        Ok(status) => Ok(status),
                        Err(e) => Ok(self.fail(task_id, &e.to_string()).await),
                    }
                } else {
                    let message = format!(
                        "Inference finished without required parts: {}",
                        missing.join(", ")
                    );
                    Ok(self.fail(task_id, &message).await)
                }
            }
            TaskStatus::Failed => {
                let message = error.unwrap_or_else(|| SERVICE_FAILURE.to_string());
                Ok(self.fail(task_id, &message).await)
            }
        }
    }

    /// PENDING → PROCESSING，已是 PROCESSING 时不产生写入也不推送
    async fn promote(&self, task_id: &TaskId) -> Result<(), ApplicationError> {
        let before = self.store.get(task_id).await?;
        if before.status() != TaskStatus::Pending {
            return Ok(());
        }
        let task = self
            .store
            .update_status(task_id, TaskStatus::Processing, None)
            .await?;
        self.events.publish_status(task_id, task.status(), None);
        Ok(())
    }

    /// 登记结果模型并进入 COMPLETED
    async fn finalize(&self, task_id: &TaskId) -> Result<TaskStatus, ApplicationError> {
        let task = self.store.get(task_id).await?;
        let model_id = self.models.register(&ModelDraft::for_task(&task)).await?;
        let task = self.store.update_result_model(task_id, model_id).await?;
        self.partials.remove(task_id);

        self.events.publish_status(task_id, task.status(), None);
        self.events.close(task_id, "completed");
        Ok(task.status())
    }

    /// 强制失败，返回最终已知状态
    ///
    /// 写入失败时只记录日志，轮询仍返回当前已知状态。
    async fn fail(&self, task_id: &TaskId, message: &str) -> TaskStatus {
        self.partials.remove(task_id);

        let status = match self
            .store
            .update_status(task_id, TaskStatus::Failed, Some(message.to_string()))
            .await
        {
            Ok(task) => {
                tracing::warn!(task_id = %task_id, error = message, "Reconstruction failed");
                self.events
                    .publish_status(task_id, task.status(), task.error_message());
                task.status()
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to record task failure");
                match self.store.find(task_id).await {
                    Ok(Some(task)) => task.status(),
                    _ => TaskStatus::Failed,
                }
            }
        };

        self.events.close(task_id, "failed");
        status
    }

    /// 回收超过 TTL 未更新的部分结果，未结束的任务按超时失败
    pub async fn evict_expired(&self, ttl: Duration) -> usize {
        let evicted = self.partials.evict_idle(ttl);
        let mut failed = 0;

        for task_id in &evicted {
            let guard = self.lock_task(task_id).await;
            match self.store.find(task_id).await {
                Ok(Some(task)) if !task.status().is_terminal() => {
                    let message = ApplicationError::SubmissionTimeout(ttl).to_string();
                    self.fail(task_id, &message).await;
                    failed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to load evicted task");
                }
            }
            self.unlock_task(task_id, guard);
        }

        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), failed, "Evicted stale partial results");
        }
        evicted.len()
    }
}

#[async_trait]
impl NotificationSink for ResultAssembler {
    async fn deliver(
        &self,
        task_id: &TaskId,
        notification: TaskNotification,
    ) -> Result<TaskStatus, ApplicationError> {
        match notification {
            TaskNotification::Part {
                name,
                content_type,
                bytes,
            } => self.on_part(task_id, &name, &content_type, bytes).await,
            TaskNotification::StatusUpdate { status, error } => {
                self.on_status(task_id, status, error).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::TaskRepositoryPort;
    use crate::infrastructure::adapters::storage::FileArtifactStorage;
    use crate::infrastructure::assembly::archive::tests::build_zip;
    use crate::infrastructure::events::{BroadcasterSettings, PushEvent};
    use crate::infrastructure::persistence::sqlite::{
        create_pool, run_migrations, DatabaseConfig, SqliteModelCatalog, SqliteTaskRepository,
    };
    use tempfile::TempDir;

    struct Fixture {
        assembler: Arc<ResultAssembler>,
        storage: Arc<FileArtifactStorage>,
        store: Arc<TaskStateStore>,
        events: Arc<EventBroadcaster>,
        partials: Arc<PartialResultRegistry>,
        models: Arc<SqliteModelCatalog>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let pool = create_pool(&DatabaseConfig::in_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo: Arc<dyn TaskRepositoryPort> = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let models = Arc::new(SqliteModelCatalog::new(pool));
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(
            FileArtifactStorage::new(dir.path(), "reconstruction", "http://files")
                .await
                .unwrap(),
        );
        let store = TaskStateStore::arc(repo);
        let events = EventBroadcaster::new(BroadcasterSettings {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1800),
            channel_capacity: 64,
        })
        .arc();
        let partials = PartialResultRegistry::new().arc();

        Fixture {
            assembler: ResultAssembler::new(
                store.clone(),
                storage.clone(),
                models.clone(),
                events.clone(),
                partials.clone(),
            )
            .arc(),
            storage,
            store,
            events,
            partials,
            models,
            _dir: dir,
        }
    }

    fn model_zip() -> Vec<u8> {
        build_zip(&[
            ("mesh/", b""),
            ("mesh/mesh.obj", b"mtllib mesh.mtl\nv 0 0 0"),
            ("mesh/mesh.mtl", b"newmtl m\nmap_Bump normal.png\nmap_Kd albedo.png"),
            ("mesh/normal.png", b"normal"),
            ("mesh/albedo.png", b"albedo"),
            ("readme.txt", b"notes"),
        ])
    }

    #[tokio::test]
    async fn test_full_part_sequence_completes() {
        let f = fixture().await;
        let task = f.store.create(7, Some(70)).await.unwrap();
        let id = task.id().clone();

        let status = f
            .assembler
            .on_part(&id, "pixel_images.png", "image/png", b"p".to_vec())
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Processing);
        let mid = f.store.get(&id).await.unwrap();
        assert_eq!(mid.status(), TaskStatus::Processing);
        assert_eq!(
            mid.artifacts().pixel_image.as_deref(),
            Some(format!("http://files/api/reconstruction/files/{}/pixel_images.png", id).as_str())
        );

        f.assembler
            .on_part(&id, "xyz_images.png", "image/png", b"x".to_vec())
            .await
            .unwrap();
        let status = f
            .assembler
            .on_part(&id, "output3d.zip", "application/zip", model_zip())
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let done = f.store.get(&id).await.unwrap();
        assert_eq!(done.status(), TaskStatus::Completed);
        assert!(done.artifacts().is_complete());
        assert!(done
            .artifacts()
            .geometry
            .as_deref()
            .unwrap()
            .ends_with("/mesh.obj"));
        // 同一角色后者覆盖前者
        assert!(done
            .artifacts()
            .texture
            .as_deref()
            .unwrap()
            .ends_with("/albedo.png"));

        // OBJ / MTL 引用的文件都按原名落盘
        let stored = f.storage.list(&id).await.unwrap();
        for name in ["mesh.obj", "mesh.mtl", "normal.png", "albedo.png", "readme.txt"] {
            assert!(stored.iter().any(|s| s == name), "{} not stored: {:?}", name, stored);
        }
        assert!(done.error_message().is_none());

        let model = f
            .models
            .find_by_id(done.result_model_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(model.name, format!("3D Model - {}", id));
        assert_eq!(model.format, "OBJ");
        assert_eq!(model.user_id, 7);
        assert!(f.partials.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_parts_for_one_task_complete() {
        let f = fixture().await;

        for _ in 0..20 {
            let id = f.store.create(3, None).await.unwrap().id().clone();
            let parts = [
                ("pixel_images.png", "image/png", b"p".to_vec()),
                ("xyz_images.png", "image/png", b"x".to_vec()),
                ("output3d.zip", "application/zip", model_zip()),
            ];

            let handles: Vec<_> = parts
                .into_iter()
                .map(|(name, content_type, bytes)| {
                    let assembler = f.assembler.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        assembler.on_part(&id, name, content_type, bytes).await
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            let task = f.store.get(&id).await.unwrap();
            assert_eq!(task.status(), TaskStatus::Completed, "{:?}", task.error_message());
            assert!(task.artifacts().is_complete());
            assert!(task.result_model_id().is_some());
        }

        assert!(f.assembler.task_locks.is_empty());
        assert!(f.partials.is_empty());
    }

    #[tokio::test]
    async fn test_two_of_three_parts_never_complete() {
        let f = fixture().await;
        let id = f.store.create(1, None).await.unwrap().id().clone();

        f.assembler
            .on_part(&id, "pixel_images.png", "image/png", b"p".to_vec())
            .await
            .unwrap();
        f.assembler
            .on_part(&id, "xyz_images.png", "image/png", b"x".to_vec())
            .await
            .unwrap();
        // 额外的未知分片不影响判定
        f.assembler
            .on_part(&id, "debug.bin", "application/octet-stream", b"d".to_vec())
            .await
            .unwrap();

        let task = f.store.get(&id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Processing);
        assert!(task.result_model_id().is_none());

        // completed 状态但分片不齐 → FAILED
        let status = f
            .assembler
            .on_status(&id, TaskStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
        let task = f.store.get(&id).await.unwrap();
        assert_eq!(
            task.error_message(),
            Some("Inference finished without required parts: output3d.zip")
        );
    }

    #[tokio::test]
    async fn test_corrupt_archive_forces_failure() {
        let f = fixture().await;
        let id = f.store.create(1, None).await.unwrap().id().clone();
        let mut sub = f.events.open(&id);
        assert_eq!(sub.receiver.recv().await, Some(PushEvent::Connect {}));

        let err = f
            .assembler
            .on_part(&id, "output3d.zip", "application/zip", b"not a zip".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::ArchiveCorruption(_)));

        let task = f.store.get(&id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task
            .error_message()
            .unwrap()
            .starts_with("Archive corruption:"));

        let mut events = Vec::new();
        while let Some(event) = sub.receiver.recv().await {
            events.push(event);
        }
        assert!(events.iter().any(|e| matches!(
            e,
            PushEvent::Status { status: TaskStatus::Failed, .. }
        )));
        assert!(events.last().unwrap().is_close());
    }

    #[tokio::test]
    async fn test_invalid_part_name_is_storage_failure() {
        let f = fixture().await;
        let id = f.store.create(1, None).await.unwrap().id().clone();

        let err = f
            .assembler
            .on_part(&id, "../x.png", "image/png", b"p".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::StorageFailure(_)));
        assert_eq!(f.store.get(&id).await.unwrap().status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_status_updates_are_monotone() {
        let f = fixture().await;
        let id = f.store.create(1, None).await.unwrap().id().clone();

        assert_eq!(
            f.assembler
                .on_status(&id, TaskStatus::Processing, None)
                .await
                .unwrap(),
            TaskStatus::Processing
        );
        assert_eq!(
            f.assembler
                .on_status(&id, TaskStatus::Failed, None)
                .await
                .unwrap(),
            TaskStatus::Failed
        );
        assert_eq!(
            f.store.get(&id).await.unwrap().error_message(),
            Some(SERVICE_FAILURE)
        );

        // 终态之后的通知全部忽略
        assert_eq!(
            f.assembler
                .on_status(&id, TaskStatus::Processing, None)
                .await
                .unwrap(),
            TaskStatus::Failed
        );
        assert_eq!(
            f.assembler
                .on_part(&id, "pixel_images.png", "image/png", b"p".to_vec())
                .await
                .unwrap(),
            TaskStatus::Failed
        );
        assert!(f.store.get(&id).await.unwrap().artifacts().pixel_image.is_none());
    }

    #[tokio::test]
    async fn test_unknown_task_surfaces_error() {
        let f = fixture().await;
        let err = f
            .assembler
            .deliver(&TaskId::new(), TaskNotification::failed("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::UnknownTask(_)));
    }

    #[tokio::test]
    async fn test_evict_expired_fails_abandoned_tasks() {
        let f = fixture().await;
        let id = f.store.create(1, None).await.unwrap().id().clone();
        f.assembler
            .on_part(&id, "pixel_images.png", "image/png", b"p".to_vec())
            .await
            .unwrap();

        assert_eq!(f.assembler.evict_expired(Duration::from_secs(3600)).await, 0);
        assert_eq!(f.assembler.evict_expired(Duration::ZERO).await, 1);

        let task = f.store.get(&id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error_message(), Some("Submission timed out after 0s"));
        assert!(f.partials.is_empty());
    }
}
