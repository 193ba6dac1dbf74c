//! TaskStateStore - 任务状态读写
//!
//! 包装 TaskRepositoryPort，所有写操作都是"读取 → 聚合内校验 → 条件写入"，
//! 版本冲突时重新读取后重试。重放当前状态不产生写入。

use std::sync::Arc;

use crate::application::error::ApplicationError;
use crate::application::ports::{TaskListQuery, TaskPage, TaskRepositoryPort};
use crate::domain::reconstruction::{
    ArtifactRole, ReconstructionError, ReconstructionTask, TaskId, TaskStatus, Transition,
};

/// 乐观锁冲突时的最大尝试次数
const MAX_WRITE_ATTEMPTS: usize = 3;

pub struct TaskStateStore {
    repo: Arc<dyn TaskRepositoryPort>,
}

impl TaskStateStore {
    pub fn new(repo: Arc<dyn TaskRepositoryPort>) -> Self {
        Self { repo }
    }

    pub fn arc(repo: Arc<dyn TaskRepositoryPort>) -> Arc<Self> {
        Arc::new(Self::new(repo))
    }

    /// 创建 PENDING 任务
    pub async fn create(
        &self,
        user_id: i64,
        source_image_id: Option<i64>,
    ) -> Result<ReconstructionTask, ApplicationError> {
        let task = ReconstructionTask::new(user_id, source_image_id);
        self.repo.insert(&task).await?;
        tracing::info!(task_id = %task.id(), user_id, "Reconstruction task created");
        Ok(task)
    }

    /// 查找任务，已删除的任务视为不存在
    pub async fn find(&self, id: &TaskId) -> Result<Option<ReconstructionTask>, ApplicationError> {
        Ok(self.repo.find_by_id(id).await?.filter(|t| !t.is_deleted()))
    }

    pub async fn get(&self, id: &TaskId) -> Result<ReconstructionTask, ApplicationError> {
        self.find(id)
            .await?
            .ok_or_else(|| ApplicationError::unknown_task(id))
    }

    pub async fn list(&self, query: &TaskListQuery) -> Result<TaskPage, ApplicationError> {
        Ok(self.repo.list_by_user(query).await?)
    }

    /// 更新状态，COMPLETED 只能通过 `update_result_model` 进入
    pub async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<ReconstructionTask, ApplicationError> {
        let task = self
            .modify(id, |task| task.advance(status, error.clone()))
            .await?;
        tracing::debug!(task_id = %id, status = %task.status(), "Task status updated");
        Ok(task)
    }

    pub async fn update_result_artifact(
        &self,
        id: &TaskId,
        role: ArtifactRole,
        url: &str,
    ) -> Result<ReconstructionTask, ApplicationError> {
        self.modify(id, |task| task.attach_artifact(role, url.to_string()))
            .await
    }

    /// 关联结果模型并进入 COMPLETED
    pub async fn update_result_model(
        &self,
        id: &TaskId,
        model_id: i64,
    ) -> Result<ReconstructionTask, ApplicationError> {
        let task = self.modify(id, |task| task.complete(model_id)).await?;
        tracing::info!(
            task_id = %id,
            model_id,
            processing_secs = ?task.processing_secs(),
            "Task completed"
        );
        Ok(task)
    }

    /// 逻辑删除
    pub async fn delete(
        &self,
        id: &TaskId,
        user_id: i64,
    ) -> Result<ReconstructionTask, ApplicationError> {
        self.modify(id, |task| task.mark_deleted(user_id)).await
    }

    async fn modify<F>(&self, id: &TaskId, mutate: F) -> Result<ReconstructionTask, ApplicationError>
    where
        F: Fn(&mut ReconstructionTask) -> Result<Transition, ReconstructionError> + Send + Sync,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut task = self.get(id).await?;
            let expected_version = task.version();

            if !mutate(&mut task)?.is_applied() {
                return Ok(task);
            }
            if self.repo.update(&task, expected_version).await? {
                return Ok(task);
            }

            tracing::debug!(task_id = %id, attempt, "Version conflict, retrying write");
        }

        Err(ApplicationError::internal(format!(
            "Task {} kept changing concurrently, gave up after {} attempts",
            id, MAX_WRITE_ATTEMPTS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::RepositoryError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 内存仓储，前 `conflicts` 次更新模拟版本冲突
    #[derive(Default)]
    struct MemoryRepo {
        tasks: Mutex<HashMap<String, ReconstructionTask>>,
        conflicts: AtomicUsize,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl TaskRepositoryPort for MemoryRepo {
        async fn insert(&self, task: &ReconstructionTask) -> Result<(), RepositoryError> {
            self.tasks
                .lock()
                .unwrap()
                .insert(task.id().to_string(), task.clone());
            Ok(())
        }

        async fn find_by_id(
            &self,
            id: &TaskId,
        ) -> Result<Option<ReconstructionTask>, RepositoryError> {
            Ok(self.tasks.lock().unwrap().get(id.as_str()).cloned())
        }

        async fn update(
            &self,
            task: &ReconstructionTask,
            expected_version: i64,
        ) -> Result<bool, RepositoryError> {
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(false);
            }
            let mut tasks = self.tasks.lock().unwrap();
            let current = tasks.get(task.id().as_str()).map(|t| t.version());
            if current != Some(expected_version) {
                return Ok(false);
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            tasks.insert(task.id().to_string(), task.clone());
            Ok(true)
        }

        async fn list_by_user(&self, query: &TaskListQuery) -> Result<TaskPage, RepositoryError> {
            let items: Vec<_> = self
                .tasks
                .lock()
                .unwrap()
                .values()
                .filter(|t| t.user_id() == query.user_id)
                .cloned()
                .collect();
            Ok(TaskPage {
                total: items.len() as u64,
                items,
                page: query.page,
                page_size: query.page_size,
            })
        }
    }

    fn store_with(repo: Arc<MemoryRepo>) -> TaskStateStore {
        TaskStateStore::new(repo)
    }

    #[tokio::test]
    async fn test_reapplying_status_does_not_write() {
        let repo = Arc::new(MemoryRepo::default());
        let store = store_with(repo.clone());
        let task = store.create(1, Some(2)).await.unwrap();

        store
            .update_status(task.id(), TaskStatus::Processing, None)
            .await
            .unwrap();
        store
            .update_status(task.id(), TaskStatus::Processing, None)
            .await
            .unwrap();

        assert_eq!(repo.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_only_through_result_model() {
        let store = store_with(Arc::new(MemoryRepo::default()));
        let task = store.create(1, None).await.unwrap();

        let err = store
            .update_status(task.id(), TaskStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::InvalidState(_)));

        let done = store.update_result_model(task.id(), 11).await.unwrap();
        assert_eq!(done.status(), TaskStatus::Completed);
        assert_eq!(done.result_model_id(), Some(11));
        assert!(done.error_message().is_none());
    }

    #[tokio::test]
    async fn test_retries_lost_version_race() {
        let repo = Arc::new(MemoryRepo::default());
        let store = store_with(repo.clone());
        let task = store.create(1, None).await.unwrap();

        repo.conflicts.store(2, Ordering::SeqCst);
        let updated = store
            .update_status(task.id(), TaskStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        assert_eq!(updated.error_message(), Some("boom"));

        repo.conflicts.store(MAX_WRITE_ATTEMPTS, Ordering::SeqCst);
        let other = store.create(1, None).await.unwrap();
        assert!(store
            .update_status(other.id(), TaskStatus::Processing, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_and_deleted_tasks() {
        let store = store_with(Arc::new(MemoryRepo::default()));
        let missing = TaskId::new();
        assert_eq!(
            store.get(&missing).await.unwrap_err(),
            ApplicationError::unknown_task(&missing)
        );

        let task = store.create(5, None).await.unwrap();
        store
            .update_status(task.id(), TaskStatus::Failed, None)
            .await
            .unwrap();
        store.delete(task.id(), 5).await.unwrap();
        assert!(store.find(task.id()).await.unwrap().is_none());
    }
}
