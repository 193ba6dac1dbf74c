//! Reconstruction Context - Aggregate Root

use chrono::{DateTime, Utc};

use super::{ArtifactRole, ArtifactUrls, ReconstructionError, TaskId, TaskStatus};

/// 失败但未给出原因时使用的错误信息
const UNKNOWN_FAILURE: &str = "Unknown failure";

/// 一次写操作的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 状态被修改，需要持久化
    Applied,
    /// 重放了当前状态，无需写入
    Unchanged,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// 聚合的全部字段，供持久化层重建
#[derive(Debug, Clone)]
pub struct TaskParts {
    pub id: TaskId,
    pub user_id: i64,
    pub source_image_id: Option<i64>,
    pub status: TaskStatus,
    pub result_model_id: Option<i64>,
    pub error_message: Option<String>,
    pub processing_secs: Option<i64>,
    pub artifacts: ArtifactUrls,
    pub version: i64,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// ReconstructionTask 聚合根
///
/// 不变量:
/// - 状态只能单调前进，终态（COMPLETED / FAILED）不再迁移
/// - result_model_id 非空 ⇔ status == COMPLETED
/// - error_message 非空 ⇔ status == FAILED
/// - 每次实际修改都会递增 version（乐观锁）
#[derive(Debug, Clone)]
pub struct ReconstructionTask {
    id: TaskId,
    user_id: i64,
    source_image_id: Option<i64>,
    status: TaskStatus,
    result_model_id: Option<i64>,
    error_message: Option<String>,
    processing_secs: Option<i64>,
    artifacts: ArtifactUrls,
    version: i64,
    deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ReconstructionTask {
    /// 创建新任务（PENDING）
    pub fn new(user_id: i64, source_image_id: Option<i64>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            user_id,
            source_image_id,
            status: TaskStatus::Pending,
            result_model_id: None,
            error_message: None,
            processing_secs: None,
            artifacts: ArtifactUrls::default(),
            version: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn rehydrate(parts: TaskParts) -> Self {
        Self {
            id: parts.id,
            user_id: parts.user_id,
            source_image_id: parts.source_image_id,
            status: parts.status,
            result_model_id: parts.result_model_id,
            error_message: parts.error_message,
            processing_secs: parts.processing_secs,
            artifacts: parts.artifacts,
            version: parts.version,
            deleted: parts.deleted,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        }
    }

    pub fn to_parts(&self) -> TaskParts {
        TaskParts {
            id: self.id.clone(),
            user_id: self.user_id,
            source_image_id: self.source_image_id,
            status: self.status,
            result_model_id: self.result_model_id,
            error_message: self.error_message.clone(),
            processing_secs: self.processing_secs,
            artifacts: self.artifacts.clone(),
            version: self.version,
            deleted: self.deleted,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// 推进状态（不含 COMPLETED，完成必须通过 `complete`）
    pub fn advance(
        &mut self,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Transition, ReconstructionError> {
        if status == self.status {
            return Ok(Transition::Unchanged);
        }
        if self.status.is_terminal() {
            return Err(ReconstructionError::AlreadyTerminal(self.status));
        }
        if status.rank() < self.status.rank() {
            return Err(ReconstructionError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }

        match status {
            TaskStatus::Pending => {
                return Err(ReconstructionError::InvalidTransition {
                    from: self.status,
                    to: status,
                })
            }
            TaskStatus::Completed => return Err(ReconstructionError::CompletionWithoutModel),
            TaskStatus::Processing => {
                self.status = TaskStatus::Processing;
            }
            TaskStatus::Failed => {
                let message = error
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| UNKNOWN_FAILURE.to_string());
                self.error_message = Some(message);
                self.finish(TaskStatus::Failed);
            }
        }

        self.touch();
        Ok(Transition::Applied)
    }

    /// 标记完成并关联结果模型
    ///
    /// 已完成的任务可以重新关联到另一个模型。
    pub fn complete(&mut self, model_id: i64) -> Result<Transition, ReconstructionError> {
        match self.status {
            TaskStatus::Completed if self.result_model_id == Some(model_id) => {
                Ok(Transition::Unchanged)
            }
            TaskStatus::Completed => {
                self.result_model_id = Some(model_id);
                self.touch();
                Ok(Transition::Applied)
            }
            TaskStatus::Failed => Err(ReconstructionError::AlreadyTerminal(self.status)),
            TaskStatus::Pending | TaskStatus::Processing => {
                self.result_model_id = Some(model_id);
                self.finish(TaskStatus::Completed);
                self.touch();
                Ok(Transition::Applied)
            }
        }
    }

    /// 记录某个角色的产物 URL
    pub fn attach_artifact(
        &mut self,
        role: ArtifactRole,
        url: String,
    ) -> Result<Transition, ReconstructionError> {
        if self.artifacts.get(role) == Some(url.as_str()) {
            return Ok(Transition::Unchanged);
        }
        if self.status.is_terminal() {
            return Err(ReconstructionError::AlreadyTerminal(self.status));
        }
        self.artifacts.set(role, url);
        self.touch();
        Ok(Transition::Applied)
    }

    /// 逻辑删除，仅限任务所有者且任务已结束
    pub fn mark_deleted(&mut self, user_id: i64) -> Result<Transition, ReconstructionError> {
        if user_id != self.user_id {
            return Err(ReconstructionError::NotOwner);
        }
        if self.deleted {
            return Ok(Transition::Unchanged);
        }
        if !self.status.is_terminal() {
            return Err(ReconstructionError::StillRunning(self.status));
        }
        self.deleted = true;
        self.touch();
        Ok(Transition::Applied)
    }

    fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        let elapsed = Utc::now().signed_duration_since(self.created_at);
        self.processing_secs = Some(elapsed.num_seconds().max(0));
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    // Getters
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn source_image_id(&self) -> Option<i64> {
        self.source_image_id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result_model_id(&self) -> Option<i64> {
        self.result_model_id
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn processing_secs(&self) -> Option<i64> {
        self.processing_secs
    }

    pub fn artifacts(&self) -> &ArtifactUrls {
        &self.artifacts
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(task: &ReconstructionTask) {
        assert_eq!(
            task.result_model_id().is_some(),
            task.status() == TaskStatus::Completed
        );
        assert_eq!(
            task.error_message().is_some(),
            task.status() == TaskStatus::Failed
        );
    }

    #[test]
    fn test_forward_transitions() {
        let mut task = ReconstructionTask::new(7, Some(3));
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_invariants(&task);

        assert_eq!(
            task.advance(TaskStatus::Processing, None).unwrap(),
            Transition::Applied
        );
        assert_eq!(task.version(), 1);
        assert_invariants(&task);

        assert_eq!(task.complete(42).unwrap(), Transition::Applied);
        assert_eq!(task.result_model_id(), Some(42));
        assert!(task.processing_secs().is_some());
        assert_invariants(&task);
    }

    #[test]
    fn test_reapplying_status_is_noop() {
        let mut task = ReconstructionTask::new(1, None);
        task.advance(TaskStatus::Processing, None).unwrap();
        let version = task.version();

        assert_eq!(
            task.advance(TaskStatus::Processing, None).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(task.version(), version);

        task.advance(TaskStatus::Failed, Some("boom".into())).unwrap();
        assert_eq!(
            task.advance(TaskStatus::Failed, Some("other".into())).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(task.error_message(), Some("boom"));
    }

    #[test]
    fn test_terminal_rejects_transitions() {
        let mut task = ReconstructionTask::new(1, None);
        task.advance(TaskStatus::Failed, None).unwrap();
        assert_eq!(task.error_message(), Some(UNKNOWN_FAILURE));

        assert_eq!(
            task.advance(TaskStatus::Processing, None),
            Err(ReconstructionError::AlreadyTerminal(TaskStatus::Failed))
        );
        assert_eq!(
            task.complete(5),
            Err(ReconstructionError::AlreadyTerminal(TaskStatus::Failed))
        );
        assert_invariants(&task);

        let mut done = ReconstructionTask::new(1, None);
        done.complete(9).unwrap();
        assert!(done.advance(TaskStatus::Failed, Some("late".into())).is_err());
        assert_invariants(&done);
    }

    #[test]
    fn test_backward_and_direct_completion_rejected() {
        let mut task = ReconstructionTask::new(1, None);
        task.advance(TaskStatus::Processing, None).unwrap();
        assert!(matches!(
            task.advance(TaskStatus::Pending, None),
            Err(ReconstructionError::InvalidTransition { .. })
        ));
        assert_eq!(
            task.advance(TaskStatus::Completed, None),
            Err(ReconstructionError::CompletionWithoutModel)
        );
        assert_eq!(task.status(), TaskStatus::Processing);
    }

    #[test]
    fn test_attach_artifact() {
        let mut task = ReconstructionTask::new(1, None);
        let url = "http://localhost/a.png".to_string();
        assert!(task
            .attach_artifact(ArtifactRole::PixelImage, url.clone())
            .unwrap()
            .is_applied());
        assert_eq!(
            task.attach_artifact(ArtifactRole::PixelImage, url).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(
            task.artifacts().get(ArtifactRole::PixelImage),
            Some("http://localhost/a.png")
        );
    }

    #[test]
    fn test_mark_deleted() {
        let mut task = ReconstructionTask::new(1, None);
        assert_eq!(
            task.mark_deleted(1),
            Err(ReconstructionError::StillRunning(TaskStatus::Pending))
        );
        task.advance(TaskStatus::Failed, Some("x".into())).unwrap();
        assert_eq!(task.mark_deleted(2), Err(ReconstructionError::NotOwner));
        assert!(task.mark_deleted(1).unwrap().is_applied());
        assert!(task.is_deleted());
    }
}
