//! Reconstruction Command Handlers

use std::sync::Arc;
use std::time::Duration;

use crate::application::commands::reconstruction_commands::*;
use crate::application::error::ApplicationError;
use crate::application::ports::{Admission, JobExecutorPort, NotificationSink, TaskSubmissionPort};
use crate::application::task_state::TaskStateStore;
use crate::domain::reconstruction::{ReconstructionTask, TaskNotification, TaskStatus};

const DEFAULT_CANCEL_REASON: &str = "Requested by client";

/// SubmitReconstruction Handler - 创建任务并派发到推理服务
pub struct SubmitReconstructionHandler {
    store: Arc<TaskStateStore>,
    coordinator: Arc<dyn TaskSubmissionPort>,
    sink: Arc<dyn NotificationSink>,
    executor: Arc<dyn JobExecutorPort>,
    sync_wait: Duration,
}

impl SubmitReconstructionHandler {
    pub fn new(
        store: Arc<TaskStateStore>,
        coordinator: Arc<dyn TaskSubmissionPort>,
        sink: Arc<dyn NotificationSink>,
        executor: Arc<dyn JobExecutorPort>,
        sync_wait: Duration,
    ) -> Self {
        Self {
            store,
            coordinator,
            sink,
            executor,
            sync_wait,
        }
    }

    pub async fn handle(
        &self,
        cmd: SubmitReconstruction,
    ) -> Result<SubmitReconstructionResponse, ApplicationError> {
        if cmd.image.is_empty() {
            return Err(ApplicationError::validation("Image body is empty"));
        }

        let task = self.store.create(cmd.user_id, cmd.source_image_id).await?;
        let task_id = task.id().clone();

        if cmd.wait {
            let wait_elapsed = self.submit_and_wait(&task, cmd.image).await;
            let task = self.store.get(&task_id).await?;
            return Ok(SubmitReconstructionResponse { task, wait_elapsed });
        }

        let coordinator = self.coordinator.clone();
        let sink = self.sink.clone();
        let id = task_id.clone();
        let image = cmd.image;
        let admission = self
            .executor
            .execute(Box::pin(async move {
                // 句柄直接丢弃，终态由 sink 落库并推送
                if let Err(e) = coordinator.submit(&id, image, sink).await {
                    tracing::warn!(task_id = %id, error = %e, "Reconstruction dispatch failed");
                }
            }))
            .await;

        tracing::debug!(task_id = %task_id, ?admission, "Reconstruction job admitted");

        let task = match admission {
            Admission::Queued => task,
            Admission::CallerRan => self.store.get(&task_id).await?,
        };

        Ok(SubmitReconstructionResponse {
            task,
            wait_elapsed: false,
        })
    }

    /// 返回等待上限是否先到
    async fn submit_and_wait(&self, task: &ReconstructionTask, image: Vec<u8>) -> bool {
        let handle = match self
            .coordinator
            .submit(task.id(), image, self.sink.clone())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(task_id = %task.id(), error = %e, "Reconstruction dispatch failed");
                return false;
            }
        };

        match handle.wait_for(self.sync_wait).await {
            Some(Ok(status)) => {
                tracing::info!(task_id = %task.id(), %status, "Synchronous reconstruction finished");
                false
            }
            Some(Err(e)) => {
                tracing::warn!(task_id = %task.id(), error = %e, "Synchronous reconstruction failed");
                false
            }
            None => {
                tracing::info!(
                    task_id = %task.id(),
                    wait_secs = self.sync_wait.as_secs(),
                    "Synchronous wait elapsed, task keeps running"
                );
                true
            }
        }
    }
}

/// CancelReconstruction Handler
pub struct CancelReconstructionHandler {
    store: Arc<TaskStateStore>,
    coordinator: Arc<dyn TaskSubmissionPort>,
    sink: Arc<dyn NotificationSink>,
}

impl CancelReconstructionHandler {
    pub fn new(
        store: Arc<TaskStateStore>,
        coordinator: Arc<dyn TaskSubmissionPort>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            coordinator,
            sink,
        }
    }

    pub async fn handle(
        &self,
        cmd: CancelReconstruction,
    ) -> Result<ReconstructionTask, ApplicationError> {
        let task = self.store.get(&cmd.task_id).await?;
        if task.status().is_terminal() {
            return Err(ApplicationError::invalid_state(format!(
                "Task {} is already {}",
                cmd.task_id,
                task.status()
            )));
        }

        let reason = cmd
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

        if !self.coordinator.cancel(&cmd.task_id, &reason).await {
            // 没有关联项（HTTP 回调模式或已超时清理），直接置为失败
            let message = ApplicationError::Cancelled(reason).to_string();
            self.sink
                .deliver(&cmd.task_id, TaskNotification::failed(message))
                .await?;
        }

        tracing::info!(task_id = %cmd.task_id, "Reconstruction cancelled");
        self.store.get(&cmd.task_id).await
    }
}

/// IngestResultPart Handler - HTTP 回调分片入口
pub struct IngestResultPartHandler {
    coordinator: Arc<dyn TaskSubmissionPort>,
}

impl IngestResultPartHandler {
    pub fn new(coordinator: Arc<dyn TaskSubmissionPort>) -> Self {
        Self { coordinator }
    }

    pub async fn handle(&self, cmd: IngestResultPart) -> Result<TaskStatus, ApplicationError> {
        if cmd.bytes.is_empty() {
            return Err(ApplicationError::validation(format!(
                "Result part {} is empty",
                cmd.name
            )));
        }

        tracing::debug!(
            task_id = %cmd.task_id,
            name = %cmd.name,
            size = cmd.bytes.len(),
            "Result part received via callback"
        );

        self.coordinator
            .deliver(
                &cmd.task_id,
                TaskNotification::Part {
                    name: cmd.name,
                    content_type: cmd.content_type,
                    bytes: cmd.bytes,
                },
            )
            .await
    }
}

/// IngestStatusUpdate Handler - HTTP 回调状态入口
pub struct IngestStatusUpdateHandler {
    coordinator: Arc<dyn TaskSubmissionPort>,
}

impl IngestStatusUpdateHandler {
    pub fn new(coordinator: Arc<dyn TaskSubmissionPort>) -> Self {
        Self { coordinator }
    }

    pub async fn handle(&self, cmd: IngestStatusUpdate) -> Result<TaskStatus, ApplicationError> {
        let notification = TaskNotification::from_wire_status(&cmd.status, cmd.error);
        self.coordinator.deliver(&cmd.task_id, notification).await
    }
}

/// DeleteReconstruction Handler
pub struct DeleteReconstructionHandler {
    store: Arc<TaskStateStore>,
}

impl DeleteReconstructionHandler {
    pub fn new(store: Arc<TaskStateStore>) -> Self {
        Self { store }
    }

    pub async fn handle(&self, cmd: DeleteReconstruction) -> Result<(), ApplicationError> {
        self.store.delete(&cmd.task_id, cmd.user_id).await?;
        tracing::info!(task_id = %cmd.task_id, user_id = cmd.user_id, "Reconstruction deleted");
        Ok(())
    }
}
