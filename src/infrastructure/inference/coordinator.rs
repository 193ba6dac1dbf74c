//! TaskSubmissionCoordinator - 提交与结果关联
//!
//! 关联表以任务 ID 为键，每个条目持有:
//! - 完成信号（oneshot，只会被完成一次）
//! - 该任务的通知处理者
//! - 超时计时器
//! - 发送所用连接的 generation
//!
//! 条目在发送之前登记，入站帧不会与登记竞争。终态、超时、取消、
//! 连接丢失四条路径都通过 `remove_if` 摘除条目，谁摘到谁完成。

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::application::error::ApplicationError;
use crate::application::ports::{
    InferenceTransport, NotificationSink, SubmissionHandle, SubmissionResult, TaskSubmissionPort,
    TransportListener,
};
use crate::domain::reconstruction::{TaskId, TaskNotification, TaskStatus};

struct PendingSubmission {
    /// 区分同一任务 ID 的先后两次登记
    seq: u64,
    /// 写出成功后才有值
    generation: Option<u64>,
    sink: Arc<dyn NotificationSink>,
    completion: oneshot::Sender<SubmissionResult>,
    timer: Option<AbortHandle>,
}

pub struct TaskSubmissionCoordinator {
    transport: Arc<dyn InferenceTransport>,
    /// 没有关联条目时的入站通知处理者
    fallback: Arc<dyn NotificationSink>,
    pending: DashMap<String, PendingSubmission>,
    next_seq: AtomicU64,
    /// 已失效的最大 generation，-1 表示还没有连接失效过
    lost_through: AtomicI64,
    timeout: Duration,
    self_ref: Weak<TaskSubmissionCoordinator>,
}

impl TaskSubmissionCoordinator {
    pub fn arc(
        transport: Arc<dyn InferenceTransport>,
        fallback: Arc<dyn NotificationSink>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            transport,
            fallback,
            pending: DashMap::new(),
            next_seq: AtomicU64::new(1),
            lost_through: AtomicI64::new(-1),
            timeout,
            self_ref: self_ref.clone(),
        })
    }

    /// 摘除条目（仅当 seq 匹配）并停止计时器
    fn take(&self, task_id: &str, seq: Option<u64>) -> Option<PendingSubmission> {
        let (_, entry) = self
            .pending
            .remove_if(task_id, |_, entry| seq.map_or(true, |s| entry.seq == s))?;
        if let Some(timer) = &entry.timer {
            timer.abort();
        }
        Some(entry)
    }

    /// 以一条失败通知结束条目：先落库，再完成信号
    async fn fail(&self, task_id: &TaskId, entry: PendingSubmission, error: ApplicationError) {
        let message = error.to_string();
        if let Err(e) = entry
            .sink
            .deliver(task_id, TaskNotification::failed(message))
            .await
        {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to record task failure");
        }
        let _ = entry.completion.send(Err(error));
    }

    async fn expire(&self, task_id: TaskId, seq: u64) {
        let Some(entry) = self.take(task_id.as_str(), Some(seq)) else {
            return;
        };
        tracing::warn!(
            task_id = %task_id,
            timeout_secs = self.timeout.as_secs(),
            "Submission timed out"
        );
        self.fail(&task_id, entry, ApplicationError::SubmissionTimeout(self.timeout))
            .await;
    }

    fn arm_timer(&self, task_id: &TaskId, seq: u64) -> Option<AbortHandle> {
        let this = self.self_ref.upgrade()?;
        let task_id = task_id.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.expire(task_id, seq).await;
        });
        Some(handle.abort_handle())
    }

    /// 写出成功后记录 generation；若该连接已失效则立即失败
    async fn record_generation(&self, task_id: &TaskId, seq: u64, generation: u64) {
        if let Some(mut entry) = self.pending.get_mut(task_id.as_str()) {
            if entry.seq == seq {
                entry.generation = Some(generation);
            }
        }

        if self.lost_through.load(Ordering::SeqCst) >= generation as i64 {
            if let Some(entry) = self.take(task_id.as_str(), Some(seq)) {
                self.fail(
                    task_id,
                    entry,
                    ApplicationError::TransportFailure("Connection lost during send".to_string()),
                )
                .await;
            }
        }
    }
}

#[async_trait]
impl TaskSubmissionPort for TaskSubmissionCoordinator {
    async fn submit(
        &self,
        task_id: &TaskId,
        payload: Vec<u8>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<SubmissionHandle, ApplicationError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (completion, receiver) = oneshot::channel();

        let previous = self.pending.insert(
            task_id.to_string(),
            PendingSubmission {
                seq,
                generation: None,
                sink: sink.clone(),
                completion,
                timer: None,
            },
        );
        if let Some(previous) = previous {
            tracing::warn!(task_id = %task_id, "Replacing an existing submission for the same task");
            if let Some(timer) = previous.timer {
                timer.abort();
            }
            let _ = previous.completion.send(Err(ApplicationError::invalid_state(
                "Superseded by a new submission",
            )));
        }

        let timer = self.arm_timer(task_id, seq);
        if let Some(mut entry) = self.pending.get_mut(task_id.as_str()) {
            if entry.seq == seq {
                entry.timer = timer;
            } else if let Some(timer) = timer {
                timer.abort();
            }
        }

        match self.transport.send_payload(task_id, &payload).await {
            Ok(generation) => {
                tracing::info!(
                    task_id = %task_id,
                    generation,
                    size = payload.len(),
                    "Reconstruction submitted"
                );
                self.record_generation(task_id, seq, generation).await;
                Ok(SubmissionHandle::new(task_id.clone(), receiver))
            }
            Err(e) => {
                let error = ApplicationError::from(e);
                tracing::warn!(task_id = %task_id, error = %error, "Submission send failed");
                if self.take(task_id.as_str(), Some(seq)).is_some() {
                    if let Err(e) = sink
                        .deliver(task_id, TaskNotification::failed(error.to_string()))
                        .await
                    {
                        tracing::warn!(task_id = %task_id, error = %e, "Failed to record task failure");
                    }
                }
                Err(error)
            }
        }
    }

    async fn deliver(
        &self,
        task_id: &TaskId,
        notification: TaskNotification,
    ) -> Result<TaskStatus, ApplicationError> {
        let routed = self
            .pending
            .get(task_id.as_str())
            .map(|entry| (entry.seq, entry.sink.clone()));

        let Some((seq, sink)) = routed else {
            return self.fallback.deliver(task_id, notification).await;
        };

        let outcome = sink.deliver(task_id, notification).await;

        let finished = match &outcome {
            Ok(status) => status.is_terminal(),
            Err(_) => true,
        };
        if finished {
            if let Some(entry) = self.take(task_id.as_str(), Some(seq)) {
                tracing::debug!(task_id = %task_id, "Submission resolved");
                let _ = entry.completion.send(outcome.clone());
            }
        }

        outcome
    }

    async fn cancel(&self, task_id: &TaskId, reason: &str) -> bool {
        let Some(entry) = self.take(task_id.as_str(), None) else {
            return false;
        };

        if entry.generation.is_some() {
            if let Err(e) = self.transport.send_cancel(task_id).await {
                tracing::debug!(task_id = %task_id, error = %e, "Cancel frame not delivered");
            }
        }

        tracing::info!(task_id = %task_id, reason, "Submission cancelled");
        self.fail(task_id, entry, ApplicationError::Cancelled(reason.to_string()))
            .await;
        true
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl TransportListener for TaskSubmissionCoordinator {
    async fn on_frame(&self, task_id: TaskId, notification: TaskNotification) {
        let kind = notification.kind();
        if let Err(e) = self.deliver(&task_id, notification).await {
            tracing::warn!(task_id = %task_id, kind, error = %e, "Inbound notification rejected");
        }
    }

    async fn on_transport_lost(&self, generation: u64, reason: String) {
        self.lost_through
            .fetch_max(generation as i64, Ordering::SeqCst);

        let affected: Vec<(String, u64)> = self
            .pending
            .iter()
            .filter(|entry| entry.generation.is_some_and(|g| g <= generation))
            .map(|entry| (entry.key().clone(), entry.seq))
            .collect();

        if !affected.is_empty() {
            tracing::warn!(
                generation,
                count = affected.len(),
                reason = %reason,
                "Failing in-flight submissions after transport loss"
            );
        }

        for (key, seq) in affected {
            let Some(entry) = self.take(&key, Some(seq)) else {
                continue;
            };
            let Ok(task_id) = TaskId::parse(key) else {
                continue;
            };
            self.fail(
                &task_id,
                entry,
                ApplicationError::TransportFailure(reason.clone()),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{ConnectionStatus, TransportError};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    /// 记录通知并按简单规则返回状态
    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(String, TaskNotification)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(
            &self,
            task_id: &TaskId,
            notification: TaskNotification,
        ) -> Result<TaskStatus, ApplicationError> {
            let status = match &notification {
                TaskNotification::Part { .. } => TaskStatus::Processing,
                TaskNotification::StatusUpdate { status, .. } => *status,
            };
            self.seen
                .lock()
                .unwrap()
                .push((task_id.to_string(), notification));
            Ok(status)
        }
    }

    impl RecordingSink {
        fn failures_for(&self, task: &str) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == task)
                .filter_map(|(_, n)| match n {
                    TaskNotification::StatusUpdate {
                        status: TaskStatus::Failed,
                        error,
                    } => error.clone(),
                    _ => None,
                })
                .collect()
        }
    }

    struct FakeTransport {
        generation: AtomicU64,
        up: AtomicBool,
        cancels: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                generation: AtomicU64::new(1),
                up: AtomicBool::new(true),
                cancels: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl InferenceTransport for FakeTransport {
        async fn ensure_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        async fn send_payload(&self, _: &TaskId, _: &[u8]) -> Result<u64, TransportError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(self.generation.load(Ordering::SeqCst))
            } else {
                Err(TransportError::NotConnected)
            }
        }

        async fn send_cancel(&self, task_id: &TaskId) -> Result<(), TransportError> {
            self.cancels.lock().unwrap().push(task_id.to_string());
            Ok(())
        }

        async fn reset(&self) {}

        fn status(&self) -> ConnectionStatus {
            ConnectionStatus {
                mode: "fake",
                connected: self.up.load(Ordering::SeqCst),
                suspect: false,
                generation: self.generation.load(Ordering::SeqCst),
                last_activity: None,
            }
        }
    }

    fn setup(timeout: Duration) -> (Arc<TaskSubmissionCoordinator>, Arc<FakeTransport>, Arc<RecordingSink>) {
        let transport = FakeTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let coordinator = TaskSubmissionCoordinator::arc(transport.clone(), sink.clone(), timeout);
        (coordinator, transport, sink)
    }

    fn id(raw: &str) -> TaskId {
        TaskId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_terminal_status_resolves_and_releases_entry() {
        let (coordinator, _, sink) = setup(Duration::from_secs(60));
        let handle = coordinator
            .submit(&id("t1"), b"img".to_vec(), sink.clone())
            .await
            .unwrap();
        assert_eq!(coordinator.pending_count(), 1);

        coordinator
            .on_frame(
                id("t1"),
                TaskNotification::StatusUpdate {
                    status: TaskStatus::Processing,
                    error: None,
                },
            )
            .await;
        assert_eq!(coordinator.pending_count(), 1);

        coordinator
            .on_frame(
                id("t1"),
                TaskNotification::StatusUpdate {
                    status: TaskStatus::Completed,
                    error: None,
                },
            )
            .await;
        assert_eq!(handle.wait().await.unwrap(), TaskStatus::Completed);
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_fails_and_deregisters() {
        let (coordinator, transport, sink) = setup(Duration::from_secs(60));
        transport.up.store(false, Ordering::SeqCst);

        let err = coordinator
            .submit(&id("t1"), b"img".to_vec(), sink.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::TransportFailure(_)));
        assert_eq!(coordinator.pending_count(), 0);
        assert_eq!(sink.failures_for("t1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_exactly_once() {
        let (coordinator, _, sink) = setup(Duration::from_secs(300));
        let handle = coordinator
            .submit(&id("t1"), b"img".to_vec(), sink.clone())
            .await
            .unwrap();

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            Err(ApplicationError::SubmissionTimeout(Duration::from_secs(300)))
        );
        assert_eq!(coordinator.pending_count(), 0);

        // 超时后迟到的终态帧走兜底路径，不会再次完成
        coordinator
            .on_frame(
                id("t1"),
                TaskNotification::StatusUpdate {
                    status: TaskStatus::Completed,
                    error: None,
                },
            )
            .await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        let failures = sink.failures_for("t1");
        assert_eq!(failures, vec!["Submission timed out after 300s".to_string()]);
    }

    #[tokio::test]
    async fn test_transport_loss_only_fails_older_generations() {
        let (coordinator, transport, sink) = setup(Duration::from_secs(60));
        let old_a = coordinator
            .submit(&id("a"), b"1".to_vec(), sink.clone())
            .await
            .unwrap();
        let old_b = coordinator
            .submit(&id("b"), b"2".to_vec(), sink.clone())
            .await
            .unwrap();

        transport.generation.store(2, Ordering::SeqCst);
        let fresh = coordinator
            .submit(&id("c"), b"3".to_vec(), sink.clone())
            .await
            .unwrap();

        coordinator
            .on_transport_lost(1, "Connection closed: reset by peer".into())
            .await;

        for handle in [old_a, old_b] {
            let err = handle.wait().await.unwrap_err();
            assert_eq!(
                err,
                ApplicationError::TransportFailure("Connection closed: reset by peer".into())
            );
        }
        assert_eq!(coordinator.pending_count(), 1);
        assert!(sink.failures_for("c").is_empty());

        coordinator
            .on_frame(
                id("c"),
                TaskNotification::StatusUpdate {
                    status: TaskStatus::Completed,
                    error: None,
                },
            )
            .await;
        assert_eq!(fresh.wait().await.unwrap(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_sends_frame_and_fails_once() {
        let (coordinator, transport, sink) = setup(Duration::from_secs(60));
        let handle = coordinator
            .submit(&id("t1"), b"img".to_vec(), sink.clone())
            .await
            .unwrap();

        assert!(coordinator.cancel(&id("t1"), "Requested by client").await);
        assert!(!coordinator.cancel(&id("t1"), "again").await);

        assert_eq!(
            handle.wait().await,
            Err(ApplicationError::Cancelled("Requested by client".into()))
        );
        assert_eq!(transport.cancels.lock().unwrap().as_slice(), ["t1"]);
        assert_eq!(
            sink.failures_for("t1"),
            vec!["Cancelled: Requested by client".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_task_goes_to_fallback() {
        let (coordinator, _, sink) = setup(Duration::from_secs(60));
        let status = coordinator
            .deliver(
                &id("orphan"),
                TaskNotification::StatusUpdate {
                    status: TaskStatus::Processing,
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Processing);
        assert_eq!(sink.seen.lock().unwrap().len(), 1);
    }
}
