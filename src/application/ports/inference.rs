//! Inference Ports - 推理服务通道抽象
//!
//! - InferenceTransport: 到推理服务的单一共享通道（WebSocket 长连接或 HTTP 回调模式）
//! - TransportListener: 通道的入站回调（帧、连接丢失）
//! - NotificationSink: 入站通知的最终处理者（ResultAssembler）
//! - TaskSubmissionPort: "提交并等待结果" 的关联层

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::application::error::ApplicationError;
use crate::domain::reconstruction::{TaskId, TaskNotification, TaskStatus};

/// 通道错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected to inference service")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Service rejected request: {0}")]
    Rejected(String),
}

/// 通道状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub mode: &'static str,
    pub connected: bool,
    /// 探活失败后标记，下一个调用方会重新建连
    pub suspect: bool,
    pub generation: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// 推理服务通道
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    /// 惰性建连，不做主动重试
    async fn ensure_connected(&self) -> bool;

    /// 发送任务负载，返回写入所用连接的 generation
    async fn send_payload(&self, task_id: &TaskId, payload: &[u8]) -> Result<u64, TransportError>;

    /// 尽力通知推理服务放弃某个任务
    async fn send_cancel(&self, task_id: &TaskId) -> Result<(), TransportError>;

    /// 拆除当前连接并让所有在途任务失败
    async fn reset(&self);

    fn status(&self) -> ConnectionStatus;
}

/// 通道入站回调
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// 已按任务 ID 解复用的一条通知
    async fn on_frame(&self, task_id: TaskId, notification: TaskNotification);

    /// generation 及更早的连接已失效
    async fn on_transport_lost(&self, generation: u64, reason: String);
}

/// 通知处理者
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// 应用通知，返回任务应用后的状态
    async fn deliver(
        &self,
        task_id: &TaskId,
        notification: TaskNotification,
    ) -> Result<TaskStatus, ApplicationError>;
}

pub type SubmissionResult = Result<TaskStatus, ApplicationError>;

/// 提交后的等待句柄，恰好被完成一次
#[derive(Debug)]
pub struct SubmissionHandle {
    task_id: TaskId,
    receiver: oneshot::Receiver<SubmissionResult>,
}

impl SubmissionHandle {
    pub fn new(task_id: TaskId, receiver: oneshot::Receiver<SubmissionResult>) -> Self {
        Self { task_id, receiver }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// 等待终态
    pub async fn wait(self) -> SubmissionResult {
        self.receiver.await.unwrap_or_else(|_| {
            Err(ApplicationError::internal(
                "submission dropped without a result",
            ))
        })
    }

    /// 最多等待 `bound`，超时返回 None（任务本身不受影响）
    pub async fn wait_for(self, bound: Duration) -> Option<SubmissionResult> {
        tokio::time::timeout(bound, self.wait()).await.ok()
    }
}

/// 提交协调端口
#[async_trait]
pub trait TaskSubmissionPort: Send + Sync {
    /// 先登记关联项再发送，发送失败立即失败并注销
    async fn submit(
        &self,
        task_id: &TaskId,
        payload: Vec<u8>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<SubmissionHandle, ApplicationError>;

    /// 投递一条入站通知（HTTP 回调入口也走这里）
    async fn deliver(
        &self,
        task_id: &TaskId,
        notification: TaskNotification,
    ) -> Result<TaskStatus, ApplicationError>;

    /// 取消在途任务，不在途时返回 false
    async fn cancel(&self, task_id: &TaskId, reason: &str) -> bool;

    fn pending_count(&self) -> usize;
}
