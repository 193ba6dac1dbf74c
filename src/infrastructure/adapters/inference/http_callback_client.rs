//! HTTP Callback Client - 回调模式的推理通道
//!
//! 实现 InferenceTransport trait，通过 HTTP 把图片提交给推理服务，
//! 结果由推理服务回调本服务的 callback 接口送达。
//!
//! 外部 API:
//! POST {http_url}/generate3d  (multipart: task_id, callback_url, image)
//! Response: {"status": "accepted", ...}
//! POST {http_url}/cancel      (JSON: {"task_id": "..."})
//! GET  {http_url}/health

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, Weak};
use std::time::Duration;

use crate::application::ports::{
    ConnectionStatus, InferenceTransport, TransportError, TransportListener,
};
use crate::domain::reconstruction::TaskId;

/// 推理服务的受理响应
#[derive(Debug, Deserialize)]
struct AcceptResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    task_id: &'a str,
}

/// HTTP 回调客户端配置
#[derive(Debug, Clone)]
pub struct HttpCallbackClientConfig {
    /// 推理服务基础 URL
    pub http_url: String,
    /// 本服务对外地址，用于拼接回调 URL
    pub public_base_url: String,
    /// 建连超时
    pub connect_timeout: Duration,
    /// 请求超时
    pub request_timeout: Duration,
}

impl HttpCallbackClientConfig {
    pub fn new(http_url: impl Into<String>, public_base_url: impl Into<String>) -> Self {
        Self {
            http_url: http_url.into().trim_end_matches('/').to_string(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }
}

/// HTTP 回调客户端
///
/// 没有长连接，generation 只在手动 reset 时前进。
pub struct HttpCallbackClient {
    client: Client,
    config: HttpCallbackClientConfig,
    generation: AtomicU64,
    healthy: AtomicBool,
    /// 是否做过健康检查
    contacted: AtomicBool,
    last_activity_ms: AtomicI64,
    listener: OnceLock<Weak<dyn TransportListener>>,
}

impl HttpCallbackClient {
    /// 创建新的 HTTP 回调客户端
    pub fn new(config: HttpCallbackClientConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        Ok(Self {
            client,
            config,
            generation: AtomicU64::new(0),
            healthy: AtomicBool::new(false),
            contacted: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(0),
            listener: OnceLock::new(),
        })
    }

    /// 注册 reset 回调，只能设置一次
    pub fn attach(&self, listener: Weak<dyn TransportListener>) {
        if self.listener.set(listener).is_err() {
            tracing::warn!("Transport listener already attached, ignoring");
        }
    }

    /// 获取提交 URL
    fn submit_url(&self) -> String {
        format!("{}/generate3d", self.config.http_url)
    }

    /// 获取取消 URL
    fn cancel_url(&self) -> String {
        format!("{}/cancel", self.config.http_url)
    }

    /// 获取健康检查 URL
    fn health_url(&self) -> String {
        format!("{}/health", self.config.http_url)
    }

    /// 推理服务回调本服务的地址
    pub fn callback_url(&self) -> String {
        format!("{}/api/reconstruction/callback", self.config.public_base_url)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn map_send_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_connect() {
            TransportError::ConnectFailed(format!("Cannot connect to inference service: {}", e))
        } else if e.is_timeout() {
            TransportError::SendFailed(format!("Request timed out: {}", e))
        } else {
            TransportError::SendFailed(e.to_string())
        }
    }

    /// 检查健康接口
    pub async fn health_check(&self) -> bool {
        let healthy = match self.client.get(self.health_url()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %self.health_url(), error = %e, "Health check failed");
                false
            }
        };
        self.healthy.store(healthy, Ordering::SeqCst);
        self.contacted.store(true, Ordering::SeqCst);
        if healthy {
            self.touch();
        }
        healthy
    }
}

#[async_trait]
impl InferenceTransport for HttpCallbackClient {
    async fn ensure_connected(&self) -> bool {
        let first_use = !self.contacted.load(Ordering::SeqCst);
        if self.health_check().await {
            return true;
        }
        // 推理服务不一定暴露 /health，首次使用时放行，由提交请求本身暴露失败
        if first_use {
            tracing::warn!(url = %self.health_url(), "Health endpoint unreachable, trying anyway");
            return true;
        }
        false
    }

    async fn send_payload(&self, task_id: &TaskId, payload: &[u8]) -> Result<u64, TransportError> {
        let image = Part::bytes(payload.to_vec())
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let form = Form::new()
            .text("task_id", task_id.to_string())
            .text("callback_url", self.callback_url())
            .part("image", image);

        tracing::debug!(
            url = %self.submit_url(),
            task_id = %task_id,
            size = payload.len(),
            "Sending reconstruction request"
        );

        let response = self
            .client
            .post(self.submit_url())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        let body: AcceptResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("Invalid accept response: {}", e)))?;
        if body.status != "accepted" {
            return Err(TransportError::Rejected(
                body.message
                    .unwrap_or_else(|| format!("unexpected status {:?}", body.status)),
            ));
        }

        self.healthy.store(true, Ordering::SeqCst);
        self.touch();
        tracing::info!(task_id = %task_id, "Task accepted by inference service");
        Ok(self.generation.load(Ordering::SeqCst))
    }

    async fn send_cancel(&self, task_id: &TaskId) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.cancel_url())
            .json(&CancelRequest {
                task_id: task_id.as_str(),
            })
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(TransportError::Rejected(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn reset(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        self.healthy.store(false, Ordering::SeqCst);
        self.contacted.store(false, Ordering::SeqCst);
        tracing::info!(generation, "HTTP callback transport reset");

        if let Some(listener) = self.listener.get().and_then(Weak::upgrade) {
            listener
                .on_transport_lost(generation, "Connection reset manually".to_string())
                .await;
        }
    }

    fn status(&self) -> ConnectionStatus {
        let last = self.last_activity_ms.load(Ordering::SeqCst);
        ConnectionStatus {
            mode: "http_callback",
            connected: self.healthy.load(Ordering::SeqCst),
            suspect: false,
            generation: self.generation.load(Ordering::SeqCst),
            last_activity: (last > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last))
                .flatten(),
        }
    }
}
