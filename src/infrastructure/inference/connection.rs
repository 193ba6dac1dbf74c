//! ConnectionManager - 到推理服务的单一共享 WebSocket
//!
//! - 惰性建连：第一个需要发送的调用方触发连接，失败不主动重试
//! - 每条连接一个 generation，读循环按任务 ID 解复用入站帧
//! - 连接关闭或出错时拆除连接并通知 listener，由其清理全部在途关联
//! - 探活：空闲超过阈值时发送 Ping，失败只标记 suspect，下一个调用方重新建连

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::protocol::{decode_binary, encode_binary, ControlFrame};
use crate::application::ports::{
    ConnectionStatus, InferenceTransport, TransportError, TransportListener,
};
use crate::domain::reconstruction::{TaskId, TaskNotification};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// 单次写探活帧 / 关闭帧的上限
const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// ConnectionManager 配置
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub idle_threshold: Duration,
}

struct LiveConnection {
    generation: u64,
    sink: Arc<Mutex<WsSink>>,
    reader_cancel: CancellationToken,
}

/// 等待二进制帧的分片头
struct PartHeader {
    name: String,
    content_type: String,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    live: Mutex<Option<LiveConnection>>,
    generation: AtomicU64,
    connected: AtomicBool,
    suspect: AtomicBool,
    /// 最近一次收发的毫秒时间戳，0 表示从未活动
    last_activity_ms: AtomicI64,
    listener: OnceLock<Weak<dyn TransportListener>>,
    self_ref: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn arc(settings: ConnectionSettings) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            settings,
            live: Mutex::new(None),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            suspect: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(0),
            listener: OnceLock::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// 注册入站回调，只能设置一次
    pub fn attach(&self, listener: Weak<dyn TransportListener>) {
        if self.listener.set(listener).is_err() {
            tracing::warn!("Transport listener already attached, ignoring");
        }
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.get().and_then(Weak::upgrade)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::SeqCst);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last).max(0);
        Duration::from_millis(elapsed as u64)
    }

    /// 写一帧，失败即拆除该连接
    async fn write(&self, message: Message) -> Result<u64, TransportError> {
        let (generation, sink) = {
            let live = self.live.lock().await;
            match live.as_ref() {
                Some(conn) => (conn.generation, conn.sink.clone()),
                None => return Err(TransportError::NotConnected),
            }
        };

        let result = sink.lock().await.send(message).await;
        match result {
            Ok(()) => {
                self.touch();
                Ok(generation)
            }
            Err(e) => {
                self.teardown(generation, format!("Send failed: {}", e))
                    .await;
                Err(TransportError::SendFailed(e.to_string()))
            }
        }
    }

    /// 拆除指定 generation 的连接；连接已被替换或拆除时什么都不做
    async fn teardown(&self, generation: u64, reason: String) {
        let retired = {
            let mut live = self.live.lock().await;
            match live.as_ref() {
                Some(conn) if conn.generation == generation => live.take(),
                _ => None,
            }
        };
        let Some(conn) = retired else {
            return;
        };

        self.connected.store(false, Ordering::SeqCst);
        self.suspect.store(false, Ordering::SeqCst);
        conn.reader_cancel.cancel();

        let close = async { conn.sink.lock().await.close().await };
        if let Ok(Err(e)) = tokio::time::timeout(CONTROL_WRITE_TIMEOUT, close).await {
            tracing::debug!(generation, error = %e, "Close frame not delivered");
        }

        tracing::warn!(generation, reason = %reason, "Inference connection torn down");

        if let Some(listener) = self.listener() {
            listener.on_transport_lost(generation, reason).await;
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut stream: SplitStream<WsStream>,
        cancel: CancellationToken,
    ) {
        let mut headers: HashMap<String, PartHeader> = HashMap::new();

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.touch();
                        self.handle_text(generation, &text, &mut headers).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.touch();
                        self.handle_binary(generation, &data, &mut headers).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => self.touch(),
                    Some(Ok(Message::Close(frame))) => {
                        let detail = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "no close frame".to_string());
                        break format!("Connection closed: {}", detail);
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break format!("Connection error: {}", e),
                    None => break "Connection closed: stream ended".to_string(),
                }
            }
        };

        self.teardown(generation, reason).await;
    }

    async fn handle_text(
        &self,
        generation: u64,
        text: &str,
        headers: &mut HashMap<String, PartHeader>,
    ) {
        let frame = match ControlFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(generation, error = %e, "Dropping inbound text frame");
                return;
            }
        };

        let task_id = match TaskId::parse(frame.task_id()) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(generation, error = %e, "Dropping frame with invalid task id");
                return;
            }
        };

        match frame {
            ControlFrame::Status { status, error, .. } => {
                tracing::debug!(task_id = %task_id, %status, "Status frame received");
                self.dispatch(task_id, TaskNotification::from_wire_status(&status, error))
                    .await;
            }
            ControlFrame::ResultPart {
                name, content_type, ..
            } => {
                let replaced = headers.insert(
                    task_id.to_string(),
                    PartHeader { name, content_type },
                );
                if let Some(previous) = replaced {
                    tracing::warn!(
                        task_id = %task_id,
                        dropped = %previous.name,
                        "Result part header replaced before its body arrived"
                    );
                }
            }
            ControlFrame::Cancel { .. } => {
                tracing::debug!(task_id = %task_id, "Ignoring inbound cancel frame");
            }
        }
    }

    async fn handle_binary(
        &self,
        generation: u64,
        data: &[u8],
        headers: &mut HashMap<String, PartHeader>,
    ) {
        let (task_id, body) = match decode_binary(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(generation, error = %e, "Dropping inbound binary frame");
                return;
            }
        };

        let Some(header) = headers.remove(task_id.as_str()) else {
            tracing::warn!(
                task_id = %task_id,
                size = body.len(),
                "Binary frame without result part header, dropped"
            );
            return;
        };

        tracing::debug!(
            task_id = %task_id,
            name = %header.name,
            size = body.len(),
            "Result part received"
        );

        self.dispatch(
            task_id,
            TaskNotification::Part {
                name: header.name,
                content_type: header.content_type,
                bytes: body.to_vec(),
            },
        )
        .await;
    }

    async fn dispatch(&self, task_id: TaskId, notification: TaskNotification) {
        match self.listener() {
            Some(listener) => listener.on_frame(task_id, notification).await,
            None => {
                tracing::warn!(task_id = %task_id, "No transport listener attached, frame dropped")
            }
        }
    }

    /// 空闲超过阈值时发送 Ping；写失败只标记 suspect
    async fn send_ping(&self) {
        if self.idle_for() < self.settings.idle_threshold {
            return;
        }

        let target = {
            let live = self.live.lock().await;
            live.as_ref().map(|c| (c.generation, c.sink.clone()))
        };
        let Some((generation, sink)) = target else {
            return;
        };

        let ping = async { sink.lock().await.send(Message::Ping(Vec::new())).await };
        match tokio::time::timeout(CONTROL_WRITE_TIMEOUT, ping).await {
            Ok(Ok(())) => tracing::debug!(generation, "Liveness ping sent"),
            Ok(Err(e)) => {
                tracing::warn!(generation, error = %e, "Liveness ping failed, connection marked suspect");
                self.suspect.store(true, Ordering::SeqCst);
            }
            Err(_) => {
                tracing::warn!(generation, "Liveness ping timed out, connection marked suspect");
                self.suspect.store(true, Ordering::SeqCst);
            }
        }
    }

    /// 启动探活任务
    pub fn spawn_liveness_check(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => this.send_ping().await,
                }
            }
            tracing::debug!("Liveness ping stopped");
        })
    }

    /// 关闭当前连接（进程退出时）
    pub async fn shutdown(&self) {
        let generation = self.live.lock().await.as_ref().map(|c| c.generation);
        if let Some(generation) = generation {
            self.teardown(generation, "Service shutting down".to_string())
                .await;
        }
    }
}

#[async_trait]
impl InferenceTransport for ConnectionManager {
    async fn ensure_connected(&self) -> bool {
        if self.suspect.load(Ordering::SeqCst) {
            let stale = self.live.lock().await.as_ref().map(|c| c.generation);
            if let Some(generation) = stale {
                self.teardown(generation, "Liveness ping failed".to_string())
                    .await;
            }
        }

        // 持锁建连，并发调用方共享同一次尝试
        let mut live = self.live.lock().await;
        if live.is_some() {
            return true;
        }

        let Some(this) = self.self_ref.upgrade() else {
            return false;
        };

        let attempt = tokio::time::timeout(
            self.settings.connect_timeout,
            connect_async(self.settings.url.as_str()),
        )
        .await;

        match attempt {
            Ok(Ok((stream, _response))) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let (sink, stream) = stream.split();
                let reader_cancel = CancellationToken::new();

                *live = Some(LiveConnection {
                    generation,
                    sink: Arc::new(Mutex::new(sink)),
                    reader_cancel: reader_cancel.clone(),
                });
                self.connected.store(true, Ordering::SeqCst);
                self.suspect.store(false, Ordering::SeqCst);
                self.touch();

                tokio::spawn(this.read_loop(generation, stream, reader_cancel));

                tracing::info!(url = %self.settings.url, generation, "Connected to inference service");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(url = %self.settings.url, error = %e, "Failed to connect to inference service");
                false
            }
            Err(_) => {
                tracing::warn!(
                    url = %self.settings.url,
                    timeout_secs = self.settings.connect_timeout.as_secs(),
                    "Timed out connecting to inference service"
                );
                false
            }
        }
    }

    async fn send_payload(&self, task_id: &TaskId, payload: &[u8]) -> Result<u64, TransportError> {
        if !self.ensure_connected().await {
            return Err(TransportError::NotConnected);
        }
        let generation = self
            .write(Message::Binary(encode_binary(task_id, payload)))
            .await?;
        tracing::debug!(task_id = %task_id, generation, size = payload.len(), "Payload sent");
        Ok(generation)
    }

    async fn send_cancel(&self, task_id: &TaskId) -> Result<(), TransportError> {
        let frame = ControlFrame::cancel(task_id).to_json()?;
        self.write(Message::Text(frame)).await.map(|_| ())
    }

    async fn reset(&self) {
        let generation = self.live.lock().await.as_ref().map(|c| c.generation);
        let reason = "Connection reset manually".to_string();
        match generation {
            Some(generation) => self.teardown(generation, reason).await,
            None => {
                // 没有活动连接，仍然清掉残留的关联项
                if let Some(listener) = self.listener() {
                    let current = self.generation.load(Ordering::SeqCst);
                    listener.on_transport_lost(current, reason).await;
                }
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        let last = self.last_activity_ms.load(Ordering::SeqCst);
        ConnectionStatus {
            mode: "websocket",
            connected: self.connected.load(Ordering::SeqCst),
            suspect: self.suspect.load(Ordering::SeqCst),
            generation: self.generation.load(Ordering::SeqCst),
            last_activity: (last > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last))
                .flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;

    #[derive(Debug)]
    enum Seen {
        Frame(TaskId, TaskNotification),
        Lost(u64, String),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Seen>,
    }

    #[async_trait]
    impl TransportListener for Recorder {
        async fn on_frame(&self, task_id: TaskId, notification: TaskNotification) {
            let _ = self.tx.send(Seen::Frame(task_id, notification));
        }

        async fn on_transport_lost(&self, generation: u64, reason: String) {
            let _ = self.tx.send(Seen::Lost(generation, reason));
        }
    }

    fn settings(url: String) -> ConnectionSettings {
        ConnectionSettings {
            url,
            connect_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(120),
            idle_threshold: Duration::from_secs(180),
        }
    }

    fn attach_recorder(manager: &ConnectionManager) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder { tx });
        let listener: Arc<dyn TransportListener> = recorder.clone();
        manager.attach(Arc::downgrade(&listener));
        (recorder, rx)
    }

    fn part_header(task: &str, name: &str) -> Message {
        Message::Text(format!(
            r#"{{"type":"result_part","task_id":"{}","name":"{}","content_type":"image/png"}}"#,
            task, name
        ))
    }

    fn tagged(task: &str, body: &[u8]) -> Message {
        Message::Binary(encode_binary(&TaskId::parse(task).unwrap(), body))
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = ConnectionManager::arc(settings(format!("ws://{}", addr)));
        assert!(!manager.ensure_connected().await);
        assert_eq!(
            manager
                .send_payload(&TaskId::new(), b"img")
                .await
                .unwrap_err(),
            TransportError::NotConnected
        );
        assert!(!manager.status().connected);
    }

    #[tokio::test]
    async fn test_interleaved_parts_route_by_task_id() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = server.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            // 等待客户端负载
            let first = ws.next().await.unwrap().unwrap();
            let payload = first.into_data();
            let (task, body) = decode_binary(&payload).unwrap();
            assert_eq!(task.as_str(), "t1");
            assert_eq!(body, b"image");

            // 两个任务的分片头交错
            ws.send(part_header("t1", "pixel_images.png")).await.unwrap();
            ws.send(part_header("t2", "xyz_images.png")).await.unwrap();
            ws.send(tagged("t2", b"xyz")).await.unwrap();
            ws.send(tagged("t1", b"pixel")).await.unwrap();
            ws.send(tagged("t3", b"orphan")).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"status","task_id":"t1","status":"weird"}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let manager = ConnectionManager::arc(settings(format!("ws://{}", addr)));
        let (_recorder, mut rx) = attach_recorder(&manager);

        let generation = manager
            .send_payload(&TaskId::parse("t1").unwrap(), b"image")
            .await
            .unwrap();
        assert_eq!(generation, 1);

        match rx.recv().await.unwrap() {
            Seen::Frame(id, TaskNotification::Part { name, bytes, .. }) => {
                assert_eq!(id.as_str(), "t2");
                assert_eq!(name, "xyz_images.png");
                assert_eq!(bytes, b"xyz");
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Seen::Frame(id, TaskNotification::Part { name, bytes, .. }) => {
                assert_eq!(id.as_str(), "t1");
                assert_eq!(name, "pixel_images.png");
                assert_eq!(bytes, b"pixel");
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Seen::Frame(id, notification) => {
                assert_eq!(id.as_str(), "t1");
                assert_eq!(
                    notification,
                    TaskNotification::failed("Unknown task status: weird")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Seen::Lost(generation, reason) => {
                assert_eq!(generation, 1);
                assert!(reason.starts_with("Connection closed"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!manager.status().connected);
    }

    #[tokio::test]
    async fn test_reset_bumps_generation_on_reconnect() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = server.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    if let Ok(mut ws) = accept_async(tcp).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });

        let manager = ConnectionManager::arc(settings(format!("ws://{}", addr)));
        let (_recorder, mut rx) = attach_recorder(&manager);

        assert!(manager.ensure_connected().await);
        assert_eq!(manager.status().generation, 1);

        manager.reset().await;
        match rx.recv().await.unwrap() {
            Seen::Lost(generation, reason) => {
                assert_eq!(generation, 1);
                assert_eq!(reason, "Connection reset manually");
            }
            other => panic!("unexpected {:?}", other),
        }

        let generation = manager
            .send_payload(&TaskId::parse("t2").unwrap(), b"img")
            .await
            .unwrap();
        assert_eq!(generation, 2);
        assert!(manager.status().connected);
    }
}
