//! Event Broadcaster - 按任务推送进度事件
//!
//! 每个任务最多一个活动通道，新订阅会先顶掉旧订阅。通道状态只有
//! OPEN → CLOSED：显式关闭、推送失败、空闲超时都会进入 CLOSED。
//! 心跳由一个共享的 ticker 统一发送，不为每个订阅者单独起任务。

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::reconstruction::{TaskId, TaskStatus};

/// 推送事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    /// 通道建立确认
    Connect {},
    /// 任务状态
    #[serde(rename_all = "camelCase")]
    Status {
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 一个产物可用
    #[serde(rename_all = "camelCase")]
    Result {
        task_id: String,
        name: String,
        url: String,
    },
    /// 保活
    Heartbeat { timestamp: i64 },
    /// 通道即将关闭
    Close { reason: String },
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::Connect {} => "connect",
            PushEvent::Status { .. } => "status",
            PushEvent::Result { .. } => "result",
            PushEvent::Heartbeat { .. } => "heartbeat",
            PushEvent::Close { .. } => "close",
        }
    }

    /// `data` 部分的 JSON
    pub fn data_json(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut value| value.get_mut("data").map(serde_json::Value::take))
            .unwrap_or_else(|| serde_json::json!({}))
            .to_string()
    }

    pub fn is_close(&self) -> bool {
        matches!(self, PushEvent::Close { .. })
    }
}

/// 一次订阅
#[derive(Debug)]
pub struct EventSubscription {
    pub channel_id: u64,
    pub receiver: mpsc::Receiver<PushEvent>,
}

struct ChannelSlot {
    channel_id: u64,
    sender: mpsc::Sender<PushEvent>,
    /// 最近一次应用事件（心跳不计）
    last_event_at: Instant,
}

/// 推送通道配置
#[derive(Debug, Clone)]
pub struct BroadcasterSettings {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub channel_capacity: usize,
}

/// 事件广播器
pub struct EventBroadcaster {
    channels: DashMap<String, ChannelSlot>,
    next_channel_id: AtomicU64,
    settings: BroadcasterSettings,
}

impl EventBroadcaster {
    pub fn new(settings: BroadcasterSettings) -> Self {
        Self {
            channels: DashMap::new(),
            next_channel_id: AtomicU64::new(1),
            settings,
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// 打开任务的推送通道，首个事件为 connect；旧通道收到 close 后结束
    pub fn open(&self, task_id: &TaskId) -> EventSubscription {
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(self.settings.channel_capacity.max(2));
        // 新通道必有空位
        let _ = sender.try_send(PushEvent::Connect {});

        let previous = self.channels.insert(
            task_id.to_string(),
            ChannelSlot {
                channel_id,
                sender,
                last_event_at: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(
                task_id = %task_id,
                channel_id = previous.channel_id,
                "Retiring previous event channel"
            );
            let _ = previous.sender.try_send(PushEvent::Close {
                reason: "superseded".to_string(),
            });
        }

        tracing::debug!(task_id = %task_id, channel_id, "Event channel opened");
        EventSubscription {
            channel_id,
            receiver,
        }
    }

    /// 推送事件；没有活动订阅者时返回 false（正常情况）
    pub fn publish(&self, task_id: &TaskId, event: PushEvent) -> bool {
        let failed_channel = {
            let Some(mut slot) = self.channels.get_mut(task_id.as_str()) else {
                return false;
            };
            match slot.sender.try_send(event) {
                Ok(()) => {
                    slot.last_event_at = Instant::now();
                    return true;
                }
                Err(e) => {
                    tracing::debug!(task_id = %task_id, error = %e, "Event push failed, closing channel");
                    slot.channel_id
                }
            }
        };

        self.retire(task_id.as_str(), failed_channel, None);
        false
    }

    pub fn publish_status(&self, task_id: &TaskId, status: TaskStatus, error: Option<&str>) -> bool {
        self.publish(
            task_id,
            PushEvent::Status {
                task_id: task_id.to_string(),
                status,
                error: error.map(str::to_string),
            },
        )
    }

    pub fn publish_result(&self, task_id: &TaskId, name: &str, url: &str) -> bool {
        self.publish(
            task_id,
            PushEvent::Result {
                task_id: task_id.to_string(),
                name: name.to_string(),
                url: url.to_string(),
            },
        )
    }

    /// 关闭任务的通道
    pub fn close(&self, task_id: &TaskId, reason: &str) {
        if let Some((_, slot)) = self.channels.remove(task_id.as_str()) {
            let _ = slot.sender.try_send(PushEvent::Close {
                reason: reason.to_string(),
            });
            tracing::debug!(task_id = %task_id, channel_id = slot.channel_id, reason, "Event channel closed");
        }
    }

    /// 仅当 channel_id 仍是当前通道时才关闭
    pub fn close_channel(&self, task_id: &TaskId, channel_id: u64) {
        self.retire(task_id.as_str(), channel_id, None);
    }

    /// 关闭全部通道（进程退出时）
    pub fn close_all(&self, reason: &str) {
        let keys: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, slot)) = self.channels.remove(&key) {
                let _ = slot.sender.try_send(PushEvent::Close {
                    reason: reason.to_string(),
                });
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_subscribed(&self, task_id: &TaskId) -> bool {
        self.channels.contains_key(task_id.as_str())
    }

    fn retire(&self, key: &str, channel_id: u64, reason: Option<&str>) {
        let removed = self
            .channels
            .remove_if(key, |_, slot| slot.channel_id == channel_id);
        if let (Some((_, slot)), Some(reason)) = (removed, reason) {
            let _ = slot.sender.try_send(PushEvent::Close {
                reason: reason.to_string(),
            });
        }
    }

    /// 一次心跳：超时的通道关闭，其余发送 heartbeat，发送失败的通道拆除
    fn beat(&self) {
        let now = Instant::now();
        let timestamp = Utc::now().timestamp_millis();
        let mut expired = Vec::new();
        let mut broken = Vec::new();

        for slot in self.channels.iter() {
            if now.duration_since(slot.last_event_at) >= self.settings.idle_timeout {
                expired.push((slot.key().clone(), slot.channel_id));
            } else if slot
                .sender
                .try_send(PushEvent::Heartbeat { timestamp })
                .is_err()
            {
                broken.push((slot.key().clone(), slot.channel_id));
            }
        }

        for (key, channel_id) in expired {
            tracing::debug!(task_id = %key, channel_id, "Event channel idle timeout");
            self.retire(&key, channel_id, Some("idle timeout"));
        }
        for (key, channel_id) in broken {
            tracing::debug!(task_id = %key, channel_id, "Heartbeat failed, closing channel");
            self.retire(&key, channel_id, None);
        }
    }

    /// 启动共享心跳任务
    pub fn spawn_heartbeat(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => this.beat(),
                }
            }
            this.close_all("server shutdown");
            tracing::debug!("Event heartbeat stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcaster(capacity: usize) -> Arc<EventBroadcaster> {
        EventBroadcaster::new(BroadcasterSettings {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1800),
            channel_capacity: capacity,
        })
        .arc()
    }

    fn id(raw: &str) -> TaskId {
        TaskId::parse(raw).unwrap()
    }

    #[test]
    fn test_event_json_shapes() {
        let status = PushEvent::Status {
            task_id: "t1".into(),
            status: TaskStatus::Failed,
            error: Some("boom".into()),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({
                "event": "status",
                "data": {"taskId": "t1", "status": "FAILED", "error": "boom"}
            })
        );
        let data: serde_json::Value = serde_json::from_str(&status.data_json()).unwrap();
        assert_eq!(data["taskId"], "t1");
        assert_eq!(PushEvent::Connect {}.data_json(), "{}");
        assert_eq!(
            serde_json::to_value(PushEvent::Connect {}).unwrap(),
            serde_json::json!({"event": "connect", "data": {}})
        );
        assert_eq!(PushEvent::Heartbeat { timestamp: 1 }.name(), "heartbeat");
    }

    #[tokio::test]
    async fn test_open_acknowledges_and_supersedes() {
        let events = broadcaster(8);
        let mut first = events.open(&id("t1"));
        assert_eq!(first.receiver.recv().await, Some(PushEvent::Connect {}));

        let mut second = events.open(&id("t1"));
        assert_eq!(
            first.receiver.recv().await,
            Some(PushEvent::Close {
                reason: "superseded".into()
            })
        );
        assert_eq!(first.receiver.recv().await, None);
        assert_eq!(second.receiver.recv().await, Some(PushEvent::Connect {}));
        assert_eq!(events.subscriber_count(), 1);

        assert!(events.publish_result(&id("t1"), "pixel_images.png", "http://x/p.png"));
        assert!(matches!(
            second.receiver.recv().await,
            Some(PushEvent::Result { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_not_an_error() {
        let events = broadcaster(8);
        assert!(!events.publish_status(&id("nobody"), TaskStatus::Processing, None));
    }

    #[tokio::test]
    async fn test_publish_failure_tears_channel_down() {
        let events = broadcaster(8);
        let subscription = events.open(&id("t1"));
        drop(subscription);

        assert!(!events.publish_status(&id("t1"), TaskStatus::Processing, None));
        assert!(!events.is_subscribed(&id("t1")));
    }

    #[tokio::test]
    async fn test_stale_close_does_not_touch_new_channel() {
        let events = broadcaster(8);
        let old = events.open(&id("t1"));
        let _new = events.open(&id("t1"));
        events.close_channel(&id("t1"), old.channel_id);
        assert!(events.is_subscribed(&id("t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_heartbeat_and_idle_timeout() {
        let events = EventBroadcaster::new(BroadcasterSettings {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            channel_capacity: 16,
        })
        .arc();
        let shutdown = CancellationToken::new();
        let ticker = events.spawn_heartbeat(shutdown.clone());

        let mut a = events.open(&id("a"));
        let mut b = events.open(&id("b"));
        assert_eq!(a.receiver.recv().await, Some(PushEvent::Connect {}));
        assert_eq!(b.receiver.recv().await, Some(PushEvent::Connect {}));

        assert!(matches!(
            a.receiver.recv().await,
            Some(PushEvent::Heartbeat { .. })
        ));
        assert!(matches!(
            b.receiver.recv().await,
            Some(PushEvent::Heartbeat { .. })
        ));

        // 没有应用事件，90 秒后关闭
        let mut tail = Vec::new();
        while let Some(event) = a.receiver.recv().await {
            tail.push(event);
        }
        assert_eq!(
            tail.last(),
            Some(&PushEvent::Close {
                reason: "idle timeout".into()
            })
        );
        assert!(!events.is_subscribed(&id("a")));

        shutdown.cancel();
        ticker.await.unwrap();
        assert_eq!(events.subscriber_count(), 0);
    }
}
