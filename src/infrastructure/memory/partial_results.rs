//! In-Memory Partial Result Registry
//!
//! 每个任务一份已收到的分片名集合，首个分片到达时惰性创建。
//! 条目带创建 / 最近更新时间，由 janitor 按 TTL 回收。

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::reconstruction::TaskId;

/// 单个任务的部分结果
#[derive(Debug, Clone)]
pub struct PartialResultSet {
    pub received: BTreeSet<String>,
    pub created_at: Instant,
    pub touched_at: Instant,
}

impl PartialResultSet {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            received: BTreeSet::new(),
            created_at: now,
            touched_at: now,
        }
    }
}

/// 部分结果注册表
pub struct PartialResultRegistry {
    entries: DashMap<String, PartialResultSet>,
}

impl PartialResultRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// 记录一个分片，返回记录后的集合
    pub fn record(&self, task_id: &TaskId, name: &str) -> BTreeSet<String> {
        let mut entry = self
            .entries
            .entry(task_id.to_string())
            .or_insert_with(PartialResultSet::new);
        entry.received.insert(name.to_string());
        entry.touched_at = Instant::now();
        entry.received.clone()
    }

    /// 刷新活跃时间（状态帧也算活动），不存在时创建
    pub fn touch(&self, task_id: &TaskId) {
        self.entries
            .entry(task_id.to_string())
            .or_insert_with(PartialResultSet::new)
            .touched_at = Instant::now();
    }

    pub fn received(&self, task_id: &TaskId) -> BTreeSet<String> {
        self.entries
            .get(task_id.as_str())
            .map(|e| e.received.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, task_id: &TaskId) -> bool {
        self.entries.remove(task_id.as_str()).is_some()
    }

    /// 摘除超过 ttl 未更新的条目，返回被摘除的任务
    pub fn evict_idle(&self, ttl: Duration) -> Vec<TaskId> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now.duration_since(e.touched_at) >= ttl)
            .map(|e| e.key().clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|key| {
                self.entries
                    .remove_if(&key, |_, e| now.duration_since(e.touched_at) >= ttl)
                    .and_then(|(key, _)| TaskId::parse(key).ok())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PartialResultRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_accumulates() {
        let registry = PartialResultRegistry::new();
        let task = TaskId::new();
        registry.record(&task, "pixel_images.png");
        let received = registry.record(&task, "xyz_images.png");
        assert_eq!(received.len(), 2);
        assert!(registry.remove(&task));
        assert!(registry.received(&task).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_only_stale_entries() {
        let registry = PartialResultRegistry::new();
        let old = TaskId::new();
        let fresh = TaskId::new();

        registry.record(&old, "pixel_images.png");
        tokio::time::advance(Duration::from_secs(50)).await;
        registry.record(&fresh, "pixel_images.png");
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(registry.evict_idle(Duration::from_secs(60)), vec![old]);
        assert_eq!(registry.len(), 1);
    }
}
