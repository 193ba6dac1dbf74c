//! State Janitor - 过期内存状态回收
//!
//! 周期性回收长时间没有进展的部分结果，对应任务按超时失败。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::assembly::ResultAssembler;

#[derive(Debug, Clone)]
pub struct StateJanitorConfig {
    pub interval: Duration,
    pub state_ttl: Duration,
}

pub struct StateJanitor {
    config: StateJanitorConfig,
    assembler: Arc<ResultAssembler>,
}

impl StateJanitor {
    pub fn new(config: StateJanitorConfig, assembler: Arc<ResultAssembler>) -> Self {
        Self { config, assembler }
    }

    /// 执行一轮回收
    pub async fn sweep(&self) -> usize {
        self.assembler.evict_expired(self.config.state_ttl).await
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.config.interval.as_secs(),
                state_ttl_secs = self.config.state_ttl.as_secs(),
                "State janitor started"
            );

            let mut ticker = tokio::time::interval(self.config.interval);
            // 第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }

            tracing::info!("State janitor stopped");
        })
    }
}
