//! Bounded Worker Pool - 有界工作池
//!
//! 提交方把 Job 放入有界队列，后台 runner 在 Semaphore 限制下并发执行。
//! 队列满时由调用方就地执行（caller-runs），既不丢弃也不无限阻塞。

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Admission, Job, JobExecutorPort};

/// 工作池配置
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// 最大并发数
    pub max_concurrent: usize,
    /// 队列容量
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_capacity: 50,
        }
    }
}

/// 工作池提交端
pub struct BoundedWorkerPool {
    sender: mpsc::Sender<Job>,
}

/// 工作池执行端
pub struct WorkerPoolRunner {
    config: WorkerPoolConfig,
    receiver: mpsc::Receiver<Job>,
}

impl BoundedWorkerPool {
    pub fn new(config: WorkerPoolConfig) -> (Self, WorkerPoolRunner) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        (Self { sender }, WorkerPoolRunner { config, receiver })
    }

    /// 当前队列中等待的 Job 数
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

#[async_trait]
impl JobExecutorPort for BoundedWorkerPool {
    async fn execute(&self, job: Job) -> Admission {
        match self.sender.try_send(job) {
            Ok(()) => Admission::Queued,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!("Worker queue full, running job on caller");
                job.await;
                Admission::CallerRan
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::warn!("Worker pool stopped, running job on caller");
                job.await;
                Admission::CallerRan
            }
        }
    }
}

impl WorkerPoolRunner {
    /// 启动执行循环，shutdown 后不再取新 Job
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            queue_capacity = self.config.queue_capacity,
            "Worker pool started"
        );

        // 使用 semaphore 控制并发
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = self.receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::error!("Failed to acquire semaphore permit");
                    break;
                }
            };

            tokio::spawn(async move {
                let _permit = permit; // 持有 permit 直到任务完成
                job.await;
            });
        }

        tracing::info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_full_queue_runs_on_caller() {
        let (pool, runner) = BoundedWorkerPool::new(WorkerPoolConfig {
            max_concurrent: 1,
            queue_capacity: 1,
        });
        let ran = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = oneshot::channel();
        let queued = pool
            .execute(Box::pin(async move {
                let _ = tx.send(());
            }))
            .await;
        assert_eq!(queued, Admission::Queued);
        assert_eq!(pool.queued(), 1);

        let counter = ran.clone();
        let inline = pool
            .execute(Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        assert_eq!(inline, Admission::CallerRan);
        // caller-runs 在返回前已执行完
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runner.run(shutdown.clone()));
        rx.await.unwrap();

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (pool, runner) = BoundedWorkerPool::new(WorkerPoolConfig {
            max_concurrent: 2,
            queue_capacity: 16,
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(runner.run(shutdown.clone()));

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::channel(8);

        for _ in 0..6 {
            let active = active.clone();
            let peak = peak.clone();
            let done_tx = done_tx.clone();
            let admission = pool
                .execute(Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    let _ = done_tx.send(()).await;
                }))
                .await;
            assert_eq!(admission, Admission::Queued);
        }

        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        shutdown.cancel();
    }
}
