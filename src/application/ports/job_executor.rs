//! Job Executor Port - 有界工作池

use async_trait::async_trait;
use futures_util::future::BoxFuture;

/// 任务提交到工作池的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 进入队列，由工作池执行
    Queued,
    /// 队列已满，调用方同步执行（caller-runs）
    CallerRan,
}

pub type Job = BoxFuture<'static, ()>;

#[async_trait]
pub trait JobExecutorPort: Send + Sync {
    async fn execute(&self, job: Job) -> Admission;
}
