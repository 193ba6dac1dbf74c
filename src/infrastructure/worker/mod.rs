//! Worker Layer - 后台任务
//!
//! 有界工作池（caller-runs 准入）与过期状态回收

mod state_janitor;
mod worker_pool;

pub use state_janitor::{StateJanitor, StateJanitorConfig};
pub use worker_pool::{BoundedWorkerPool, WorkerPoolConfig, WorkerPoolRunner};
