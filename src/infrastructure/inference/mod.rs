//! Inference Layer - 推理服务通道
//!
//! - protocol: 帧格式（任务 ID 显式标记）
//! - connection: 单一共享 WebSocket 连接
//! - coordinator: 提交 / 结果关联表

mod connection;
mod coordinator;
pub mod protocol;

pub use connection::{ConnectionManager, ConnectionSettings};
pub use coordinator::TaskSubmissionCoordinator;
