//! Adapters - 外部服务适配器
//!
//! 包含产物文件存储、推理服务 HTTP 回调客户端

pub mod inference;
pub mod storage;

pub use inference::{HttpCallbackClient, HttpCallbackClientConfig};
pub use storage::FileArtifactStorage;
