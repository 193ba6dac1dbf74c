//! Inference Adapters - 推理服务的 HTTP 回调通道

mod http_callback_client;

pub use http_callback_client::{HttpCallbackClient, HttpCallbackClientConfig};
