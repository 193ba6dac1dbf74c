//! Query Handlers 实现
//!
//! 所有 QueryHandler 的具体实现

mod reconstruction_handlers;

pub use reconstruction_handlers::*;
