//! Command Handlers 实现
//!
//! 所有 CommandHandler 的具体实现

mod reconstruction_handlers;

pub use reconstruction_handlers::*;
