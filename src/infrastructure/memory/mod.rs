//! Memory Layer - In-Memory State Management
//!
//! 每个任务的部分结果集合（易失，进程重启即丢失）

mod partial_results;

pub use partial_results::{PartialResultRegistry, PartialResultSet};
