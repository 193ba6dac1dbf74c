//! Persistence Layer - 数据持久化
//!
//! SQLite 存储实现（任务状态、结果模型）

pub mod sqlite;
