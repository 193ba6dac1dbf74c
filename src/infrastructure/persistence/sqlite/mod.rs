//! SQLite Persistence - SQLite 数据库持久化实现

mod database;
mod model_repo;
mod task_repo;

pub use database::*;
pub use model_repo::*;
pub use task_repo::*;
