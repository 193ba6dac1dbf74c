//! Infrastructure Layer - 基础设施层
//!
//! 提供所有端口的具体实现

pub mod adapters;
pub mod assembly;
pub mod events;
pub mod http;
pub mod inference;
pub mod memory;
pub mod persistence;
pub mod worker;

pub use assembly::ResultAssembler;
pub use events::EventBroadcaster;
pub use inference::{ConnectionManager, TaskSubmissionCoordinator};
pub use memory::PartialResultRegistry;
pub use worker::{BoundedWorkerPool, StateJanitor};
