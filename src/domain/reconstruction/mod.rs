//! Reconstruction Context - 3D 重建限界上下文
//!
//! 职责:
//! - 任务状态机（PENDING → PROCESSING → COMPLETED / FAILED）
//! - 结果分片角色划分与完成判定
//! - 推理服务入站通知的统一建模

mod aggregate;
mod errors;
mod notification;
mod value_objects;

pub use aggregate::{ReconstructionTask, TaskParts, Transition};
pub use errors::ReconstructionError;
pub use notification::TaskNotification;
pub use value_objects::{
    is_archive_part, missing_required_parts, ArtifactRole, ArtifactUrls, TaskId, TaskStatus,
    REQUIRED_PARTS,
};
