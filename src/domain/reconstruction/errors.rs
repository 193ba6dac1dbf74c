//! Reconstruction Context - Errors

use thiserror::Error;

use super::TaskStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconstructionError {
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task already finished with status {0}")]
    AlreadyTerminal(TaskStatus),

    #[error("Completion requires a result model")]
    CompletionWithoutModel,

    #[error("Invalid task id: {0:?}")]
    InvalidTaskId(String),

    #[error("Invalid part name: {0}")]
    InvalidPartName(String),

    #[error("Task is still running with status {0}")]
    StillRunning(TaskStatus),

    #[error("Task is owned by another user")]
    NotOwner,
}
