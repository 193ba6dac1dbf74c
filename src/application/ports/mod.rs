//! Application Ports - 出站端口定义
//!
//! 定义应用层与基础设施层的抽象接口

mod artifact_storage;
mod inference;
mod job_executor;
mod repositories;

pub use artifact_storage::{
    validate_artifact_name, ArtifactStorageError, ArtifactStoragePort, StoredArtifact,
};
pub use inference::{
    ConnectionStatus, InferenceTransport, NotificationSink, SubmissionHandle, SubmissionResult,
    TaskSubmissionPort, TransportError, TransportListener,
};
pub use job_executor::{Admission, Job, JobExecutorPort};
pub use repositories::{
    ModelCatalogPort, ModelDraft, ModelRecord, RepositoryError, TaskListQuery, TaskPage,
    TaskRepositoryPort,
};
