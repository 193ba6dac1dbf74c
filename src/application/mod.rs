//! 应用层 - 用例编排
//!
//! 包含：
//! - ports: 六边形架构端口定义（Repository、ArtifactStorage、InferenceTransport、JobExecutor 等）
//! - task_state: 任务状态读写（乐观锁重试）
//! - commands: CQRS 命令及处理器
//! - queries: CQRS 查询及处理器
//! - error: 应用层错误定义

pub mod commands;
pub mod error;
pub mod ports;
pub mod queries;
pub mod task_state;

// Re-exports
pub use commands::{
    handlers::{
        CancelReconstructionHandler, DeleteReconstructionHandler, IngestResultPartHandler,
        IngestStatusUpdateHandler, SubmitReconstructionHandler,
    },
    CancelReconstruction, DeleteReconstruction, IngestResultPart, IngestStatusUpdate,
    SubmitReconstruction, SubmitReconstructionResponse,
};

pub use error::ApplicationError;

pub use ports::{
    // Artifact storage
    validate_artifact_name,
    ArtifactStorageError,
    ArtifactStoragePort,
    StoredArtifact,
    // Inference
    ConnectionStatus,
    InferenceTransport,
    NotificationSink,
    SubmissionHandle,
    SubmissionResult,
    TaskSubmissionPort,
    TransportError,
    TransportListener,
    // Job executor
    Admission,
    Job,
    JobExecutorPort,
    // Repositories
    ModelCatalogPort,
    ModelDraft,
    ModelRecord,
    RepositoryError,
    TaskListQuery,
    TaskPage,
    TaskRepositoryPort,
};

pub use queries::{
    handlers::{artifact_content_type, GetArtifactHandler, GetTaskStatusHandler, ListTasksHandler},
    ArtifactContent, ArtifactFile, GetArtifact, GetTaskStatus, ListTasks, TaskView,
};

pub use task_state::TaskStateStore;
