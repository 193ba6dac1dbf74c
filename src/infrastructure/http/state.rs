//! Application State
//!
//! 包含所有 Command/Query Handlers 的应用状态

use std::sync::Arc;
use std::time::Duration;

use crate::application::{
    // Command handlers
    CancelReconstructionHandler, DeleteReconstructionHandler, IngestResultPartHandler,
    IngestStatusUpdateHandler, SubmitReconstructionHandler,
    // Query handlers
    GetArtifactHandler, GetTaskStatusHandler, ListTasksHandler,
    // Ports
    ArtifactStoragePort, InferenceTransport, JobExecutorPort, ModelCatalogPort, NotificationSink,
    TaskStateStore, TaskSubmissionPort,
};
use crate::infrastructure::events::EventBroadcaster;

/// 应用状态
pub struct AppState {
    // ========== Services ==========
    pub store: Arc<TaskStateStore>,
    pub transport: Arc<dyn InferenceTransport>,
    pub coordinator: Arc<dyn TaskSubmissionPort>,
    pub events: Arc<EventBroadcaster>,

    // ========== Command Handlers ==========
    pub submit_handler: SubmitReconstructionHandler,
    pub cancel_handler: CancelReconstructionHandler,
    pub delete_handler: DeleteReconstructionHandler,
    pub ingest_part_handler: IngestResultPartHandler,
    pub ingest_status_handler: IngestStatusUpdateHandler,

    // ========== Query Handlers ==========
    pub get_status_handler: GetTaskStatusHandler,
    pub list_tasks_handler: ListTasksHandler,
    pub get_artifact_handler: GetArtifactHandler,
}

/// 构建 AppState 所需的协作方
pub struct AppServices {
    pub store: Arc<TaskStateStore>,
    pub storage: Arc<dyn ArtifactStoragePort>,
    pub models: Arc<dyn ModelCatalogPort>,
    pub transport: Arc<dyn InferenceTransport>,
    pub coordinator: Arc<dyn TaskSubmissionPort>,
    /// 终态落库与推送（ResultAssembler）
    pub sink: Arc<dyn NotificationSink>,
    pub executor: Arc<dyn JobExecutorPort>,
    pub events: Arc<EventBroadcaster>,
    pub sync_wait: Duration,
}

impl AppState {
    /// 创建应用状态
    pub fn new(services: AppServices) -> Self {
        let AppServices {
            store,
            storage,
            models,
            transport,
            coordinator,
            sink,
            executor,
            events,
            sync_wait,
        } = services;

        Self {
            // Command handlers
            submit_handler: SubmitReconstructionHandler::new(
                store.clone(),
                coordinator.clone(),
                sink.clone(),
                executor,
                sync_wait,
            ),
            cancel_handler: CancelReconstructionHandler::new(
                store.clone(),
                coordinator.clone(),
                sink,
            ),
            delete_handler: DeleteReconstructionHandler::new(store.clone()),
            ingest_part_handler: IngestResultPartHandler::new(coordinator.clone()),
            ingest_status_handler: IngestStatusUpdateHandler::new(coordinator.clone()),

            // Query handlers
            get_status_handler: GetTaskStatusHandler::new(store.clone(), storage.clone(), models),
            list_tasks_handler: ListTasksHandler::new(store.clone()),
            get_artifact_handler: GetArtifactHandler::new(storage),

            // Services
            store,
            transport,
            coordinator,
            events,
        }
    }
}
