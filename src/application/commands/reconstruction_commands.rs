//! Reconstruction Commands - 重建任务写操作

use crate::domain::reconstruction::{ReconstructionTask, TaskId};

/// 提交图片进行 3D 重建
#[derive(Debug, Clone)]
pub struct SubmitReconstruction {
    pub user_id: i64,
    pub source_image_id: Option<i64>,
    pub image: Vec<u8>,
    /// 同步变体：在 sync_wait 上限内等待终态
    pub wait: bool,
}

/// 提交结果
#[derive(Debug, Clone)]
pub struct SubmitReconstructionResponse {
    /// 返回时的任务快照
    pub task: ReconstructionTask,
    /// 同步等待是否因超时提前返回
    pub wait_elapsed: bool,
}

/// 取消在途任务
#[derive(Debug, Clone)]
pub struct CancelReconstruction {
    pub task_id: TaskId,
    pub reason: Option<String>,
}

/// HTTP 回调：一个结果分片
#[derive(Debug, Clone)]
pub struct IngestResultPart {
    pub task_id: TaskId,
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// HTTP 回调：状态变更
#[derive(Debug, Clone)]
pub struct IngestStatusUpdate {
    pub task_id: TaskId,
    /// 推理服务的原始状态字符串
    pub status: String,
    pub error: Option<String>,
}

/// 逻辑删除
#[derive(Debug, Clone)]
pub struct DeleteReconstruction {
    pub task_id: TaskId,
    pub user_id: i64,
}
