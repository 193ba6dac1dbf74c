//! 推理服务帧协议
//!
//! 文本帧为 JSON 控制帧，`type` 字段区分种类；二进制帧都带任务 ID 前缀：
//!
//! ```text
//! | id_len: u16 BE | task_id (UTF-8) | body ... |
//! ```
//!
//! 出站二进制帧的 body 是图片，入站二进制帧的 body 是同一任务上一个
//! `result_part` 头描述的分片内容。

use serde::{Deserialize, Serialize};

use crate::application::ports::TransportError;
use crate::domain::reconstruction::TaskId;

/// 控制帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// 入站：状态变更
    Status {
        task_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 入站：紧随其后的二进制帧是该分片内容
    ResultPart {
        task_id: String,
        name: String,
        #[serde(default = "default_content_type")]
        content_type: String,
    },
    /// 出站：放弃任务
    Cancel { task_id: String },
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl ControlFrame {
    pub fn cancel(task_id: &TaskId) -> Self {
        ControlFrame::Cancel {
            task_id: task_id.to_string(),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            ControlFrame::Status { task_id, .. }
            | ControlFrame::ResultPart { task_id, .. }
            | ControlFrame::Cancel { task_id } => task_id,
        }
    }

    pub fn parse(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("Malformed control frame: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

/// 编码带任务 ID 前缀的二进制帧
pub fn encode_binary(task_id: &TaskId, body: &[u8]) -> Vec<u8> {
    let id = task_id.as_str().as_bytes();
    // TaskId 最长 64 字节
    let mut frame = Vec::with_capacity(2 + id.len() + body.len());
    frame.extend_from_slice(&(id.len() as u16).to_be_bytes());
    frame.extend_from_slice(id);
    frame.extend_from_slice(body);
    frame
}

/// 解码二进制帧，返回 (任务 ID, body)
pub fn decode_binary(frame: &[u8]) -> Result<(TaskId, &[u8]), TransportError> {
    if frame.len() < 2 {
        return Err(TransportError::Protocol(format!(
            "Binary frame too short: {} bytes",
            frame.len()
        )));
    }
    let id_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let rest = &frame[2..];
    if rest.len() < id_len {
        return Err(TransportError::Protocol(format!(
            "Binary frame declares {}-byte task id but has {} bytes",
            id_len,
            rest.len()
        )));
    }
    let (id, body) = rest.split_at(id_len);
    let id = std::str::from_utf8(id)
        .map_err(|_| TransportError::Protocol("Task id is not UTF-8".to_string()))?;
    let task_id = TaskId::parse(id).map_err(|e| TransportError::Protocol(e.to_string()))?;
    Ok((task_id, body))
}
