//! Reconstruction Context - Value Objects

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::ReconstructionError;

/// 完成判定所需的三个固定分片名
pub const REQUIRED_PARTS: [&str; 3] = ["pixel_images.png", "xyz_images.png", "output3d.zip"];

/// 计算尚未收到的必需分片
pub fn missing_required_parts(received: &BTreeSet<String>) -> Vec<&'static str> {
    REQUIRED_PARTS
        .iter()
        .copied()
        .filter(|name| !received.contains(*name))
        .collect()
}

/// 判断分片是否为压缩包（需要解包）
pub fn is_archive_part(name: &str, content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    name.to_ascii_lowercase().ends_with(".zip")
        || content_type == "application/zip"
        || content_type == "application/x-zip-compressed"
}

/// 任务唯一标识
///
/// 对外可见，同时作为存储命名空间的一级目录，因此只允许
/// 字母、数字、`-` 和 `_`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self, ReconstructionError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ReconstructionError::InvalidTaskId(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 任务状态
///
/// 只允许单调前进：PENDING → PROCESSING → COMPLETED / FAILED，
/// 终态不再接受任何迁移。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "PROCESSING" => Some(TaskStatus::Processing),
            "COMPLETED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// 推理服务使用小写状态名: processing | completed | failed
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 结果产物角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactRole {
    Geometry,
    Material,
    Texture,
    PixelImage,
    XyzImage,
}

impl ArtifactRole {
    pub const ALL: [ArtifactRole; 5] = [
        ArtifactRole::Geometry,
        ArtifactRole::Material,
        ArtifactRole::Texture,
        ArtifactRole::PixelImage,
        ArtifactRole::XyzImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactRole::Geometry => "geometry",
            ArtifactRole::Material => "material",
            ArtifactRole::Texture => "texture",
            ArtifactRole::PixelImage => "pixel_image",
            ArtifactRole::XyzImage => "xyz_image",
        }
    }

    /// 顶层分片名 → 角色（非压缩包分片）
    pub fn from_part_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.contains("pixel_images") {
            Some(ArtifactRole::PixelImage)
        } else if name.contains("xyz_images") {
            Some(ArtifactRole::XyzImage)
        } else {
            None
        }
    }

    /// 压缩包内文件 → 角色（按扩展名）
    pub fn from_archive_entry(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let ext = lower.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext {
            "obj" => Some(ArtifactRole::Geometry),
            "mtl" => Some(ArtifactRole::Material),
            "png" | "jpg" | "jpeg"
                if !lower.contains("pixel_images") && !lower.contains("xyz_images") =>
            {
                Some(ArtifactRole::Texture)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 每个角色一个 URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactUrls {
    pub geometry: Option<String>,
    pub material: Option<String>,
    pub texture: Option<String>,
    pub pixel_image: Option<String>,
    pub xyz_image: Option<String>,
}

impl ArtifactUrls {
    pub fn get(&self, role: ArtifactRole) -> Option<&str> {
        match role {
            ArtifactRole::Geometry => self.geometry.as_deref(),
            ArtifactRole::Material => self.material.as_deref(),
            ArtifactRole::Texture => self.texture.as_deref(),
            ArtifactRole::PixelImage => self.pixel_image.as_deref(),
            ArtifactRole::XyzImage => self.xyz_image.as_deref(),
        }
    }

    pub fn set(&mut self, role: ArtifactRole, url: String) {
        let slot = match role {
            ArtifactRole::Geometry => &mut self.geometry,
            ArtifactRole::Material => &mut self.material,
            ArtifactRole::Texture => &mut self.texture,
            ArtifactRole::PixelImage => &mut self.pixel_image,
            ArtifactRole::XyzImage => &mut self.xyz_image,
        };
        *slot = Some(url);
    }

    /// 已填充的 (角色, URL)
    pub fn iter(&self) -> impl Iterator<Item = (ArtifactRole, &str)> + '_ {
        ArtifactRole::ALL
            .into_iter()
            .filter_map(move |role| self.get(role).map(|url| (role, url)))
    }

    pub fn is_complete(&self) -> bool {
        ArtifactRole::ALL.iter().all(|role| self.get(*role).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_required_parts() {
        let mut received = BTreeSet::new();
        received.insert("pixel_images.png".to_string());
        received.insert("xyz_images.png".to_string());
        assert_eq!(missing_required_parts(&received), vec!["output3d.zip"]);

        received.insert("output3d.zip".to_string());
        received.insert("debug.txt".to_string());
        assert!(missing_required_parts(&received).is_empty());
    }

    #[test]
    fn test_status_order() {
        assert!(TaskStatus::Pending.rank() < TaskStatus::Processing.rank());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert_eq!(TaskStatus::from_wire("Completed"), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::from_wire("pending"), None);
    }

    #[test]
    fn test_archive_entry_roles() {
        assert_eq!(
            ArtifactRole::from_archive_entry("out/mesh.OBJ"),
            Some(ArtifactRole::Geometry)
        );
        assert_eq!(
            ArtifactRole::from_archive_entry("mesh.mtl"),
            Some(ArtifactRole::Material)
        );
        assert_eq!(
            ArtifactRole::from_archive_entry("albedo.jpg"),
            Some(ArtifactRole::Texture)
        );
        assert_eq!(ArtifactRole::from_archive_entry("pixel_images.png"), None);
        assert_eq!(ArtifactRole::from_archive_entry("readme"), None);
    }

    #[test]
    fn test_task_id_validation() {
        assert!(TaskId::parse("abc-123_x").is_ok());
        assert!(TaskId::parse("../etc").is_err());
        assert!(TaskId::parse("").is_err());
        assert_eq!(TaskId::new().as_str().len(), 32);
    }
}
