//! 结果压缩包解包
//!
//! 包内每个文件都按自己的文件名（去掉目录）保留，OBJ 里的 `mtllib`、
//! MTL 里的 `map_Kd` 等相对引用因此仍然有效。扩展名只决定角色：
//! geometry / material / texture，同一角色出现多个文件时按包内顺序
//! 后者覆盖前者的 URL。

use std::io::{Cursor, Read};

use crate::application::error::ApplicationError;
use crate::application::ports::validate_artifact_name;
use crate::domain::reconstruction::{ArtifactRole, REQUIRED_PARTS};

/// 解包后的总大小上限
const MAX_UNPACKED_BYTES: u64 = 512 * 1024 * 1024;

/// 压缩包内文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedFile {
    /// 包内文件名（不含目录），也是落盘文件名
    pub name: String,
    /// 未归类的文件为 None，照样落盘
    pub role: Option<ArtifactRole>,
    pub data: Vec<u8>,
}

fn corruption(detail: impl std::fmt::Display) -> ApplicationError {
    ApplicationError::ArchiveCorruption(detail.to_string())
}

/// 同步解包，按包内顺序返回；重名文件只保留最后一个
pub fn unpack_archive(bytes: &[u8]) -> Result<Vec<UnpackedFile>, ApplicationError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(corruption)?;
    let mut files: Vec<UnpackedFile> = Vec::new();
    let mut budget = MAX_UNPACKED_BYTES;

    for index in 0..archive.len() {
        let file = archive.by_index(index).map_err(corruption)?;
        let raw_name = file.name().to_string();

        let Some(path) = file.enclosed_name() else {
            return Err(corruption(format!("entry escapes archive root: {}", raw_name)));
        };
        if file.is_dir() {
            continue;
        }

        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
        else {
            continue;
        };
        // 隐藏文件（__MACOSX/._x 之类）和与顶层分片同名的文件不落盘
        if name.starts_with('.')
            || validate_artifact_name(&name).is_err()
            || REQUIRED_PARTS.contains(&name.as_str())
        {
            tracing::debug!(entry = %raw_name, "Skipping archive entry");
            continue;
        }

        let mut data = Vec::new();
        let mut limited = file.take(budget + 1);
        limited.read_to_end(&mut data).map_err(corruption)?;
        if data.len() as u64 > budget {
            return Err(corruption("unpacked size exceeds limit"));
        }
        budget -= data.len() as u64;

        if let Some(position) = files.iter().position(|f| f.name == name) {
            tracing::warn!(entry = %raw_name, "Duplicate file name in archive, keeping the later one");
            files.remove(position);
        }
        files.push(UnpackedFile {
            role: ArtifactRole::from_archive_entry(&name),
            name,
            data,
        });
    }

    Ok(files)
}

/// 在阻塞线程池上解包
pub async fn unpack_archive_blocking(bytes: Vec<u8>) -> Result<Vec<UnpackedFile>, ApplicationError> {
    tokio::task::spawn_blocking(move || unpack_archive(&bytes))
        .await
        .map_err(|e| ApplicationError::internal(format!("Archive worker failed: {}", e)))?
}
