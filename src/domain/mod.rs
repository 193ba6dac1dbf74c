//! Domain Layer - 领域层
//!
//! 限界上下文:
//! - Reconstruction Context: 图片到 3D 模型的重建任务

pub mod reconstruction;
