//! Recon3D - 单图三维重建任务编排服务
//!
//! 架构设计: DDD + CQRS + Hexagonal Architecture
//!
//! 领域层 (domain/):
//! - Reconstruction Context: 重建任务、状态机、产物角色
//!
//! 应用层 (application/):
//! - Ports: 端口定义（InferenceTransport, TaskSubmissionPort, NotificationSink, Repositories, ArtifactStorage）
//! - TaskStateStore: 单调状态机的唯一写入口
//! - Commands: CQRS 命令处理器
//! - Queries: CQRS 查询处理器
//!
//! 基础设施层 (infrastructure/):
//! - Inference: 共享 WebSocket 连接 + 任务提交关联
//! - Adapters: HTTP 回调推理客户端, 文件产物存储
//! - Assembly: 结果分片组装、zip 解包
//! - Events: 单任务推送通道（SSE / WebSocket）
//! - Memory: 部分结果注册表
//! - Worker: 有界工作池, 过期状态清理
//! - Persistence: SQLite 存储
//! - HTTP: RESTful API + SSE + WebSocket

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::{load_config, AppConfig};
