//! Configuration Loader
//!
//! 实现多源配置加载与合并逻辑
//!
//! 优先级（从高到低）：
//! 1. 环境变量
//! 2. 配置文件（config.toml）
//! 3. 默认值

use config::{Config, ConfigError as ConfigCrateError, Environment, File};
use std::path::Path;
use thiserror::Error;

use super::types::{AppConfig, InferenceMode};

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

/// 配置文件搜索路径
const CONFIG_FILE_NAMES: &[&str] = &["config", "config.local"];

/// 加载应用配置
///
/// # 环境变量示例
/// - `RECON3D_SERVER__PORT=8080`
/// - `RECON3D_INFERENCE__MODE=http_callback`
/// - `RECON3D_INFERENCE__WS_URL=ws://gpu-box:8001/generate3d`
/// - `RECON3D_DATABASE__PATH=/data/recon3d.db`
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from_path(None)
}

/// 从指定路径加载配置
///
/// # 参数
/// - `config_path` - 可选的配置文件路径，如果为 None 则使用默认搜索路径
pub fn load_config_from_path(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    // 1. 首先设置默认值（最低优先级）
    builder = builder
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8090)?
        .set_default("inference.mode", "websocket")?
        .set_default("inference.ws_url", "ws://10.0.0.2:8001/generate3d")?
        .set_default("inference.http_url", "http://10.0.0.2:8001")?
        .set_default("inference.connect_timeout_secs", 30)?
        .set_default("inference.request_timeout_secs", 60)?
        .set_default("inference.submit_timeout_secs", 300)?
        .set_default("inference.sync_wait_secs", 120)?
        .set_default("inference.ping_interval_secs", 120)?
        .set_default("inference.idle_threshold_secs", 180)?
        .set_default("events.heartbeat_interval_secs", 30)?
        .set_default("events.idle_timeout_secs", 1800)?
        .set_default("events.channel_capacity", 64)?
        .set_default("worker.max_concurrent", 10)?
        .set_default("worker.queue_capacity", 50)?
        .set_default("database.path", "data/recon3d.db")?
        .set_default("database.max_connections", 5)?
        .set_default("storage.root_dir", "data/artifacts")?
        .set_default("storage.prefix", "reconstruction")?
        .set_default("storage.max_upload_size", 50 * 1024 * 1024)?
        .set_default("gc.enabled", true)?
        .set_default("gc.interval_secs", 300)?
        .set_default("gc.state_ttl_secs", 3600)?
        .set_default("log.level", "info")?
        .set_default("log.json", false)?;

    // 2. 添加配置文件（如果存在）
    if let Some(path) = config_path {
        builder = builder.add_source(File::from(path).required(true));
    } else {
        for name in CONFIG_FILE_NAMES {
            builder = builder.add_source(File::with_name(name).required(false));
        }
    }

    // 3. 添加环境变量（最高优先级）
    // 前缀: RECON3D_
    // 层级分隔符: __ (双下划线)
    builder = builder.add_source(
        Environment::with_prefix("RECON3D")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    // 4. 构建配置
    let config = builder.build()?;

    // 5. 反序列化为 AppConfig
    let app_config: AppConfig = config.try_deserialize().map_err(|e| {
        ConfigError::ParseError(format!("Failed to deserialize config: {}", e))
    })?;

    // 6. 验证配置
    validate_config(&app_config)?;

    Ok(app_config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// 验证配置有效性
fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("Server port cannot be 0"));
    }

    let inference = &config.inference;
    match inference.mode {
        InferenceMode::Websocket => {
            if !(inference.ws_url.starts_with("ws://") || inference.ws_url.starts_with("wss://")) {
                return Err(invalid(format!(
                    "Inference ws_url must start with ws:// or wss://, got {:?}",
                    inference.ws_url
                )));
            }
        }
        InferenceMode::HttpCallback => {
            if inference.http_url.is_empty() {
                return Err(invalid("Inference http_url cannot be empty"));
            }
        }
    }

    let timeouts = [
        ("inference.connect_timeout_secs", inference.connect_timeout_secs),
        ("inference.request_timeout_secs", inference.request_timeout_secs),
        ("inference.submit_timeout_secs", inference.submit_timeout_secs),
        ("inference.sync_wait_secs", inference.sync_wait_secs),
        ("inference.ping_interval_secs", inference.ping_interval_secs),
        ("inference.idle_threshold_secs", inference.idle_threshold_secs),
        ("events.heartbeat_interval_secs", config.events.heartbeat_interval_secs),
        ("events.idle_timeout_secs", config.events.idle_timeout_secs),
        ("gc.state_ttl_secs", config.gc.state_ttl_secs),
    ];
    if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
        return Err(invalid(format!("{} cannot be 0", name)));
    }

    if config.events.channel_capacity == 0 {
        return Err(invalid("Event channel capacity cannot be 0"));
    }
    if config.worker.max_concurrent == 0 || config.worker.queue_capacity == 0 {
        return Err(invalid("Worker pool sizes cannot be 0"));
    }

    if config.database.path.is_empty() {
        return Err(invalid("Database path cannot be empty"));
    }
    if config.storage.prefix.is_empty() || config.storage.prefix.contains(['/', '\\']) {
        return Err(invalid("Storage prefix must be a single non-empty path component"));
    }

    if config.gc.enabled && config.gc.interval_secs == 0 {
        return Err(invalid("GC interval cannot be 0 when GC is enabled"));
    }

    Ok(())
}

/// 打印配置信息（用于启动时日志）
pub fn print_config(config: &AppConfig) {
    tracing::info!("=== Application Configuration ===");
    tracing::info!("Server: {}:{}", config.server.host, config.server.port);
    tracing::info!("Public Base URL: {}", config.server.public_base_url());
    tracing::info!("Inference Mode: {}", config.inference.mode.as_str());
    match config.inference.mode {
        InferenceMode::Websocket => tracing::info!("Inference WS URL: {}", config.inference.ws_url),
        InferenceMode::HttpCallback => {
            tracing::info!("Inference HTTP URL: {}", config.inference.http_url)
        }
    }
    tracing::info!("Submit Timeout: {}s", config.inference.submit_timeout_secs);
    tracing::info!("Sync Wait: {}s", config.inference.sync_wait_secs);
    tracing::info!(
        "Worker Pool: {} concurrent, queue {}",
        config.worker.max_concurrent,
        config.worker.queue_capacity
    );
    tracing::info!("Heartbeat: {}s", config.events.heartbeat_interval_secs);
    tracing::info!("Database: {}", config.database.path);
    tracing::info!("Artifact Directory: {:?}", config.storage.root_dir);
    tracing::info!("GC Enabled: {}", config.gc.enabled);
    if config.gc.enabled {
        tracing::info!("GC Interval: {}s", config.gc.interval_secs);
        tracing::info!("State TTL: {}s", config.gc.state_ttl_secs);
    }
    tracing::info!("Log Level: {}", config.log.level);
    tracing::info!("=================================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validation_passes_for_valid_config() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validation_error_for_zero_port() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validation_error_for_non_ws_url() {
        let mut config = AppConfig::default();
        config.inference.ws_url = "http://10.0.0.2:8001".to_string();
        assert!(validate_config(&config).is_err());

        // http_callback 模式不检查 ws_url
        config.inference.mode = InferenceMode::HttpCallback;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validation_error_for_zero_timeout() {
        let mut config = AppConfig::default();
        config.inference.submit_timeout_secs = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("inference.submit_timeout_secs"));
    }

    #[test]
    fn test_validation_error_for_zero_pool() {
        let mut config = AppConfig::default();
        config.worker.queue_capacity = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[inference]\nmode = \"http_callback\"\nsync_wait_secs = 5\n\n[gc]\nstate_ttl_secs = 60"
        )
        .unwrap();

        let config = load_config_from_path(Some(file.path())).unwrap();
        assert_eq!(config.inference.mode, InferenceMode::HttpCallback);
        assert_eq!(config.inference.sync_wait_secs, 5);
        assert_eq!(config.gc.state_ttl_secs, 60);
        assert_eq!(config.server.port, 8090);
    }
}
