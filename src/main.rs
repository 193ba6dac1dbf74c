//! Recon3D - 单图三维重建任务编排服务
//!
//! 启动顺序:
//! - 配置 / 日志
//! - SQLite + 产物目录
//! - 推理通道（websocket 或 http_callback）与提交协调器
//! - 工作池、心跳、探活、状态清理
//! - HTTP 服务器（Ctrl-C 优雅关闭）

use std::sync::{Arc, Weak};
use std::time::Duration;

use recon3d::application::{
    InferenceTransport, NotificationSink, TaskStateStore, TaskSubmissionPort, TransportListener,
};
use recon3d::config::{load_config, print_config, AppConfig, InferenceMode};
use recon3d::infrastructure::adapters::{
    FileArtifactStorage, HttpCallbackClient, HttpCallbackClientConfig,
};
use recon3d::infrastructure::events::{BroadcasterSettings, EventBroadcaster};
use recon3d::infrastructure::http::{AppServices, AppState, HttpServer, ServerConfig};
use recon3d::infrastructure::inference::{
    ConnectionManager, ConnectionSettings, TaskSubmissionCoordinator,
};
use recon3d::infrastructure::memory::PartialResultRegistry;
use recon3d::infrastructure::persistence::sqlite::{
    create_pool, run_migrations, DatabaseConfig, SqliteModelCatalog, SqliteTaskRepository,
};
use recon3d::infrastructure::worker::{
    BoundedWorkerPool, StateJanitor, StateJanitorConfig, WorkerPoolConfig,
};
use recon3d::infrastructure::ResultAssembler;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &AppConfig) {
    let log_filter = format!(
        "{},recon3d={},tower_http=debug",
        config.log.level, config.log.level
    );
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_filter));

    if config.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置（优先级：环境变量 > 配置文件 > 默认值）
    let config = load_config().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    init_tracing(&config);

    tracing::info!("Recon3D - 单图三维重建任务编排服务");
    print_config(&config);

    // 确保数据目录存在
    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // 初始化数据库
    let db_config = DatabaseConfig {
        database_url: config.database.database_url(),
        max_connections: config.database.max_connections,
    };
    let pool = create_pool(&db_config).await?;
    run_migrations(&pool).await?;

    // 创建 Repository 与存储适配器
    let task_repo = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let models = Arc::new(SqliteModelCatalog::new(pool.clone()));
    let public_base_url = config.server.public_base_url();
    let storage = Arc::new(
        FileArtifactStorage::new(
            &config.storage.root_dir,
            &config.storage.prefix,
            &public_base_url,
        )
        .await?,
    );

    let store = TaskStateStore::arc(task_repo);

    // 事件推送与结果组装
    let events = EventBroadcaster::new(BroadcasterSettings {
        heartbeat_interval: Duration::from_secs(config.events.heartbeat_interval_secs),
        idle_timeout: Duration::from_secs(config.events.idle_timeout_secs),
        channel_capacity: config.events.channel_capacity,
    })
    .arc();
    let partials = PartialResultRegistry::new().arc();
    let assembler = ResultAssembler::new(
        store.clone(),
        storage.clone(),
        models.clone(),
        events.clone(),
        partials,
    )
    .arc();
    let sink: Arc<dyn NotificationSink> = assembler.clone();

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    // 推理通道 + 提交协调器；通道只持有协调器的弱引用
    let inference = &config.inference;
    let mut ws_manager: Option<Arc<ConnectionManager>> = None;
    let mut http_client: Option<Arc<HttpCallbackClient>> = None;
    let transport: Arc<dyn InferenceTransport> = match inference.mode {
        InferenceMode::Websocket => {
            let manager = ConnectionManager::arc(ConnectionSettings {
                url: inference.ws_url.clone(),
                connect_timeout: inference.connect_timeout(),
                ping_interval: inference.ping_interval(),
                idle_threshold: inference.idle_threshold(),
            });
            ws_manager = Some(manager.clone());
            manager as Arc<dyn InferenceTransport>
        }
        InferenceMode::HttpCallback => {
            let client_config = HttpCallbackClientConfig::new(&inference.http_url, &public_base_url)
                .with_timeouts(inference.connect_timeout(), inference.request_timeout());
            let client = Arc::new(HttpCallbackClient::new(client_config)?);
            tracing::info!(callback_url = %client.callback_url(), "Using HTTP callback inference");
            http_client = Some(client.clone());
            client as Arc<dyn InferenceTransport>
        }
    };

    let coordinator =
        TaskSubmissionCoordinator::arc(transport.clone(), sink.clone(), inference.submit_timeout());
    let listener: Arc<dyn TransportListener> = coordinator.clone();
    let listener: Weak<dyn TransportListener> = Arc::downgrade(&listener);
    if let Some(manager) = &ws_manager {
        manager.attach(listener.clone());
    }
    if let Some(client) = &http_client {
        client.attach(listener);
    }

    if let Some(manager) = &ws_manager {
        background.push(manager.spawn_liveness_check(shutdown.clone()));
    }

    // 有界工作池
    let (executor, runner) = BoundedWorkerPool::new(WorkerPoolConfig {
        max_concurrent: config.worker.max_concurrent,
        queue_capacity: config.worker.queue_capacity,
    });
    background.push(tokio::spawn(runner.run(shutdown.clone())));

    // 共享心跳
    background.push(events.spawn_heartbeat(shutdown.clone()));

    // 过期部分结果清理
    if config.gc.enabled {
        let janitor = StateJanitor::new(
            StateJanitorConfig {
                interval: Duration::from_secs(config.gc.interval_secs),
                state_ttl: Duration::from_secs(config.gc.state_ttl_secs),
            },
            assembler.clone(),
        );
        background.push(janitor.spawn(shutdown.clone()));
    }

    // 创建 HTTP 服务器
    let server_config = ServerConfig::new(&config.server.host, config.server.port)
        .with_max_body_size(config.storage.max_upload_size as usize);
    let coordinator: Arc<dyn TaskSubmissionPort> = coordinator;
    let state = AppState::new(AppServices {
        store,
        storage,
        models,
        transport,
        coordinator,
        sink,
        executor: Arc::new(executor),
        events: events.clone(),
        sync_wait: inference.sync_wait(),
    });

    let server = HttpServer::new(server_config, state);

    tracing::info!("Starting HTTP server...");

    // 启动服务器（带优雅关闭）
    let signal = shutdown.clone();
    server
        .run_with_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Received shutdown signal");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    events.close_all("shutdown");
    if let Some(manager) = &ws_manager {
        manager.shutdown().await;
    }
    for handle in background {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");

    Ok(())
}
