//! SQLite Database - 连接池与建表

use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

/// 连接池配置
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// 测试用内存库；每个连接都是独立的库，所以只开一个
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }
}

pub type DbPool = Pool<Sqlite>;

/// 连接建立后逐条执行
const PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode=WAL",
    "PRAGMA busy_timeout=5000",
    "PRAGMA synchronous=NORMAL",
];

/// 幂等建表，启动时按顺序执行
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "reconstruction_tasks",
        r#"
        CREATE TABLE IF NOT EXISTS reconstruction_tasks (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            source_image_id INTEGER,
            status TEXT NOT NULL DEFAULT 'PENDING',
            result_model_id INTEGER,
            error_message TEXT,
            processing_secs INTEGER,
            geometry_url TEXT,
            material_url TEXT,
            texture_url TEXT,
            pixel_image_url TEXT,
            xyz_image_url TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "reconstruction_models",
        r#"
        CREATE TABLE IF NOT EXISTS reconstruction_models (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL UNIQUE,
            user_id INTEGER NOT NULL,
            source_image_id INTEGER,
            name TEXT NOT NULL,
            format TEXT NOT NULL,
            geometry_url TEXT,
            material_url TEXT,
            texture_url TEXT,
            pixel_image_url TEXT,
            xyz_image_url TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "idx_reconstruction_tasks_user_created",
        r#"
        CREATE INDEX IF NOT EXISTS idx_reconstruction_tasks_user_created
        ON reconstruction_tasks(user_id, created_at)
        "#,
    ),
];

pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;

    for pragma in PRAGMAS {
        sqlx::query(pragma).execute(&pool).await?;
    }

    tracing::info!(
        url = %config.database_url,
        max_connections = config.max_connections,
        "SQLite pool ready (WAL, busy_timeout=5000ms)"
    );

    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    for (name, statement) in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
        tracing::debug!(migration = name, "Migration applied");
    }

    tracing::info!(count = MIGRATIONS.len(), "Database migrations completed");
    Ok(())
}
