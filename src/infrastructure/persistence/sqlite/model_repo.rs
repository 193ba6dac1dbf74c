//! SQLite Model Catalog
//!
//! 每个任务最多登记一个结果模型，重复登记返回已有 ID。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::DbPool;
use crate::application::ports::{ModelCatalogPort, ModelDraft, ModelRecord, RepositoryError};
use crate::domain::reconstruction::{ArtifactUrls, TaskId};

/// SQLite Model Catalog
pub struct SqliteModelCatalog {
    pool: DbPool,
}

impl SqliteModelCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_id_by_task(&self, task_id: &TaskId) -> Result<Option<i64>, RepositoryError> {
        sqlx::query_scalar("SELECT id FROM reconstruction_models WHERE task_id = ?")
            .bind(task_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::DatabaseError(e.to_string()))
    }
}

#[derive(FromRow)]
struct ModelRow {
    id: i64,
    task_id: String,
    user_id: i64,
    source_image_id: Option<i64>,
    name: String,
    format: String,
    geometry_url: Option<String>,
    material_url: Option<String>,
    texture_url: Option<String>,
    pixel_image_url: Option<String>,
    xyz_image_url: Option<String>,
    created_at: String,
}

impl TryFrom<ModelRow> for ModelRecord {
    type Error = RepositoryError;

    fn try_from(row: ModelRow) -> Result<Self, Self::Error> {
        Ok(ModelRecord {
            id: row.id,
            task_id: TaskId::parse(row.task_id)
                .map_err(|e| RepositoryError::SerializationError(e.to_string()))?,
            user_id: row.user_id,
            source_image_id: row.source_image_id,
            name: row.name,
            format: row.format,
            artifacts: ArtifactUrls {
                geometry: row.geometry_url,
                material: row.material_url,
                texture: row.texture_url,
                pixel_image: row.pixel_image_url,
                xyz_image: row.xyz_image_url,
            },
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map_err(|e| RepositoryError::SerializationError(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl ModelCatalogPort for SqliteModelCatalog {
    async fn register(&self, draft: &ModelDraft) -> Result<i64, RepositoryError> {
        if let Some(id) = self.find_id_by_task(&draft.task_id).await? {
            return Ok(id);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO reconstruction_models (
                task_id, user_id, source_image_id, name, format,
                geometry_url, material_url, texture_url, pixel_image_url, xyz_image_url,
                created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO NOTHING
            "#,
        )
        .bind(draft.task_id.as_str())
        .bind(draft.user_id)
        .bind(draft.source_image_id)
        .bind(&draft.name)
        .bind(&draft.format)
        .bind(&draft.artifacts.geometry)
        .bind(&draft.artifacts.material)
        .bind(&draft.artifacts.texture)
        .bind(&draft.artifacts.pixel_image)
        .bind(&draft.artifacts.xyz_image)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 1 {
            let id = result.last_insert_rowid();
            tracing::info!(task_id = %draft.task_id, model_id = id, "Result model registered");
            return Ok(id);
        }

        // 并发登记输掉了竞争，取对方写入的 ID
        self.find_id_by_task(&draft.task_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("model for task {}", draft.task_id)))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ModelRecord>, RepositoryError> {
        let row: Option<ModelRow> = sqlx::query_as(
            r#"
            SELECT id, task_id, user_id, source_image_id, name, format,
                   geometry_url, material_url, texture_url, pixel_image_url, xyz_image_url,
                   created_at
            FROM reconstruction_models WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::DatabaseError(e.to_string()))?;

        row.map(ModelRecord::try_from).transpose()
    }
}
