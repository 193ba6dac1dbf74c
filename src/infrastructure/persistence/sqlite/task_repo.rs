//! SQLite Reconstruction Task Repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::DbPool;
use crate::application::ports::{RepositoryError, TaskListQuery, TaskPage, TaskRepositoryPort};
use crate::domain::reconstruction::{ArtifactUrls, ReconstructionTask, TaskId, TaskParts, TaskStatus};

const TASK_COLUMNS: &str = "id, user_id, source_image_id, status, result_model_id, error_message, \
     processing_secs, geometry_url, material_url, texture_url, pixel_image_url, xyz_image_url, \
     version, is_deleted, created_at, updated_at";

/// SQLite Task Repository
pub struct SqliteTaskRepository {
    pool: DbPool,
}

impl SqliteTaskRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: String,
    user_id: i64,
    source_image_id: Option<i64>,
    status: String,
    result_model_id: Option<i64>,
    error_message: Option<String>,
    processing_secs: Option<i64>,
    geometry_url: Option<String>,
    material_url: Option<String>,
    texture_url: Option<String>,
    pixel_image_url: Option<String>,
    xyz_image_url: Option<String>,
    version: i64,
    is_deleted: bool,
    created_at: String,
    updated_at: String,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RepositoryError::SerializationError(e.to_string()))
}

impl TryFrom<TaskRow> for ReconstructionTask {
    type Error = RepositoryError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(ReconstructionTask::rehydrate(TaskParts {
            id: TaskId::parse(row.id)
                .map_err(|e| RepositoryError::SerializationError(e.to_string()))?,
            user_id: row.user_id,
            source_image_id: row.source_image_id,
            status: TaskStatus::from_str(&row.status).ok_or_else(|| {
                RepositoryError::SerializationError(format!("Unknown status: {}", row.status))
            })?,
            result_model_id: row.result_model_id,
            error_message: row.error_message,
            processing_secs: row.processing_secs,
            artifacts: ArtifactUrls {
                geometry: row.geometry_url,
                material: row.material_url,
                texture: row.texture_url,
                pixel_image: row.pixel_image_url,
                xyz_image: row.xyz_image_url,
            },
            version: row.version,
            deleted: row.is_deleted,
            created_at: parse_time(&row.created_at)?,
            updated_at: parse_time(&row.updated_at)?,
        }))
    }
}

#[async_trait]
impl TaskRepositoryPort for SqliteTaskRepository {
    async fn insert(&self, task: &ReconstructionTask) -> Result<(), RepositoryError> {
        let artifacts = task.artifacts();
        sqlx::query(
            r#"
            INSERT INTO reconstruction_tasks (
                id, user_id, source_image_id, status, result_model_id, error_message,
                processing_secs, geometry_url, material_url, texture_url, pixel_image_url,
                xyz_image_url, version, is_deleted, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id().as_str())
        .bind(task.user_id())
        .bind(task.source_image_id())
        .bind(task.status().as_str())
        .bind(task.result_model_id())
        .bind(task.error_message())
        .bind(task.processing_secs())
        .bind(&artifacts.geometry)
        .bind(&artifacts.material)
        .bind(&artifacts.texture)
        .bind(&artifacts.pixel_image)
        .bind(&artifacts.xyz_image)
        .bind(task.version())
        .bind(task.is_deleted())
        .bind(task.created_at().to_rfc3339())
        .bind(task.updated_at().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Duplicate(task.id().to_string())
            }
            other => RepositoryError::DatabaseError(other.to_string()),
        })?;

        Ok(())
    }

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<ReconstructionTask>, RepositoryError> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reconstruction_tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::DatabaseError(e.to_string()))?;

        row.map(ReconstructionTask::try_from).transpose()
    }

    async fn update(
        &self,
        task: &ReconstructionTask,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let artifacts = task.artifacts();
        let result = sqlx::query(
            r#"
            UPDATE reconstruction_tasks SET
                status = ?,
                result_model_id = ?,
                error_message = ?,
                processing_secs = ?,
                geometry_url = ?,
                material_url = ?,
                texture_url = ?,
                pixel_image_url = ?,
                xyz_image_url = ?,
                version = ?,
                is_deleted = ?,
                updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(task.status().as_str())
        .bind(task.result_model_id())
        .bind(task.error_message())
        .bind(task.processing_secs())
        .bind(&artifacts.geometry)
        .bind(&artifacts.material)
        .bind(&artifacts.texture)
        .bind(&artifacts.pixel_image)
        .bind(&artifacts.xyz_image)
        .bind(task.version())
        .bind(task.is_deleted())
        .bind(task.updated_at().to_rfc3339())
        .bind(task.id().as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_by_user(&self, query: &TaskListQuery) -> Result<TaskPage, RepositoryError> {
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM reconstruction_tasks
            WHERE user_id = ? AND is_deleted = 0 AND (? IS NULL OR status = ?)
            "#,
        )
        .bind(query.user_id)
        .bind(status)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryError::DatabaseError(e.to_string()))?;

        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reconstruction_tasks \
             WHERE user_id = ? AND is_deleted = 0 AND (? IS NULL OR status = ?) \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
            TASK_COLUMNS
        ))
        .bind(query.user_id)
        .bind(status)
        .bind(status)
        .bind(query.page_size as i64)
        .bind(query.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::DatabaseError(e.to_string()))?;

        let items = rows
            .into_iter()
            .map(ReconstructionTask::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TaskPage {
            items,
            total: total.max(0) as u64,
            page: query.page,
            page_size: query.page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reconstruction::ArtifactRole;
    use crate::infrastructure::persistence::sqlite::{create_pool, run_migrations, DatabaseConfig};

    async fn repo() -> SqliteTaskRepository {
        let pool = create_pool(&DatabaseConfig::in_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteTaskRepository::new(pool)
    }

    #[tokio::test]
    async fn test_insert_and_find_roundtrip() {
        let repo = repo().await;
        let mut task = ReconstructionTask::new(3, Some(9));
        repo.insert(&task).await.unwrap();

        let expected = task.version();
        task.attach_artifact(ArtifactRole::PixelImage, "http://x/p.png".into())
            .unwrap();
        assert!(repo.update(&task, expected).await.unwrap());

        let loaded = repo.find_by_id(task.id()).await.unwrap().unwrap();
        assert_eq!(loaded.status(), TaskStatus::Pending);
        assert_eq!(loaded.source_image_id(), Some(9));
        assert_eq!(loaded.artifacts().pixel_image.as_deref(), Some("http://x/p.png"));
        assert_eq!(loaded.version(), 1);

        assert!(matches!(
            repo.insert(&task).await,
            Err(RepositoryError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let repo = repo().await;
        let mut task = ReconstructionTask::new(1, None);
        repo.insert(&task).await.unwrap();

        task.advance(TaskStatus::Processing, None).unwrap();
        assert!(repo.update(&task, 0).await.unwrap());
        // 同一个期望版本再写一次
        task.advance(TaskStatus::Failed, Some("x".into())).unwrap();
        assert!(!repo.update(&task, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_excludes_deleted_and_filters_status() {
        let repo = repo().await;
        for _ in 0..3 {
            repo.insert(&ReconstructionTask::new(7, None)).await.unwrap();
        }
        let mut failed = ReconstructionTask::new(7, None);
        repo.insert(&failed).await.unwrap();
        failed.advance(TaskStatus::Failed, None).unwrap();
        repo.update(&failed, 0).await.unwrap();

        let mut gone = ReconstructionTask::new(7, None);
        repo.insert(&gone).await.unwrap();
        gone.advance(TaskStatus::Failed, None).unwrap();
        gone.mark_deleted(7).unwrap();
        repo.update(&gone, 0).await.unwrap();

        repo.insert(&ReconstructionTask::new(8, None)).await.unwrap();

        let page = repo
            .list_by_user(&TaskListQuery {
                user_id: 7,
                status: None,
                page: 1,
                page_size: 2,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.items.len(), 2);

        let failed_only = repo
            .list_by_user(&TaskListQuery {
                user_id: 7,
                status: Some(TaskStatus::Failed),
                page: 1,
                page_size: 10,
            })
            .await
            .unwrap();
        assert_eq!(failed_only.total, 1);
        assert_eq!(failed_only.items[0].id(), failed.id());
    }
}
