//! Repository pattern for database operations
//!
//! Implements the extraction store contracts on PostgreSQL. Every write is a
//! single-row statement keyed by `document_id`.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::extraction::documents::{DocumentDirectory, DocumentHandle};
use crate::extraction::model::{
    CachedExtraction, DocumentCategory, ExtractedData, ExtractionTask, TaskStatus,
};
use crate::extraction::store::{CacheStore, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use tracing::debug;
use uuid::Uuid;

fn fixed(at: DateTime<Utc>) -> DateTime<FixedOffset> {
    at.into()
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    /// Connection for task row reads. Always the primary: callers write the
    /// row back, and a lagging replica can hand out a superseded `job_id`.
    fn task_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.pool.ensure_schema().await
    }

    // ========================================================================
    // Cache maintenance
    // ========================================================================

    /// Drop least recently used cache rows until at most `max_entries` remain
    async fn evict_cache(&self, max_entries: u64) -> Result<u64> {
        let total = ExtractionCacheEntity::find().count(self.write_conn()).await?;
        if total <= max_entries {
            return Ok(0);
        }

        let victims = ExtractionCacheEntity::find()
            .order_by_asc(ExtractionCacheColumn::LastUsedAt)
            .limit(total - max_entries)
            .all(self.write_conn())
            .await?;

        let mut evicted = 0;
        for victim in victims {
            evicted += ExtractionCacheEntity::delete_by_id((victim.category, victim.content_hash))
                .exec(self.write_conn())
                .await?
                .rows_affected;
        }
        debug!(evicted, "Evicted extraction cache entries");
        Ok(evicted)
    }
}

// ============================================================================
// Task records
// ============================================================================

#[async_trait]
impl TaskStore for Repository {
    async fn get_or_create(&self, document_id: Uuid) -> Result<(ExtractionTask, bool)> {
        let fresh = ExtractionTask::new(document_id);
        let inserted = ExtractionTaskEntity::insert(ExtractionTaskActiveModel::from(&fresh))
            .on_conflict(
                OnConflict::column(ExtractionTaskColumn::DocumentId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await;

        let created = match inserted {
            Ok(rows) => rows > 0,
            Err(DbErr::RecordNotInserted) => false,
            Err(e) => return Err(e.into()),
        };

        let row = ExtractionTaskEntity::find_by_id(document_id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::TaskNotFound {
                id: document_id.to_string(),
            })?;

        Ok((row.into(), created))
    }

    async fn find(&self, document_id: Uuid) -> Result<Option<ExtractionTask>> {
        let row = ExtractionTaskEntity::find_by_id(document_id)
            .one(self.task_conn())
            .await?;
        Ok(row.map(Into::into))
    }

    async fn save(&self, task: &ExtractionTask) -> Result<ExtractionTask> {
        let mut stored = task.clone();
        stored.updated_at = Utc::now();

        ExtractionTaskEntity::insert(ExtractionTaskActiveModel::from(&stored))
            .on_conflict(
                OnConflict::column(ExtractionTaskColumn::DocumentId)
                    .update_columns([
                        ExtractionTaskColumn::Status,
                        ExtractionTaskColumn::Progress,
                        ExtractionTaskColumn::JobId,
                        ExtractionTaskColumn::RetryCount,
                        ExtractionTaskColumn::ExtractedData,
                        ExtractionTaskColumn::ConfidenceScore,
                        ExtractionTaskColumn::ErrorMessage,
                        ExtractionTaskColumn::LastErrorAt,
                        ExtractionTaskColumn::ProcessTimeMs,
                        ExtractionTaskColumn::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await?;

        Ok(stored)
    }

    async fn save_if_job(
        &self,
        task: &ExtractionTask,
        expected: Option<&str>,
    ) -> Result<Option<ExtractionTask>> {
        let mut stored = task.clone();
        stored.updated_at = Utc::now();

        let owner = match expected {
            Some(job_id) => ExtractionTaskColumn::JobId.eq(job_id),
            None => ExtractionTaskColumn::JobId.is_null(),
        };
        let mut changes = ExtractionTaskActiveModel::from(&stored);
        changes.document_id = NotSet;
        changes.created_at = NotSet;

        let result = ExtractionTaskEntity::update_many()
            .set(changes)
            .filter(ExtractionTaskColumn::DocumentId.eq(task.document_id))
            .filter(owner)
            .exec(self.write_conn())
            .await?;

        if result.rows_affected == 0 {
            debug!(document_id = %task.document_id, ?expected, "Task owner changed, not saved");
            return Ok(None);
        }
        Ok(Some(stored))
    }

    async fn advance(
        &self,
        document_id: Uuid,
        job_id: &str,
        progress: i32,
        status: TaskStatus,
    ) -> Result<()> {
        ExtractionTaskEntity::update_many()
            .col_expr(ExtractionTaskColumn::Progress, Expr::value(progress))
            .col_expr(ExtractionTaskColumn::Status, Expr::value(status.as_str()))
            .col_expr(ExtractionTaskColumn::UpdatedAt, Expr::value(fixed(Utc::now())))
            .filter(ExtractionTaskColumn::DocumentId.eq(document_id))
            .filter(ExtractionTaskColumn::JobId.eq(job_id))
            .filter(ExtractionTaskColumn::Progress.lte(progress))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    async fn delete(&self, document_id: Uuid) -> Result<bool> {
        let result = ExtractionTaskEntity::delete_by_id(document_id)
            .exec(self.write_conn())
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn find_stale(&self, before: DateTime<Utc>, limit: u64) -> Result<Vec<ExtractionTask>> {
        let rows = ExtractionTaskEntity::find()
            .filter(ExtractionTaskColumn::Status.ne(TaskStatus::Succeeded.as_str()))
            .filter(ExtractionTaskColumn::UpdatedAt.lt(fixed(before)))
            .order_by_asc(ExtractionTaskColumn::UpdatedAt)
            .limit(limit)
            .all(self.task_conn())
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = ExtractionTaskEntity::delete_many()
            .filter(ExtractionTaskColumn::Status.eq(TaskStatus::Succeeded.as_str()))
            .filter(ExtractionTaskColumn::UpdatedAt.lt(fixed(before)))
            .exec(self.write_conn())
            .await?;
        Ok(result.rows_affected)
    }
}

// ============================================================================
// Extraction cache
// ============================================================================

#[async_trait]
impl CacheStore for Repository {
    async fn lookup(
        &self,
        category: DocumentCategory,
        content_hash: &str,
    ) -> Result<Option<CachedExtraction>> {
        let key = (category.as_str().to_string(), content_hash.to_string());
        let Some(mut row) = ExtractionCacheEntity::find_by_id(key.clone())
            .one(self.read_conn())
            .await?
        else {
            return Ok(None);
        };

        let now = fixed(Utc::now());
        ExtractionCacheEntity::update_many()
            .col_expr(
                ExtractionCacheColumn::UseCount,
                Expr::col(ExtractionCacheColumn::UseCount).add(1),
            )
            .col_expr(ExtractionCacheColumn::LastUsedAt, Expr::value(now))
            .filter(ExtractionCacheColumn::Category.eq(key.0))
            .filter(ExtractionCacheColumn::ContentHash.eq(key.1))
            .exec(self.write_conn())
            .await?;

        row.use_count += 1;
        row.last_used_at = now;
        Ok(Some(row.into()))
    }

    async fn remember(
        &self,
        category: DocumentCategory,
        content_hash: &str,
        data: &ExtractedData,
        confidence: f64,
        max_entries: u64,
    ) -> Result<()> {
        let now = fixed(Utc::now());
        let row = ExtractionCacheActiveModel {
            category: Set(category.as_str().to_string()),
            content_hash: Set(content_hash.to_string()),
            extracted_data: Set(serde_json::Value::Object(data.clone())),
            confidence_score: Set(confidence),
            use_count: Set(1),
            created_at: Set(now),
            last_used_at: Set(now),
        };

        ExtractionCacheEntity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    ExtractionCacheColumn::Category,
                    ExtractionCacheColumn::ContentHash,
                ])
                .update_columns([
                    ExtractionCacheColumn::ExtractedData,
                    ExtractionCacheColumn::ConfidenceScore,
                    ExtractionCacheColumn::LastUsedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await?;

        self.evict_cache(max_entries).await?;
        Ok(())
    }
}

// ============================================================================
// Documents
// ============================================================================

#[async_trait]
impl DocumentDirectory for Repository {
    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentHandle>> {
        let row = DocumentEntity::find_by_id(id).one(self.read_conn()).await?;
        Ok(row.map(Into::into))
    }

    async fn set_verification_flag(&self, id: Uuid, verified: bool) -> Result<()> {
        let result = DocumentEntity::update_many()
            .col_expr(DocumentColumn::IsVerified, Expr::value(verified))
            .filter(DocumentColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;

        if result.rows_affected == 0 {
            return Err(AppError::DocumentNotFound { id: id.to_string() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn row(document_id: Uuid, job_id: &str) -> ExtractionTaskRow {
        let now = fixed(Utc::now());
        ExtractionTaskRow {
            document_id,
            status: TaskStatus::Running.as_str().to_string(),
            progress: 40,
            job_id: Some(job_id.to_string()),
            retry_count: 1,
            extracted_data: None,
            confidence_score: None,
            error_message: None,
            last_error_at: None,
            process_time_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Primary holds `job-b`, the lagging replica still `job-a`
    fn lagging_pool(id: Uuid) -> Repository {
        let primary = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![row(id, "job-b")]])
            .into_connection();
        let replica = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![row(id, "job-a")]])
            .into_connection();
        Repository::new(DbPool {
            primary,
            replica: Some(replica),
        })
    }

    #[tokio::test]
    async fn test_task_reads_ignore_lagging_replica() {
        let id = Uuid::new_v4();
        let repo = lagging_pool(id);

        let task = repo.find(id).await.unwrap().unwrap();
        assert_eq!(task.job_id.as_deref(), Some("job-b"));
    }

    #[tokio::test]
    async fn test_save_if_job_reports_changed_owner() {
        let updated = |rows_affected| MockExecResult {
            last_insert_id: 0,
            rows_affected,
        };
        let primary = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([updated(1), updated(0)])
            .into_connection();
        let repo = Repository::new(DbPool {
            primary,
            replica: None,
        });

        let task: ExtractionTask = row(Uuid::new_v4(), "job-b").into();
        assert!(repo.save_if_job(&task, Some("job-b")).await.unwrap().is_some());
        assert!(repo.save_if_job(&task, Some("job-a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_scan_reads_primary() {
        let id = Uuid::new_v4();
        let repo = lagging_pool(id);

        let stale = repo.find_stale(Utc::now(), 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].job_id.as_deref(), Some("job-b"));
    }
}
