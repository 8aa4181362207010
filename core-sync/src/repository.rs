//! # Sync Job Repository
//!
//! Provides database persistence for sync jobs.
//!
//! ## Overview
//!
//! This repository handles CRUD operations for sync jobs, including:
//! - Recording new runs and their phase changes
//! - Querying runs by source or phase
//! - Job history retrieval

use crate::{Result, SyncError, SyncJob, SyncJobId, SyncJobStats, SyncPhase, SyncProgress};
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};

// ============================================================================
// Repository Trait
// ============================================================================

/// Repository trait for sync job persistence
#[async_trait]
pub trait SyncJobRepository: Send + Sync {
    async fn insert(&self, job: &SyncJob) -> Result<()>;

    /// Update an existing sync job
    ///
    /// # Errors
    ///
    /// Returns an error if the job doesn't exist or the database operation fails
    async fn update(&self, job: &SyncJob) -> Result<()>;

    async fn find_by_id(&self, id: &SyncJobId) -> Result<Option<SyncJob>>;

    /// All runs of a source, most recent first
    async fn find_by_source(&self, source: &str) -> Result<Vec<SyncJob>>;

    async fn find_by_phase(&self, phase: SyncPhase) -> Result<Vec<SyncJob>>;

    async fn find_latest_by_source(&self, source: &str) -> Result<Option<SyncJob>>;

    /// Get sync job history for a source (most recent first)
    ///
    /// # Arguments
    ///
    /// * `source` - The source to get history for
    /// * `limit` - Maximum number of jobs to return
    async fn get_history(&self, source: &str, limit: u32) -> Result<Vec<SyncJob>>;

    async fn delete(&self, id: &SyncJobId) -> Result<()>;

    /// Check if a run of the source is recorded as started and unfinished
    async fn has_active_sync(&self, source: &str) -> Result<bool>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of SyncJobRepository
pub struct SqliteSyncJobRepository {
    pool: SqlitePool,
}

impl SqliteSyncJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Database row representation of a sync job
#[derive(Debug, FromRow)]
struct SyncJobRow {
    id: String,
    source: String,
    sync_trigger: String,
    phase: String,
    attempt: i64,
    items_processed: i64,
    items_total: i64,
    entries_added: i64,
    entries_updated: i64,
    entries_deleted: i64,
    playlists_changed: i64,
    transactions_applied: i64,
    transactions_pending: i64,
    status_message: Option<String>,
    error_message: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = SyncError;

    fn try_from(row: SyncJobRow) -> Result<Self> {
        let phase: SyncPhase = row.phase.parse()?;
        let total = (row.items_total > 0).then_some(row.items_total as u64);

        let mut progress = SyncProgress::default();
        progress.update(
            row.items_processed as u64,
            total,
            row.status_message.as_deref().unwrap_or(phase.as_str()),
        );

        Ok(SyncJob {
            id: SyncJobId::from_string(&row.id)?,
            source: row.source,
            trigger: row.sync_trigger.parse()?,
            phase,
            attempt: row.attempt.max(0) as u32,
            progress,
            stats: SyncJobStats {
                entries_added: row.entries_added as u64,
                entries_updated: row.entries_updated as u64,
                entries_deleted: row.entries_deleted as u64,
                playlists_changed: row.playlists_changed as u64,
                transactions_applied: row.transactions_applied as u64,
                transactions_pending: row.transactions_pending as u64,
            },
            status_message: row.status_message,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

const SELECT_JOBS: &str = r#"
    SELECT id, source, sync_trigger, phase, attempt,
           items_processed, items_total,
           entries_added, entries_updated, entries_deleted, playlists_changed,
           transactions_applied, transactions_pending,
           status_message, error_message,
           created_at, started_at, completed_at
    FROM sync_jobs
"#;

fn db_err(e: sqlx::Error) -> SyncError {
    SyncError::Database(e.to_string())
}

#[async_trait]
impl SyncJobRepository for SqliteSyncJobRepository {
    async fn insert(&self, job: &SyncJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, source, sync_trigger, phase, attempt,
                items_processed, items_total,
                entries_added, entries_updated, entries_deleted, playlists_changed,
                transactions_applied, transactions_pending,
                status_message, error_message,
                created_at, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.source)
        .bind(job.trigger.as_str())
        .bind(job.phase.as_str())
        .bind(job.attempt as i64)
        .bind(job.progress.processed as i64)
        .bind(job.progress.total.unwrap_or(0) as i64)
        .bind(job.stats.entries_added as i64)
        .bind(job.stats.entries_updated as i64)
        .bind(job.stats.entries_deleted as i64)
        .bind(job.stats.playlists_changed as i64)
        .bind(job.stats.transactions_applied as i64)
        .bind(job.stats.transactions_pending as i64)
        .bind(&job.status_message)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update(&self, job: &SyncJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET
                phase = ?,
                attempt = ?,
                items_processed = ?,
                items_total = ?,
                entries_added = ?,
                entries_updated = ?,
                entries_deleted = ?,
                playlists_changed = ?,
                transactions_applied = ?,
                transactions_pending = ?,
                status_message = ?,
                error_message = ?,
                started_at = ?,
                completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.phase.as_str())
        .bind(job.attempt as i64)
        .bind(job.progress.processed as i64)
        .bind(job.progress.total.unwrap_or(0) as i64)
        .bind(job.stats.entries_added as i64)
        .bind(job.stats.entries_updated as i64)
        .bind(job.stats.entries_deleted as i64)
        .bind(job.stats.playlists_changed as i64)
        .bind(job.stats.transactions_applied as i64)
        .bind(job.stats.transactions_pending as i64)
        .bind(&job.status_message)
        .bind(&job.error_message)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(SyncError::JobNotFound {
                job_id: job.id.to_string(),
            });
        }

        Ok(())
    }

    async fn find_by_id(&self, id: &SyncJobId) -> Result<Option<SyncJob>> {
        let sql = format!("{} WHERE id = ?", SELECT_JOBS);
        let row = sqlx::query_as::<_, SyncJobRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(SyncJob::try_from).transpose()
    }

    async fn find_by_source(&self, source: &str) -> Result<Vec<SyncJob>> {
        let sql = format!(
            "{} WHERE source = ? ORDER BY created_at DESC, rowid DESC",
            SELECT_JOBS
        );
        let rows = sqlx::query_as::<_, SyncJobRow>(&sql)
            .bind(source)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter()
            .map(SyncJob::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn find_by_phase(&self, phase: SyncPhase) -> Result<Vec<SyncJob>> {
        let sql = format!(
            "{} WHERE phase = ? ORDER BY created_at DESC, rowid DESC",
            SELECT_JOBS
        );
        let rows = sqlx::query_as::<_, SyncJobRow>(&sql)
            .bind(phase.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter()
            .map(SyncJob::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn find_latest_by_source(&self, source: &str) -> Result<Option<SyncJob>> {
        Ok(self.get_history(source, 1).await?.into_iter().next())
    }

    async fn get_history(&self, source: &str, limit: u32) -> Result<Vec<SyncJob>> {
        let sql = format!(
            "{} WHERE source = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
            SELECT_JOBS
        );
        let rows = sqlx::query_as::<_, SyncJobRow>(&sql)
            .bind(source)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter()
            .map(SyncJob::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn delete(&self, id: &SyncJobId) -> Result<()> {
        let result = sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(SyncError::JobNotFound {
                job_id: id.to_string(),
            });
        }

        Ok(())
    }

    async fn has_active_sync(&self, source: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM sync_jobs
            WHERE source = ? AND phase IN ('fetching', 'indexing', 'draining')
            "#,
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(count > 0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncTrigger;
    use core_library::db::create_test_pool;

    async fn setup_repo() -> SqliteSyncJobRepository {
        SqliteSyncJobRepository::new(create_test_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_insert_and_find_by_id() {
        let repo = setup_repo().await;
        let job = SyncJob::new("git", SyncTrigger::RunNow);
        repo.insert(&job).await.unwrap();

        let found = repo.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found.id, job.id);
        assert_eq!(found.source, "git");
        assert_eq!(found.trigger, SyncTrigger::RunNow);
        assert_eq!(found.phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_update_job() {
        let repo = setup_repo().await;
        let job = SyncJob::new("git", SyncTrigger::Scheduled);
        repo.insert(&job).await.unwrap();

        let mut job = job.begin_fetch().unwrap();
        job.update_progress(5, Some(10), "Fetching").unwrap();
        repo.update(&job).await.unwrap();
        assert!(repo.has_active_sync("git").await.unwrap());

        let mut job = job.begin_draining().unwrap();
        job.stats.transactions_applied = 3;
        job.stats.entries_added = 7;
        let job = job.succeed("3/3 applied").unwrap();
        repo.update(&job).await.unwrap();

        let found = repo.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found.phase, SyncPhase::Success);
        assert_eq!(found.stats.transactions_applied, 3);
        assert_eq!(found.stats.entries_added, 7);
        assert_eq!(found.status_message.as_deref(), Some("3/3 applied"));
        assert!(!repo.has_active_sync("git").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_missing_job() {
        let repo = setup_repo().await;
        let job = SyncJob::new("git", SyncTrigger::RunNow);
        assert!(matches!(
            repo.update(&job).await,
            Err(SyncError::JobNotFound { .. })
        ));
        assert!(repo.delete(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_history_most_recent_first() {
        let repo = setup_repo().await;
        let first = SyncJob::new("git", SyncTrigger::RunNow);
        let second = first.retry_of();
        let third = second.retry_of();
        for job in [&first, &second, &third] {
            repo.insert(job).await.unwrap();
        }
        repo.insert(&SyncJob::new("local", SyncTrigger::RunNow))
            .await
            .unwrap();

        let history = repo.get_history("git", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, third.id);
        assert_eq!(history[1].id, second.id);

        let latest = repo.find_latest_by_source("git").await.unwrap().unwrap();
        assert_eq!(latest.attempt, 2);
        assert_eq!(repo.find_by_source("git").await.unwrap().len(), 3);
        assert_eq!(repo.find_by_phase(SyncPhase::Idle).await.unwrap().len(), 4);

        repo.delete(&first.id).await.unwrap();
        assert!(repo.find_by_id(&first.id).await.unwrap().is_none());
    }
}
