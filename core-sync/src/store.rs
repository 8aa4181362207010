//! # Transaction Store
//!
//! Durable queue of pending edits.
//!
//! ## Overview
//!
//! - One queue per `(source, group)`, ordered by creation time then row id
//! - Rows survive restarts; a transaction only leaves the store when its
//!   backend accepted it or the user discarded it
//! - Rows whose payload cannot be interpreted load as unknown edits and are
//!   kept untouched

use crate::error::{Result, SyncError};
use crate::transaction::{Transaction, TransactionGroup, TransactionOp};
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};

// ============================================================================
// Store Trait
// ============================================================================

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persist a new transaction and return it with its assigned id.
    async fn append(&self, transaction: Transaction) -> Result<Transaction>;

    /// Pending transactions, oldest first. `None` filters are wildcards.
    async fn list(
        &self,
        source: Option<&str>,
        group: Option<TransactionGroup>,
    ) -> Result<Vec<Transaction>>;

    async fn get(&self, id: i64) -> Result<Option<Transaction>>;

    /// Returns whether the row existed.
    async fn remove(&self, id: i64) -> Result<bool>;

    /// Record a failed backend attempt: bump the error count and keep the
    /// message. Returns the updated transaction.
    ///
    /// # Errors
    ///
    /// `SyncError::TransactionNotFound` if the row is gone
    async fn set_error(&self, id: i64, message: &str) -> Result<Transaction>;

    /// Reset error bookkeeping so the transaction is retried.
    async fn clear_error(&self, id: i64) -> Result<Transaction>;

    /// Flag every transaction of a queue as (not) reflected in the
    /// projection. Returns the number of rows touched.
    async fn mark_applied_locally(
        &self,
        source: &str,
        group: TransactionGroup,
        applied: bool,
    ) -> Result<u64>;

    async fn count(&self, source: Option<&str>) -> Result<i64>;

    /// Sources with at least one pending transaction, sorted.
    async fn sources(&self) -> Result<Vec<String>>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteTransactionStore {
    pool: SqlitePool,
}

impl SqliteTransactionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: i64,
    src: String,
    kind: String,
    args: String,
    created_at: i64,
    error_count: i64,
    error_message: Option<String>,
    applied_locally: bool,
}

impl From<TransactionRow> for Transaction {
    fn from(row: TransactionRow) -> Self {
        let op = TransactionOp::from_args_text(&row.kind, &row.args);
        if let TransactionOp::Unknown { kind, .. } = &op {
            warn!(id = row.id, kind = %kind, "Stored transaction cannot be interpreted");
        }

        Transaction {
            id: row.id,
            source: row.src,
            created_at: row.created_at,
            error_count: row.error_count.max(0) as u32,
            error_message: row.error_message,
            applied_locally: row.applied_locally,
            op,
        }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, src, kind, args, created_at, error_count, error_message, applied_locally
    FROM transactions
"#;

fn db_err(e: sqlx::Error) -> SyncError {
    SyncError::Database(e.to_string())
}

#[async_trait]
impl TransactionStore for SqliteTransactionStore {
    async fn append(&self, mut transaction: Transaction) -> Result<Transaction> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO transactions (
                src, grp, kind, args, created_at,
                error_count, error_message, applied_locally
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&transaction.source)
        .bind(transaction.group().as_str())
        .bind(transaction.op.kind_str())
        .bind(transaction.op.to_args_text())
        .bind(transaction.created_at)
        .bind(transaction.error_count as i64)
        .bind(&transaction.error_message)
        .bind(transaction.applied_locally)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        transaction.id = id;
        debug!(id, source = %transaction.source, kind = %transaction.op.kind_str(), "Transaction queued");
        Ok(transaction)
    }

    async fn list(
        &self,
        source: Option<&str>,
        group: Option<TransactionGroup>,
    ) -> Result<Vec<Transaction>> {
        let group = group.map(|g| g.as_str());
        let sql = format!(
            "{} WHERE (? IS NULL OR src = ?) AND (? IS NULL OR grp = ?) ORDER BY created_at, id",
            SELECT_COLUMNS
        );

        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(source)
            .bind(source)
            .bind(group)
            .bind(group)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(Transaction::from).collect())
    }

    async fn get(&self, id: i64) -> Result<Option<Transaction>> {
        let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(Transaction::from))
    }

    async fn remove(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transactions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_error(&self, id: i64, message: &str) -> Result<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE transactions
            SET error_count = error_count + 1, error_message = ?
            WHERE id = ?
            RETURNING id, src, kind, args, created_at, error_count, error_message, applied_locally
            "#,
        )
        .bind(message)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Transaction::from)
            .ok_or(SyncError::TransactionNotFound { id })
    }

    async fn clear_error(&self, id: i64) -> Result<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE transactions
            SET error_count = 0, error_message = NULL
            WHERE id = ?
            RETURNING id, src, kind, args, created_at, error_count, error_message, applied_locally
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Transaction::from)
            .ok_or(SyncError::TransactionNotFound { id })
    }

    async fn mark_applied_locally(
        &self,
        source: &str,
        group: TransactionGroup,
        applied: bool,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE transactions SET applied_locally = ? WHERE src = ? AND grp = ?",
        )
        .bind(applied)
        .bind(source)
        .bind(group.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn count(&self, source: Option<&str>) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM transactions WHERE (? IS NULL OR src = ?)",
        )
        .bind(source)
        .bind(source)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn sources(&self) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>("SELECT DISTINCT src FROM transactions ORDER BY src")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core_library::db::create_test_pool;
    use core_library::{EntryId, PlaylistId};

    async fn setup_store() -> SqliteTransactionStore {
        SqliteTransactionStore::new(create_test_pool().await.unwrap())
    }

    fn song(id: &str) -> EntryId {
        EntryId::new("git", id)
    }

    #[tokio::test]
    async fn test_append_assigns_ids() {
        let store = setup_store().await;

        let first = store
            .append(Transaction::meta_add(song("a"), "genre", "jazz"))
            .await
            .unwrap();
        let second = store
            .append(Transaction::meta_add(song("b"), "genre", "rock"))
            .await
            .unwrap();

        assert!(first.is_persisted());
        assert!(second.id > first.id);
        assert_eq!(store.get(first.id).await.unwrap(), Some(first));
        assert_eq!(store.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_list_orders_by_creation_then_id() {
        let store = setup_store().await;
        let late = store
            .append(Transaction::meta_add(song("late"), "k", "v").with_created_at(2_000))
            .await
            .unwrap();
        let early = store
            .append(Transaction::meta_add(song("early"), "k", "v").with_created_at(1_000))
            .await
            .unwrap();
        let tie = store
            .append(Transaction::meta_add(song("tie"), "k", "v").with_created_at(2_000))
            .await
            .unwrap();
        let playlist = store
            .append(Transaction::playlist_add(PlaylistId::new("git", "p"), "P").with_created_at(1_500))
            .await
            .unwrap();
        store
            .append(Transaction::meta_add(EntryId::new("local", "x"), "k", "v"))
            .await
            .unwrap();

        let ids: Vec<i64> = store
            .list(Some("git"), None)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![early.id, playlist.id, late.id, tie.id]);

        let library = store
            .list(Some("git"), Some(TransactionGroup::Library))
            .await
            .unwrap();
        assert_eq!(library.len(), 3);
        assert_eq!(store.list(None, None).await.unwrap().len(), 5);
        assert_eq!(store.sources().await.unwrap(), vec!["git", "local"]);
    }

    #[tokio::test]
    async fn test_error_bookkeeping() {
        let store = setup_store().await;
        let tx = store
            .append(Transaction::meta_add(song("a"), "genre", "jazz"))
            .await
            .unwrap();

        store.set_error(tx.id, "offline").await.unwrap();
        let failed = store.set_error(tx.id, "rejected").await.unwrap();
        assert_eq!(failed.error_count, 2);
        assert_eq!(failed.error_message.as_deref(), Some("rejected"));

        let cleared = store.clear_error(tx.id).await.unwrap();
        assert_eq!(cleared.error_count, 0);
        assert!(cleared.error_message.is_none());

        assert!(store.remove(tx.id).await.unwrap());
        assert!(!store.remove(tx.id).await.unwrap());
        assert!(matches!(
            store.set_error(tx.id, "gone").await,
            Err(SyncError::TransactionNotFound { id }) if id == tx.id
        ));
    }

    #[tokio::test]
    async fn test_mark_applied_locally_per_queue() {
        let store = setup_store().await;
        store
            .append(Transaction::meta_add(song("a"), "k", "v"))
            .await
            .unwrap();
        store
            .append(Transaction::playlist_add(PlaylistId::new("git", "p"), "P"))
            .await
            .unwrap();

        let touched = store
            .mark_applied_locally("git", TransactionGroup::Library, true)
            .await
            .unwrap();
        assert_eq!(touched, 1);

        let all = store.list(Some("git"), None).await.unwrap();
        assert!(all[0].applied_locally);
        assert!(!all[1].applied_locally);
    }

    #[tokio::test]
    async fn test_uninterpretable_rows_survive() {
        let store = setup_store().await;
        sqlx::query(
            "INSERT INTO transactions (src, grp, kind, args, created_at) VALUES ('git', 'library', 'META_SPLIT', '{broken', 1)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let listed = store.list(Some("git"), None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].op,
            TransactionOp::Unknown {
                kind: "META_SPLIT".to_string(),
                raw_args: "{broken".to_string(),
            }
        );
    }
}
