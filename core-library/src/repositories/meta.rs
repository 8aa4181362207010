//! Entry metadata repository trait and implementation

use crate::error::Result;
use crate::ids::EntryId;
use crate::models::{group_meta_rows, LibraryEntry, MetaMap, MetaRow};
use async_trait::async_trait;
use sqlx::{query, query_as, SqlitePool};

/// Metadata rows of library items.
///
/// Rows are set-valued: inserting an existing `(entry, key, value)` is a no-op.
#[async_trait]
pub trait MetaRepository: Send + Sync {
    /// Insert one value.
    ///
    /// # Returns
    /// - `Ok(true)` if a row was written
    /// - `Ok(false)` if the value was already present
    async fn add(&self, entry: &EntryId, key: &str, value: &str) -> Result<bool>;

    /// Delete one value. Returns whether a row was removed.
    async fn delete(&self, entry: &EntryId, key: &str, value: &str) -> Result<bool>;

    /// Replace `old_value` with `new_value` under `key` atomically.
    async fn edit(&self, entry: &EntryId, key: &str, old_value: &str, new_value: &str)
        -> Result<()>;

    /// Delete every value of the entry. Returns the number of rows removed.
    async fn delete_all(&self, entry: &EntryId) -> Result<u64>;

    /// Replace the entry's whole metadata set atomically.
    async fn replace(&self, entry: &EntryId, meta: &MetaMap) -> Result<()>;

    /// All metadata of one entry (empty when unknown).
    async fn get(&self, entry: &EntryId) -> Result<MetaMap>;

    /// Every entry of a source, ordered by id.
    async fn list_source(&self, source: &str) -> Result<Vec<LibraryEntry>>;

    /// Number of distinct entries of a source.
    async fn count_entries(&self, source: &str) -> Result<i64>;
}

/// SQLite implementation of MetaRepository
pub struct SqliteMetaRepository {
    pool: SqlitePool,
}

impl SqliteMetaRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetaRepository for SqliteMetaRepository {
    async fn add(&self, entry: &EntryId, key: &str, value: &str) -> Result<bool> {
        let result = query(
            "INSERT OR IGNORE INTO entry_meta (src, entry_id, key, value) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.source)
        .bind(&entry.local_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, entry: &EntryId, key: &str, value: &str) -> Result<bool> {
        let result = query(
            "DELETE FROM entry_meta WHERE src = ? AND entry_id = ? AND key = ? AND value = ?",
        )
        .bind(&entry.source)
        .bind(&entry.local_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn edit(
        &self,
        entry: &EntryId,
        key: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        query("DELETE FROM entry_meta WHERE src = ? AND entry_id = ? AND key = ? AND value = ?")
            .bind(&entry.source)
            .bind(&entry.local_id)
            .bind(key)
            .bind(old_value)
            .execute(&mut *tx)
            .await?;

        query("INSERT OR IGNORE INTO entry_meta (src, entry_id, key, value) VALUES (?, ?, ?, ?)")
            .bind(&entry.source)
            .bind(&entry.local_id)
            .bind(key)
            .bind(new_value)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_all(&self, entry: &EntryId) -> Result<u64> {
        let result = query("DELETE FROM entry_meta WHERE src = ? AND entry_id = ?")
            .bind(&entry.source)
            .bind(&entry.local_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn replace(&self, entry: &EntryId, meta: &MetaMap) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        query("DELETE FROM entry_meta WHERE src = ? AND entry_id = ?")
            .bind(&entry.source)
            .bind(&entry.local_id)
            .execute(&mut *tx)
            .await?;

        for (key, values) in meta {
            for value in values {
                query("INSERT INTO entry_meta (src, entry_id, key, value) VALUES (?, ?, ?, ?)")
                    .bind(&entry.source)
                    .bind(&entry.local_id)
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, entry: &EntryId) -> Result<MetaMap> {
        let rows = query_as::<_, (String, String)>(
            "SELECT key, value FROM entry_meta WHERE src = ? AND entry_id = ? ORDER BY key, value",
        )
        .bind(&entry.source)
        .bind(&entry.local_id)
        .fetch_all(&self.pool)
        .await?;

        let mut meta = MetaMap::new();
        for (key, value) in rows {
            meta.entry(key).or_default().insert(value);
        }
        Ok(meta)
    }

    async fn list_source(&self, source: &str) -> Result<Vec<LibraryEntry>> {
        let rows = query_as::<_, MetaRow>(
            r#"
            SELECT src, entry_id, key, value
            FROM entry_meta
            WHERE src = ?
            ORDER BY entry_id, key, value
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        Ok(group_meta_rows(rows))
    }

    async fn count_entries(&self, source: &str) -> Result<i64> {
        let count: i64 =
            query_as("SELECT COUNT(DISTINCT entry_id) as count FROM entry_meta WHERE src = ?")
                .bind(source)
                .fetch_one(&self.pool)
                .await
                .map(|row: (i64,)| row.0)?;

        Ok(count)
    }
}
