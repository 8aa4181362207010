//! Playlist repository trait and implementation

use crate::error::{LibraryError, Result};
use crate::ids::{PlaylistEntryId, PlaylistId};
use crate::models::{MetaMap, Playlist, PlaylistEntry, PlaylistEntryRow, PlaylistRow};
use async_trait::async_trait;
use sqlx::{query, query_as, SqliteConnection, SqlitePool};
use std::collections::HashSet;

/// Playlist repository interface for data access operations
///
/// Entry positions are kept contiguous (`0..len`) by every mutating call.
#[async_trait]
pub trait PlaylistRepository: Send + Sync {
    /// Create a playlist, or rename it when it already exists.
    async fn upsert(&self, id: &PlaylistId, name: &str) -> Result<()>;

    /// Delete a playlist with its metadata and entries
    ///
    /// # Returns
    /// - `Ok(true)` if playlist was deleted
    /// - `Ok(false)` if playlist was not found
    async fn delete(&self, id: &PlaylistId) -> Result<bool>;

    /// Find a playlist with metadata and ordered entries
    async fn get(&self, id: &PlaylistId) -> Result<Option<Playlist>>;

    /// All playlists of a source, ordered by id
    async fn list_source(&self, source: &str) -> Result<Vec<Playlist>>;

    /// Insert one metadata value. Returns whether a row was written.
    ///
    /// # Errors
    /// `LibraryError::NotFound` if the playlist does not exist
    async fn add_meta(&self, id: &PlaylistId, key: &str, value: &str) -> Result<bool>;

    /// Delete one metadata value. Returns whether a row was removed.
    async fn delete_meta(&self, id: &PlaylistId, key: &str, value: &str) -> Result<bool>;

    /// Replace `old_value` with `new_value` under `key` atomically.
    async fn edit_meta(
        &self,
        id: &PlaylistId,
        key: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<()>;

    /// Replace the whole metadata set atomically.
    async fn replace_meta(&self, id: &PlaylistId, meta: &MetaMap) -> Result<()>;

    /// Insert an entry before `before`, or at the end when `before` is
    /// `None` or no longer present.
    ///
    /// # Returns
    /// - `Ok(true)` if the entry was inserted
    /// - `Ok(false)` if an entry with the same id already exists
    async fn add_entry(
        &self,
        id: &PlaylistId,
        entry: &PlaylistEntry,
        before: Option<&PlaylistEntryId>,
    ) -> Result<bool>;

    /// Remove an entry. Returns whether it existed.
    async fn delete_entry(&self, id: &PlaylistId, entry_id: &PlaylistEntryId) -> Result<bool>;

    /// Move an entry before `before`, or to the end when `before` is `None`
    /// or no longer present. Returns whether the entry exists.
    async fn move_entry(
        &self,
        id: &PlaylistId,
        entry_id: &PlaylistEntryId,
        before: Option<&PlaylistEntryId>,
    ) -> Result<bool>;

    /// Rewrite positions to follow `order`. Entries missing from `order`
    /// keep their relative order after the listed ones.
    async fn reorder(&self, id: &PlaylistId, order: &[PlaylistEntryId]) -> Result<()>;

    /// Entries of a playlist in order
    async fn entries(&self, id: &PlaylistId) -> Result<Vec<PlaylistEntry>>;
}

/// SQLite implementation of PlaylistRepository
pub struct SqlitePlaylistRepository {
    pool: SqlitePool,
}

impl SqlitePlaylistRepository {
    /// Create a new SqlitePlaylistRepository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(&self, row: PlaylistRow) -> Result<Playlist> {
        let id = PlaylistId::new(row.src, row.playlist_id);
        let meta = load_meta(&self.pool, &id).await?;
        let entries = self.entries(&id).await?;
        Ok(Playlist {
            id,
            name: row.name,
            meta,
            entries,
        })
    }
}

// ============================================================================
// Connection helpers (usable inside a transaction)
// ============================================================================

async fn ensure_exists(conn: &mut SqliteConnection, id: &PlaylistId) -> Result<()> {
    let found = query_as::<_, (i64,)>("SELECT 1 FROM playlists WHERE src = ? AND playlist_id = ?")
        .bind(&id.source)
        .bind(&id.local_id)
        .fetch_optional(&mut *conn)
        .await?;

    match found {
        Some(_) => Ok(()),
        None => Err(LibraryError::NotFound {
            entity_type: "Playlist".to_string(),
            id: id.to_string(),
        }),
    }
}

async fn entry_position(
    conn: &mut SqliteConnection,
    id: &PlaylistId,
    entry_id: &PlaylistEntryId,
) -> Result<Option<i64>> {
    let position = query_as::<_, (i64,)>(
        r#"
        SELECT position FROM playlist_entries
        WHERE src = ? AND playlist_id = ? AND playlist_entry_id = ?
        "#,
    )
    .bind(&id.source)
    .bind(&id.local_id)
    .bind(entry_id.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(position.map(|row| row.0))
}

async fn entry_count(conn: &mut SqliteConnection, id: &PlaylistId) -> Result<i64> {
    let count = query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM playlist_entries WHERE src = ? AND playlist_id = ?",
    )
    .bind(&id.source)
    .bind(&id.local_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count.0)
}

/// Shift every entry at or after `from` by `delta`, skipping `except`.
async fn shift_positions(
    conn: &mut SqliteConnection,
    id: &PlaylistId,
    from: i64,
    delta: i64,
    except: Option<&PlaylistEntryId>,
) -> Result<()> {
    query(
        r#"
        UPDATE playlist_entries SET position = position + ?
        WHERE src = ? AND playlist_id = ? AND position >= ? AND playlist_entry_id != ?
        "#,
    )
    .bind(delta)
    .bind(&id.source)
    .bind(&id.local_id)
    .bind(from)
    .bind(except.map(PlaylistEntryId::as_str).unwrap_or(""))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn set_position(
    conn: &mut SqliteConnection,
    id: &PlaylistId,
    entry_id: &PlaylistEntryId,
    position: i64,
) -> Result<()> {
    query(
        r#"
        UPDATE playlist_entries SET position = ?
        WHERE src = ? AND playlist_id = ? AND playlist_entry_id = ?
        "#,
    )
    .bind(position)
    .bind(&id.source)
    .bind(&id.local_id)
    .bind(entry_id.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn touch(conn: &mut SqliteConnection, id: &PlaylistId) -> Result<()> {
    query("UPDATE playlists SET updated_at = ? WHERE src = ? AND playlist_id = ?")
        .bind(chrono::Utc::now().timestamp())
        .bind(&id.source)
        .bind(&id.local_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn load_meta(pool: &SqlitePool, id: &PlaylistId) -> Result<MetaMap> {
    let rows = query_as::<_, (String, String)>(
        r#"
        SELECT key, value FROM playlist_meta
        WHERE src = ? AND playlist_id = ?
        ORDER BY key, value
        "#,
    )
    .bind(&id.source)
    .bind(&id.local_id)
    .fetch_all(pool)
    .await?;

    let mut meta = MetaMap::new();
    for (key, value) in rows {
        meta.entry(key).or_default().insert(value);
    }
    Ok(meta)
}

#[async_trait]
impl PlaylistRepository for SqlitePlaylistRepository {
    async fn upsert(&self, id: &PlaylistId, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(LibraryError::InvalidInput {
                field: "name".to_string(),
                message: "Playlist name cannot be empty".to_string(),
            });
        }

        let now = chrono::Utc::now().timestamp();
        query(
            r#"
            INSERT INTO playlists (src, playlist_id, name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (src, playlist_id) DO UPDATE SET
                name = excluded.name,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id.source)
        .bind(&id.local_id)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &PlaylistId) -> Result<bool> {
        // Meta and entries go with it through ON DELETE CASCADE
        let result = query("DELETE FROM playlists WHERE src = ? AND playlist_id = ?")
            .bind(&id.source)
            .bind(&id.local_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &PlaylistId) -> Result<Option<Playlist>> {
        let row = query_as::<_, PlaylistRow>(
            "SELECT src, playlist_id, name FROM playlists WHERE src = ? AND playlist_id = ?",
        )
        .bind(&id.source)
        .bind(&id.local_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_source(&self, source: &str) -> Result<Vec<Playlist>> {
        let rows = query_as::<_, PlaylistRow>(
            "SELECT src, playlist_id, name FROM playlists WHERE src = ? ORDER BY playlist_id",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        let mut playlists = Vec::with_capacity(rows.len());
        for row in rows {
            playlists.push(self.load(row).await?);
        }
        Ok(playlists)
    }

    async fn add_meta(&self, id: &PlaylistId, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        ensure_exists(&mut conn, id).await?;

        let result = query(
            "INSERT OR IGNORE INTO playlist_meta (src, playlist_id, key, value) VALUES (?, ?, ?, ?)",
        )
        .bind(&id.source)
        .bind(&id.local_id)
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_meta(&self, id: &PlaylistId, key: &str, value: &str) -> Result<bool> {
        let result = query(
            "DELETE FROM playlist_meta WHERE src = ? AND playlist_id = ? AND key = ? AND value = ?",
        )
        .bind(&id.source)
        .bind(&id.local_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn edit_meta(
        &self,
        id: &PlaylistId,
        key: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_exists(&mut tx, id).await?;

        query("DELETE FROM playlist_meta WHERE src = ? AND playlist_id = ? AND key = ? AND value = ?")
            .bind(&id.source)
            .bind(&id.local_id)
            .bind(key)
            .bind(old_value)
            .execute(&mut *tx)
            .await?;

        query(
            "INSERT OR IGNORE INTO playlist_meta (src, playlist_id, key, value) VALUES (?, ?, ?, ?)",
        )
        .bind(&id.source)
        .bind(&id.local_id)
        .bind(key)
        .bind(new_value)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn replace_meta(&self, id: &PlaylistId, meta: &MetaMap) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_exists(&mut tx, id).await?;

        query("DELETE FROM playlist_meta WHERE src = ? AND playlist_id = ?")
            .bind(&id.source)
            .bind(&id.local_id)
            .execute(&mut *tx)
            .await?;

        for (key, values) in meta {
            for value in values {
                query("INSERT INTO playlist_meta (src, playlist_id, key, value) VALUES (?, ?, ?, ?)")
                    .bind(&id.source)
                    .bind(&id.local_id)
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn add_entry(
        &self,
        id: &PlaylistId,
        entry: &PlaylistEntry,
        before: Option<&PlaylistEntryId>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        ensure_exists(&mut tx, id).await?;

        if entry_position(&mut tx, id, &entry.id).await?.is_some() {
            return Ok(false);
        }

        let count = entry_count(&mut tx, id).await?;
        let position = match before {
            Some(before) => entry_position(&mut tx, id, before).await?.unwrap_or(count),
            None => count,
        };

        shift_positions(&mut tx, id, position, 1, None).await?;

        query(
            r#"
            INSERT INTO playlist_entries (
                src, playlist_id, playlist_entry_id, entry_src, entry_id, position, meta_snapshot
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id.source)
        .bind(&id.local_id)
        .bind(entry.id.as_str())
        .bind(&entry.entry.source)
        .bind(&entry.entry.local_id)
        .bind(position)
        .bind(serde_json::to_string(&entry.meta_snapshot)?)
        .execute(&mut *tx)
        .await?;

        touch(&mut tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn delete_entry(&self, id: &PlaylistId, entry_id: &PlaylistEntryId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(position) = entry_position(&mut tx, id, entry_id).await? else {
            return Ok(false);
        };

        query(
            "DELETE FROM playlist_entries WHERE src = ? AND playlist_id = ? AND playlist_entry_id = ?",
        )
        .bind(&id.source)
        .bind(&id.local_id)
        .bind(entry_id.as_str())
        .execute(&mut *tx)
        .await?;

        shift_positions(&mut tx, id, position + 1, -1, None).await?;
        touch(&mut tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn move_entry(
        &self,
        id: &PlaylistId,
        entry_id: &PlaylistEntryId,
        before: Option<&PlaylistEntryId>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(current) = entry_position(&mut tx, id, entry_id).await? else {
            return Ok(false);
        };

        // Close the gap; the moved entry keeps a stale position until set below
        shift_positions(&mut tx, id, current + 1, -1, Some(entry_id)).await?;
        let last = entry_count(&mut tx, id).await? - 1;

        let target = match before.filter(|before| *before != entry_id) {
            Some(before) => entry_position(&mut tx, id, before).await?,
            None => None,
        };

        match target {
            Some(position) => {
                shift_positions(&mut tx, id, position, 1, Some(entry_id)).await?;
                set_position(&mut tx, id, entry_id, position).await?;
            }
            None => set_position(&mut tx, id, entry_id, last).await?,
        }

        touch(&mut tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn reorder(&self, id: &PlaylistId, order: &[PlaylistEntryId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current = query_as::<_, (String,)>(
            r#"
            SELECT playlist_entry_id FROM playlist_entries
            WHERE src = ? AND playlist_id = ?
            ORDER BY position
            "#,
        )
        .bind(&id.source)
        .bind(&id.local_id)
        .fetch_all(&mut *tx)
        .await?;

        let existing: HashSet<&str> = current.iter().map(|(entry_id,)| entry_id.as_str()).collect();
        let listed: HashSet<&str> = order.iter().map(PlaylistEntryId::as_str).collect();

        let final_order = order
            .iter()
            .map(PlaylistEntryId::as_str)
            .filter(|entry_id| existing.contains(entry_id))
            .chain(
                current
                    .iter()
                    .map(|(entry_id,)| entry_id.as_str())
                    .filter(|entry_id| !listed.contains(entry_id)),
            );

        for (position, entry_id) in final_order.enumerate() {
            set_position(&mut tx, id, &PlaylistEntryId::from(entry_id), position as i64).await?;
        }

        touch(&mut tx, id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn entries(&self, id: &PlaylistId) -> Result<Vec<PlaylistEntry>> {
        let rows = query_as::<_, PlaylistEntryRow>(
            r#"
            SELECT playlist_entry_id, entry_src, entry_id, meta_snapshot
            FROM playlist_entries
            WHERE src = ? AND playlist_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(&id.source)
        .bind(&id.local_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PlaylistEntryRow::into_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::ids::EntryId;

    async fn setup_repo() -> (SqlitePlaylistRepository, PlaylistId) {
        let repo = SqlitePlaylistRepository::new(create_test_pool().await.unwrap());
        let id = PlaylistId::new("git", "road-trip");
        repo.upsert(&id, "Road Trip").await.unwrap();
        (repo, id)
    }

    fn entry(id: &str) -> PlaylistEntry {
        PlaylistEntry::new(id.into(), EntryId::new("git", format!("{}.flac", id)))
    }

    async fn order(repo: &SqlitePlaylistRepository, id: &PlaylistId) -> Vec<String> {
        repo.entries(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id.to_string())
            .collect()
    }

    async fn fill(repo: &SqlitePlaylistRepository, id: &PlaylistId, ids: &[&str]) {
        for entry_id in ids {
            repo.add_entry(id, &entry(entry_id), None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_upsert_renames() {
        let (repo, id) = setup_repo().await;
        repo.upsert(&id, "Road Trip 2").await.unwrap();

        let playlist = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(playlist.name, "Road Trip 2");
        assert_eq!(repo.list_source("git").await.unwrap().len(), 1);
        assert!(repo.upsert(&id, "").await.is_err());
    }

    #[tokio::test]
    async fn test_add_entry_positions() {
        let (repo, id) = setup_repo().await;
        fill(&repo, &id, &["a", "c"]).await;

        assert!(repo.add_entry(&id, &entry("b"), Some(&"c".into())).await.unwrap());
        assert_eq!(order(&repo, &id).await, vec!["a", "b", "c"]);

        // Same playlist entry id again is a no-op
        assert!(!repo.add_entry(&id, &entry("b"), None).await.unwrap());
        // Missing anchor appends
        repo.add_entry(&id, &entry("d"), Some(&"zz".into())).await.unwrap();
        assert_eq!(order(&repo, &id).await, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_add_entry_to_missing_playlist() {
        let (repo, _) = setup_repo().await;
        let missing = PlaylistId::new("git", "missing");
        let err = repo.add_entry(&missing, &entry("a"), None).await.unwrap_err();
        assert!(matches!(err, LibraryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_move_entry() {
        let (repo, id) = setup_repo().await;
        fill(&repo, &id, &["a", "b", "c", "d"]).await;

        assert!(repo.move_entry(&id, &"a".into(), None).await.unwrap());
        assert_eq!(order(&repo, &id).await, vec!["b", "c", "d", "a"]);

        repo.move_entry(&id, &"d".into(), Some(&"b".into())).await.unwrap();
        assert_eq!(order(&repo, &id).await, vec!["d", "b", "c", "a"]);

        repo.move_entry(&id, &"b".into(), Some(&"a".into())).await.unwrap();
        assert_eq!(order(&repo, &id).await, vec!["d", "c", "b", "a"]);

        // Vanished anchor moves to the end
        repo.move_entry(&id, &"d".into(), Some(&"gone".into())).await.unwrap();
        assert_eq!(order(&repo, &id).await, vec!["c", "b", "a", "d"]);

        assert!(!repo.move_entry(&id, &"gone".into(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_entry_closes_gap() {
        let (repo, id) = setup_repo().await;
        fill(&repo, &id, &["a", "b", "c"]).await;

        assert!(repo.delete_entry(&id, &"b".into()).await.unwrap());
        assert!(!repo.delete_entry(&id, &"b".into()).await.unwrap());

        repo.add_entry(&id, &entry("x"), Some(&"c".into())).await.unwrap();
        assert_eq!(order(&repo, &id).await, vec!["a", "x", "c"]);
    }

    #[tokio::test]
    async fn test_reorder() {
        let (repo, id) = setup_repo().await;
        fill(&repo, &id, &["a", "b", "c"]).await;

        repo.reorder(&id, &["c".into(), "ghost".into(), "a".into()])
            .await
            .unwrap();
        assert_eq!(order(&repo, &id).await, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_meta_and_cascade_delete() {
        let (repo, id) = setup_repo().await;
        fill(&repo, &id, &["a"]).await;

        assert!(repo.add_meta(&id, "comment", "summer").await.unwrap());
        assert!(!repo.add_meta(&id, "comment", "summer").await.unwrap());
        repo.edit_meta(&id, "comment", "summer", "winter").await.unwrap();

        let playlist = repo.get(&id).await.unwrap().unwrap();
        assert!(playlist.meta["comment"].contains("winter"));
        assert!(!playlist.meta["comment"].contains("summer"));

        assert!(repo.delete(&id).await.unwrap());
        assert!(repo.get(&id).await.unwrap().is_none());
        assert!(repo.entries(&id).await.unwrap().is_empty());
        assert!(!repo.delete(&id).await.unwrap());
    }
}
