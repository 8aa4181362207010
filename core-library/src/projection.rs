//! # Local Projection
//!
//! [`LocalLibrary`] is the locally editable view of every backend: the target
//! of `Transaction::apply_locally` and of remote reconciliation.
//!
//! ## Overview
//!
//! - Bundles a [`MetaRepository`] and a [`PlaylistRepository`]
//! - Publishes a [`ProjectionChange`] on a broadcast channel for every write
//!   that actually changed something, so views can refresh
//! - Every operation is idempotent: applying the same edit twice leaves the
//!   same state as applying it once
//!
//! ## Usage
//!
//! ```rust,ignore
//! let library = LocalLibrary::new(pool);
//! let mut changes = library.subscribe();
//!
//! library.add_meta(&song, "rating", "5").await?;
//! assert_eq!(changes.recv().await?, ProjectionChange::EntryMeta(song));
//! ```

use crate::error::Result;
use crate::ids::{EntryId, PlaylistEntryId, PlaylistId};
use crate::models::{LibraryEntry, MetaMap, Playlist, PlaylistEntry};
use crate::repositories::{
    MetaRepository, PlaylistRepository, SqliteMetaRepository, SqlitePlaylistRepository,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_BUFFER_SIZE: usize = 256;

/// What changed in the projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionChange {
    /// Metadata of a library item changed
    EntryMeta(EntryId),
    /// All metadata of a library item was removed
    EntryRemoved(EntryId),
    /// Playlist was created, renamed or its metadata changed
    Playlist(PlaylistId),
    /// Playlist was deleted
    PlaylistRemoved(PlaylistId),
    /// Entries of a playlist were added, removed or reordered
    PlaylistEntries(PlaylistId),
}

/// Locally editable library and playlists.
#[derive(Clone)]
pub struct LocalLibrary {
    meta: Arc<dyn MetaRepository>,
    playlists: Arc<dyn PlaylistRepository>,
    changes: broadcast::Sender<ProjectionChange>,
}

impl LocalLibrary {
    /// Projection backed by the SQLite repositories.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_repositories(
            Arc::new(SqliteMetaRepository::new(pool.clone())),
            Arc::new(SqlitePlaylistRepository::new(pool)),
        )
    }

    pub fn with_repositories(
        meta: Arc<dyn MetaRepository>,
        playlists: Arc<dyn PlaylistRepository>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER_SIZE);
        Self {
            meta,
            playlists,
            changes,
        }
    }

    /// Observe changes to the projection.
    pub fn subscribe(&self) -> broadcast::Receiver<ProjectionChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: ProjectionChange) {
        debug!(change = ?change, "Projection changed");
        // No subscribers is fine
        let _ = self.changes.send(change);
    }

    // ========================================================================
    // Library metadata
    // ========================================================================

    pub async fn add_meta(&self, entry: &EntryId, key: &str, value: &str) -> Result<()> {
        if self.meta.add(entry, key, value).await? {
            self.notify(ProjectionChange::EntryMeta(entry.clone()));
        }
        Ok(())
    }

    pub async fn delete_meta(&self, entry: &EntryId, key: &str, value: &str) -> Result<()> {
        if self.meta.delete(entry, key, value).await? {
            self.notify(ProjectionChange::EntryMeta(entry.clone()));
        }
        Ok(())
    }

    pub async fn edit_meta(
        &self,
        entry: &EntryId,
        key: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<()> {
        self.meta.edit(entry, key, old_value, new_value).await?;
        self.notify(ProjectionChange::EntryMeta(entry.clone()));
        Ok(())
    }

    pub async fn delete_all_meta(&self, entry: &EntryId) -> Result<()> {
        if self.meta.delete_all(entry).await? > 0 {
            self.notify(ProjectionChange::EntryRemoved(entry.clone()));
        }
        Ok(())
    }

    /// Replace an item's metadata wholesale. An empty map removes the item.
    pub async fn replace_meta(&self, entry: &EntryId, meta: &MetaMap) -> Result<()> {
        if meta.is_empty() {
            return self.delete_all_meta(entry).await;
        }
        self.meta.replace(entry, meta).await?;
        self.notify(ProjectionChange::EntryMeta(entry.clone()));
        Ok(())
    }

    pub async fn entry_meta(&self, entry: &EntryId) -> Result<MetaMap> {
        self.meta.get(entry).await
    }

    /// Snapshot of one source's library.
    pub async fn library(&self, source: &str) -> Result<Vec<LibraryEntry>> {
        self.meta.list_source(source).await
    }

    pub async fn count_entries(&self, source: &str) -> Result<i64> {
        self.meta.count_entries(source).await
    }

    // ========================================================================
    // Playlists
    // ========================================================================

    pub async fn add_playlist(&self, id: &PlaylistId, name: &str) -> Result<()> {
        self.playlists.upsert(id, name).await?;
        self.notify(ProjectionChange::Playlist(id.clone()));
        Ok(())
    }

    pub async fn delete_playlist(&self, id: &PlaylistId) -> Result<()> {
        if self.playlists.delete(id).await? {
            self.notify(ProjectionChange::PlaylistRemoved(id.clone()));
        }
        Ok(())
    }

    pub async fn add_playlist_meta(&self, id: &PlaylistId, key: &str, value: &str) -> Result<()> {
        if self.playlists.add_meta(id, key, value).await? {
            self.notify(ProjectionChange::Playlist(id.clone()));
        }
        Ok(())
    }

    pub async fn delete_playlist_meta(
        &self,
        id: &PlaylistId,
        key: &str,
        value: &str,
    ) -> Result<()> {
        if self.playlists.delete_meta(id, key, value).await? {
            self.notify(ProjectionChange::Playlist(id.clone()));
        }
        Ok(())
    }

    pub async fn edit_playlist_meta(
        &self,
        id: &PlaylistId,
        key: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<()> {
        self.playlists.edit_meta(id, key, old_value, new_value).await?;
        self.notify(ProjectionChange::Playlist(id.clone()));
        Ok(())
    }

    pub async fn replace_playlist_meta(&self, id: &PlaylistId, meta: &MetaMap) -> Result<()> {
        self.playlists.replace_meta(id, meta).await?;
        self.notify(ProjectionChange::Playlist(id.clone()));
        Ok(())
    }

    pub async fn add_playlist_entry(
        &self,
        id: &PlaylistId,
        entry: &PlaylistEntry,
        before: Option<&PlaylistEntryId>,
    ) -> Result<()> {
        if self.playlists.add_entry(id, entry, before).await? {
            self.notify(ProjectionChange::PlaylistEntries(id.clone()));
        }
        Ok(())
    }

    pub async fn delete_playlist_entry(
        &self,
        id: &PlaylistId,
        entry_id: &PlaylistEntryId,
    ) -> Result<()> {
        if self.playlists.delete_entry(id, entry_id).await? {
            self.notify(ProjectionChange::PlaylistEntries(id.clone()));
        }
        Ok(())
    }

    pub async fn move_playlist_entry(
        &self,
        id: &PlaylistId,
        entry_id: &PlaylistEntryId,
        before: Option<&PlaylistEntryId>,
    ) -> Result<()> {
        if self.playlists.move_entry(id, entry_id, before).await? {
            self.notify(ProjectionChange::PlaylistEntries(id.clone()));
        }
        Ok(())
    }

    pub async fn reorder_playlist(&self, id: &PlaylistId, order: &[PlaylistEntryId]) -> Result<()> {
        self.playlists.reorder(id, order).await?;
        self.notify(ProjectionChange::PlaylistEntries(id.clone()));
        Ok(())
    }

    pub async fn playlist(&self, id: &PlaylistId) -> Result<Option<Playlist>> {
        self.playlists.get(id).await
    }

    /// Snapshot of one source's playlists.
    pub async fn playlists(&self, source: &str) -> Result<Vec<Playlist>> {
        self.playlists.list_source(source).await
    }
}

impl std::fmt::Debug for LocalLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLibrary")
            .field("observers", &self.changes.receiver_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::error::LibraryError;
    use crate::models::meta_from_pairs;
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        Meta {}

        #[async_trait]
        impl MetaRepository for Meta {
            async fn add(&self, entry: &EntryId, key: &str, value: &str) -> Result<bool>;
            async fn delete(&self, entry: &EntryId, key: &str, value: &str) -> Result<bool>;
            async fn edit(&self, entry: &EntryId, key: &str, old_value: &str, new_value: &str) -> Result<()>;
            async fn delete_all(&self, entry: &EntryId) -> Result<u64>;
            async fn replace(&self, entry: &EntryId, meta: &MetaMap) -> Result<()>;
            async fn get(&self, entry: &EntryId) -> Result<MetaMap>;
            async fn list_source(&self, source: &str) -> Result<Vec<LibraryEntry>>;
            async fn count_entries(&self, source: &str) -> Result<i64>;
        }
    }

    async fn setup_library() -> LocalLibrary {
        LocalLibrary::new(create_test_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_changes_only_on_effect() {
        let library = setup_library().await;
        let mut changes = library.subscribe();
        let song = EntryId::new("git", "a");

        library.add_meta(&song, "genre", "jazz").await.unwrap();
        library.add_meta(&song, "genre", "jazz").await.unwrap();

        assert_eq!(
            changes.recv().await.unwrap(),
            ProjectionChange::EntryMeta(song.clone())
        );
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replace_with_empty_meta_removes_entry() {
        let library = setup_library().await;
        let song = EntryId::new("git", "a");

        library
            .replace_meta(&song, &meta_from_pairs([("title", "A")]))
            .await
            .unwrap();
        assert_eq!(library.count_entries("git").await.unwrap(), 1);

        library.replace_meta(&song, &MetaMap::new()).await.unwrap();
        assert_eq!(library.count_entries("git").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_playlist_roundtrip() {
        let library = setup_library().await;
        let id = PlaylistId::new("local", "favs");
        let song = EntryId::new("git", "a");

        library.add_playlist(&id, "Favourites").await.unwrap();
        let entry = PlaylistEntry::new("pe-1".into(), song.clone());
        library.add_playlist_entry(&id, &entry, None).await.unwrap();
        library.add_playlist_entry(&id, &entry, None).await.unwrap();

        let playlist = library.playlist(&id).await.unwrap().unwrap();
        assert_eq!(playlist.entries.len(), 1);
        assert_eq!(playlist.entries[0].entry, song);

        library.delete_playlist(&id).await.unwrap();
        assert!(library.playlists("local").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repository_errors_propagate() {
        let mut meta = MockMeta::new();
        meta.expect_add().returning(|_, _, _| {
            Err(LibraryError::InvalidInput {
                field: "key".to_string(),
                message: "empty".to_string(),
            })
        });

        let pool = create_test_pool().await.unwrap();
        let library = LocalLibrary::with_repositories(
            Arc::new(meta),
            Arc::new(SqlitePlaylistRepository::new(pool)),
        );

        let result = library.add_meta(&EntryId::new("git", "a"), "", "x").await;
        assert!(matches!(result, Err(LibraryError::InvalidInput { .. })));
    }
}
