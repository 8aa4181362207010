//! # Backend Adapters
//!
//! A backend owns the authoritative copy of one source's library and
//! playlists. The sync engine talks to it through [`BackendClient`] and pushes
//! edits through a [`Batch`].
//!
//! ## Batch contract
//!
//! - A batch is opened with [`BackendClient::start_batch`], receives staged
//!   edits and is finished by [`Batch::commit`], which consumes it
//! - Staging is cheap and local; remote effects only happen on commit
//! - A staging method the backend cannot express returns
//!   [`BatchError::Unsupported`], which is terminal for that transaction
//! - Dropping a batch without committing discards everything staged
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = BackendRegistry::new();
//! registry.register(Arc::new(LocalBackend::new("local"))).await;
//!
//! let backend = registry.get("local").await.unwrap();
//! let mut batch = backend.start_batch().await?;
//! batch.add_meta(&song, "rating", "5").await?;
//! batch.commit().await?;
//! ```

use crate::error::{BackendError, BatchError};
use crate::transaction::TransactionKind;
use async_trait::async_trait;
use bytes::Bytes;
use core_library::{EntryId, LibraryEntry, Playlist, PlaylistEntry, PlaylistEntryId, PlaylistId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Where the audio of a library item can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    Url(String),
    File(PathBuf),
    Bytes(Bytes),
}

fn unsupported(what: &str) -> BatchError {
    BatchError::Unsupported(what.to_string())
}

// ============================================================================
// Batch
// ============================================================================

/// Staged set of edits for one backend.
///
/// Every staging method defaults to [`BatchError::Unsupported`] so a backend
/// only implements the edits it can express.
#[async_trait]
pub trait Batch: Send {
    async fn add_meta(&mut self, _entry: &EntryId, _key: &str, _value: &str) -> Result<(), BatchError> {
        Err(unsupported("adding metadata"))
    }

    async fn delete_meta(
        &mut self,
        _entry: &EntryId,
        _key: &str,
        _value: &str,
    ) -> Result<(), BatchError> {
        Err(unsupported("deleting metadata"))
    }

    async fn edit_meta(
        &mut self,
        _entry: &EntryId,
        _key: &str,
        _old_value: &str,
        _new_value: &str,
    ) -> Result<(), BatchError> {
        Err(unsupported("editing metadata"))
    }

    async fn delete_all_meta(&mut self, _entry: &EntryId) -> Result<(), BatchError> {
        Err(unsupported("removing library items"))
    }

    async fn add_playlist(&mut self, _playlist: &PlaylistId, _name: &str) -> Result<(), BatchError> {
        Err(unsupported("creating playlists"))
    }

    async fn delete_playlist(&mut self, _playlist: &PlaylistId) -> Result<(), BatchError> {
        Err(unsupported("deleting playlists"))
    }

    async fn add_playlist_meta(
        &mut self,
        _playlist: &PlaylistId,
        _key: &str,
        _value: &str,
    ) -> Result<(), BatchError> {
        Err(unsupported("adding playlist metadata"))
    }

    async fn delete_playlist_meta(
        &mut self,
        _playlist: &PlaylistId,
        _key: &str,
        _value: &str,
    ) -> Result<(), BatchError> {
        Err(unsupported("deleting playlist metadata"))
    }

    async fn edit_playlist_meta(
        &mut self,
        _playlist: &PlaylistId,
        _key: &str,
        _old_value: &str,
        _new_value: &str,
    ) -> Result<(), BatchError> {
        Err(unsupported("editing playlist metadata"))
    }

    async fn add_playlist_entry(
        &mut self,
        _playlist: &PlaylistId,
        _entry: &PlaylistEntry,
        _before: Option<&PlaylistEntryId>,
    ) -> Result<(), BatchError> {
        Err(unsupported("adding playlist entries"))
    }

    async fn delete_playlist_entry(
        &mut self,
        _playlist: &PlaylistId,
        _playlist_entry_id: &PlaylistEntryId,
        _entry: &EntryId,
    ) -> Result<(), BatchError> {
        Err(unsupported("removing playlist entries"))
    }

    async fn move_playlist_entry(
        &mut self,
        _playlist: &PlaylistId,
        _playlist_entry_id: &PlaylistEntryId,
        _entry: &EntryId,
        _before: Option<&PlaylistEntryId>,
    ) -> Result<(), BatchError> {
        Err(unsupported("moving playlist entries"))
    }

    /// Push every staged edit to the backend.
    async fn commit(self: Box<Self>) -> Result<(), BatchError>;
}

// ============================================================================
// BackendClient
// ============================================================================

/// One storage backend, identified by its source name.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Source name, e.g. `"git"` or `"subsonic"`.
    fn source(&self) -> &str;

    /// Whether the backend serves a library that should be fetched on sync.
    fn has_library(&self) -> bool;

    /// Whether the backend stores playlists that should be fetched on sync.
    fn has_playlists(&self) -> bool;

    /// Cheap liveness probe.
    async fn heartbeat(&self) -> Result<(), BackendError>;

    /// Whether the backend can store `kind` for an item from `arg_source`.
    fn supports(&self, kind: TransactionKind, arg_source: &str) -> bool;

    /// Where to read the audio of `entry`, `None` when the backend has none.
    async fn get_audio_data(&self, entry: &EntryId) -> Result<Option<AudioSource>, BackendError>;

    async fn start_batch(&self) -> Result<Box<dyn Batch>, BatchError>;

    /// Apply a settings bundle. `work_dir` is the directory the backend may
    /// use for local state.
    async fn load_settings(
        &self,
        work_dir: &Path,
        settings: &HashMap<String, String>,
    ) -> Result<(), BackendError>;

    async fn fetch_library(&self) -> Result<Vec<LibraryEntry>, BackendError>;

    async fn fetch_playlists(&self) -> Result<Vec<Playlist>, BackendError>;
}

// ============================================================================
// Registry
// ============================================================================

/// Registered backends keyed by source.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn BackendClient>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, replacing any previous backend of the same source.
    pub async fn register(&self, backend: Arc<dyn BackendClient>) {
        let source = backend.source().to_string();
        info!(source = %source, "Registering backend");
        self.backends.write().await.insert(source, backend);
    }

    pub async fn get(&self, source: &str) -> Option<Arc<dyn BackendClient>> {
        self.backends.read().await.get(source).cloned()
    }

    /// Registered sources, sorted.
    pub async fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.backends.read().await.keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Whether `source` is registered and can store `kind` for `arg_source`.
    pub async fn backend_supports(
        &self,
        source: &str,
        kind: TransactionKind,
        arg_source: &str,
    ) -> bool {
        match self.get(source).await {
            Some(backend) => backend.supports(kind, arg_source),
            None => false,
        }
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry").finish_non_exhaustive()
    }
}

// ============================================================================
// Local backend
// ============================================================================

/// Backend for playlists that live only on this device.
///
/// The projection is the only copy, so nothing is fetched and commits
/// succeed without doing any work.
pub struct LocalBackend {
    source: String,
    root: RwLock<Option<PathBuf>>,
}

impl LocalBackend {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            root: RwLock::new(None),
        }
    }

    /// Directory local files are resolved against, once settings are loaded.
    pub async fn root(&self) -> Option<PathBuf> {
        self.root.read().await.clone()
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new("local")
    }
}

struct LocalBatch {
    staged: usize,
}

#[async_trait]
impl Batch for LocalBatch {
    async fn add_meta(&mut self, _: &EntryId, _: &str, _: &str) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn delete_meta(&mut self, _: &EntryId, _: &str, _: &str) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn edit_meta(&mut self, _: &EntryId, _: &str, _: &str, _: &str) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn delete_all_meta(&mut self, _: &EntryId) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn add_playlist(&mut self, _: &PlaylistId, _: &str) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn delete_playlist(&mut self, _: &PlaylistId) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn add_playlist_meta(&mut self, _: &PlaylistId, _: &str, _: &str) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn delete_playlist_meta(
        &mut self,
        _: &PlaylistId,
        _: &str,
        _: &str,
    ) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn edit_playlist_meta(
        &mut self,
        _: &PlaylistId,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn add_playlist_entry(
        &mut self,
        _: &PlaylistId,
        _: &PlaylistEntry,
        _: Option<&PlaylistEntryId>,
    ) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn delete_playlist_entry(
        &mut self,
        _: &PlaylistId,
        _: &PlaylistEntryId,
        _: &EntryId,
    ) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn move_playlist_entry(
        &mut self,
        _: &PlaylistId,
        _: &PlaylistEntryId,
        _: &EntryId,
        _: Option<&PlaylistEntryId>,
    ) -> Result<(), BatchError> {
        self.staged += 1;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), BatchError> {
        debug!(staged = self.staged, "Local batch committed");
        Ok(())
    }
}

#[async_trait]
impl BackendClient for LocalBackend {
    fn source(&self) -> &str {
        &self.source
    }

    fn has_library(&self) -> bool {
        false
    }

    fn has_playlists(&self) -> bool {
        false
    }

    async fn heartbeat(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn supports(&self, _kind: TransactionKind, _arg_source: &str) -> bool {
        true
    }

    async fn get_audio_data(&self, entry: &EntryId) -> Result<Option<AudioSource>, BackendError> {
        if entry.source != self.source {
            return Ok(None);
        }
        let path = match self.root().await {
            Some(root) => root.join(&entry.local_id),
            None => PathBuf::from(&entry.local_id),
        };
        Ok(Some(AudioSource::File(path)))
    }

    async fn start_batch(&self) -> Result<Box<dyn Batch>, BatchError> {
        Ok(Box::new(LocalBatch { staged: 0 }))
    }

    async fn load_settings(
        &self,
        work_dir: &Path,
        settings: &HashMap<String, String>,
    ) -> Result<(), BackendError> {
        let root = match settings.get("root") {
            Some(root) if root.trim().is_empty() => {
                return Err(BackendError::InvalidSettings("root must not be empty".to_string()))
            }
            Some(root) => PathBuf::from(root),
            None => work_dir.to_path_buf(),
        };
        debug!(source = %self.source, root = %root.display(), "Local backend settings loaded");
        *self.root.write().await = Some(root);
        Ok(())
    }

    async fn fetch_library(&self) -> Result<Vec<LibraryEntry>, BackendError> {
        Ok(Vec::new())
    }

    async fn fetch_playlists(&self) -> Result<Vec<Playlist>, BackendError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnlyBatch;

    #[async_trait]
    impl Batch for ReadOnlyBatch {
        async fn commit(self: Box<Self>) -> Result<(), BatchError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_defaults_are_unsupported() {
        let mut batch = ReadOnlyBatch;
        let song = EntryId::new("git", "a");

        let result = batch.add_meta(&song, "genre", "jazz").await;
        assert!(matches!(result, Err(BatchError::Unsupported(_))));
        let result = batch
            .move_playlist_entry(&PlaylistId::new("git", "p"), &"pe".into(), &song, None)
            .await;
        assert!(matches!(result, Err(BatchError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = BackendRegistry::new();
        registry.register(Arc::new(LocalBackend::new("local"))).await;
        registry.register(Arc::new(LocalBackend::new("attic"))).await;

        assert_eq!(registry.sources().await, vec!["attic", "local"]);
        assert!(registry.get("git").await.is_none());
        assert!(
            registry
                .backend_supports("local", TransactionKind::PlaylistEntryAdd, "git")
                .await
        );
        assert!(
            !registry
                .backend_supports("git", TransactionKind::MetaAdd, "git")
                .await
        );
    }

    #[tokio::test]
    async fn test_local_backend_settings() {
        let backend = LocalBackend::default();
        assert!(backend.root().await.is_none());

        let mut settings = HashMap::new();
        backend
            .load_settings(Path::new("/tmp/work"), &settings)
            .await
            .unwrap();
        assert_eq!(backend.root().await, Some(PathBuf::from("/tmp/work")));

        settings.insert("root".to_string(), "/music".to_string());
        backend
            .load_settings(Path::new("/tmp/work"), &settings)
            .await
            .unwrap();
        let audio = backend
            .get_audio_data(&EntryId::new("local", "a.flac"))
            .await
            .unwrap();
        assert_eq!(audio, Some(AudioSource::File(PathBuf::from("/music/a.flac"))));
        assert_eq!(
            backend
                .get_audio_data(&EntryId::new("git", "a.flac"))
                .await
                .unwrap(),
            None
        );

        settings.insert("root".to_string(), " ".to_string());
        assert!(matches!(
            backend.load_settings(Path::new("/tmp"), &settings).await,
            Err(BackendError::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn test_local_batch_commits() {
        let backend = LocalBackend::default();
        let mut batch = backend.start_batch().await.unwrap();
        batch
            .add_playlist(&PlaylistId::new("local", "p"), "P")
            .await
            .unwrap();
        batch.commit().await.unwrap();
        assert!(backend.fetch_playlists().await.unwrap().is_empty());
    }
}
