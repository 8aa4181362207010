//! Integration tests for the sync pipeline
//!
//! These tests drive the store, drainer, pipeline and coordinator together
//! against an in-memory database and a scripted backend:
//! - Drain order and stop-at-first-failure bookkeeping
//! - Cancellation between transactions
//! - Fetch, reconcile and replay of pending edits
//! - Per-source ownership and rejection handling in the coordinator

use async_trait::async_trait;
use core_library::{
    db::create_test_pool, EntryId, LibraryEntry, LocalLibrary, Playlist, PlaylistEntry,
    PlaylistEntryId, PlaylistId,
};
use core_runtime::config::SyncSettings;
use core_runtime::events::{CoreEvent, EventBus, TransactionEvent};
use core_sync::{
    AudioSource, BackendClient, BackendError, BackendRegistry, Batch, BatchError,
    SqliteSyncJobRepository, SqliteTransactionStore, SyncCoordinator, SyncError, SyncPipeline,
    SyncUpdate, Transaction, TransactionDrainer, TransactionKind, TransactionStore,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted Backend
// ============================================================================

/// Backend serving a fixed remote state. Metadata edits with the rejected key
/// fail at staging time; committed batches are recorded.
#[derive(Default)]
struct ScriptedBackend {
    library: Vec<LibraryEntry>,
    playlists: Vec<Playlist>,
    serves_library: bool,
    serves_playlists: bool,
    rejected_key: Option<String>,
    committed: Arc<Mutex<Vec<String>>>,
    /// When set, fetching waits until notified
    gate: Option<Arc<Notify>>,
    /// Time a commit keeps running after the backend accepted it
    commit_delay: Option<Duration>,
}

impl ScriptedBackend {
    fn committed(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.committed)
    }
}

struct ScriptedBatch {
    staged: Vec<String>,
    rejected_key: Option<String>,
    committed: Arc<Mutex<Vec<String>>>,
    commit_delay: Option<Duration>,
}

#[async_trait]
impl Batch for ScriptedBatch {
    async fn add_meta(&mut self, entry: &EntryId, key: &str, value: &str) -> Result<(), BatchError> {
        if self.rejected_key.as_deref() == Some(key) {
            return Err(BatchError::Rejected(format!("key {} is read-only", key)));
        }
        self.staged.push(format!("add {} {}={}", entry, key, value));
        Ok(())
    }

    async fn add_playlist_entry(
        &mut self,
        playlist: &PlaylistId,
        entry: &PlaylistEntry,
        _before: Option<&PlaylistEntryId>,
    ) -> Result<(), BatchError> {
        self.staged.push(format!("entry {} {}", playlist, entry.entry));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), BatchError> {
        let ScriptedBatch {
            staged,
            committed,
            commit_delay,
            ..
        } = *self;
        committed.lock().unwrap().extend(staged);
        if let Some(delay) = commit_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    fn source(&self) -> &str {
        "git"
    }

    fn has_library(&self) -> bool {
        self.serves_library
    }

    fn has_playlists(&self) -> bool {
        self.serves_playlists
    }

    async fn heartbeat(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn supports(&self, _kind: TransactionKind, arg_source: &str) -> bool {
        arg_source == "git"
    }

    async fn get_audio_data(&self, _entry: &EntryId) -> Result<Option<AudioSource>, BackendError> {
        Ok(None)
    }

    async fn start_batch(&self) -> Result<Box<dyn Batch>, BatchError> {
        Ok(Box::new(ScriptedBatch {
            staged: Vec::new(),
            rejected_key: self.rejected_key.clone(),
            committed: Arc::clone(&self.committed),
            commit_delay: self.commit_delay,
        }))
    }

    async fn load_settings(
        &self,
        _work_dir: &Path,
        _settings: &HashMap<String, String>,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn fetch_library(&self) -> Result<Vec<LibraryEntry>, BackendError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.library.clone())
    }

    async fn fetch_playlists(&self) -> Result<Vec<Playlist>, BackendError> {
        Ok(self.playlists.clone())
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Harness {
    store: Arc<dyn TransactionStore>,
    library: LocalLibrary,
    registry: Arc<BackendRegistry>,
    events: EventBus,
    coordinator: Arc<SyncCoordinator>,
}

async fn harness(backend: ScriptedBackend) -> Harness {
    let settings = SyncSettings {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        ..SyncSettings::default()
    };
    harness_with(backend, settings).await
}

async fn harness_with(backend: ScriptedBackend, settings: SyncSettings) -> Harness {
    let pool = create_test_pool().await.unwrap();
    let store: Arc<dyn TransactionStore> = Arc::new(SqliteTransactionStore::new(pool.clone()));
    let library = LocalLibrary::new(pool.clone());
    let registry = Arc::new(BackendRegistry::new());
    registry.register(Arc::new(backend)).await;
    let events = EventBus::new(256);

    let pipeline = Arc::new(SyncPipeline::new(
        store.clone(),
        library.clone(),
        registry.clone(),
        None,
        Arc::new(SqliteSyncJobRepository::new(pool)),
        events.clone(),
    ));
    let coordinator = Arc::new(SyncCoordinator::new(
        pipeline,
        events.clone(),
        settings,
        None,
    ));

    Harness {
        store,
        library,
        registry,
        events,
        coordinator,
    }
}

fn song(id: &str) -> EntryId {
    EntryId::new("git", id)
}

async fn queue(store: &Arc<dyn TransactionStore>, keys: &[&str]) -> Vec<Transaction> {
    let mut queued = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let tx = Transaction::meta_add(song("a"), *key, "x").with_created_at(1_000 + i as i64);
        queued.push(store.append(tx).await.unwrap());
    }
    queued
}

// ============================================================================
// Drain
// ============================================================================

#[tokio::test]
async fn test_drain_stops_at_first_failure() {
    let backend = ScriptedBackend {
        rejected_key: Some("forbidden".to_string()),
        ..Default::default()
    };
    let committed = backend.committed();
    let h = harness(backend).await;
    let mut events = h.events.subscribe();

    let queued = queue(&h.store, &["genre", "forbidden", "mood"]).await;
    let drainer = TransactionDrainer::new(h.store.clone(), h.registry.clone(), h.events.clone());

    let mut seen = Vec::new();
    let outcome = drainer
        .drain("git", &CancellationToken::new(), |applied, total| {
            seen.push((applied, total))
        })
        .await
        .unwrap();

    assert_eq!(outcome.status(), "1/3 applied");
    assert_eq!(outcome.failed.as_ref().unwrap().transaction_id, queued[1].id);
    assert_eq!(seen, vec![(0, 3), (1, 3)]);

    // T1 removed, T2 carries the error, T3 untouched
    assert!(h.store.get(queued[0].id).await.unwrap().is_none());
    let failed = h.store.get(queued[1].id).await.unwrap().unwrap();
    assert_eq!(failed.error_count, 1);
    assert!(failed.error_message.unwrap().contains("read-only"));
    let untouched = h.store.get(queued[2].id).await.unwrap().unwrap();
    assert_eq!(untouched.error_count, 0);
    assert!(untouched.error_message.is_none());

    assert_eq!(*committed.lock().unwrap(), vec!["add git:a genre=x".to_string()]);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::Transaction(TransactionEvent::Applied { .. }) => kinds.push("applied"),
            CoreEvent::Transaction(TransactionEvent::Failed { error_count, .. }) => {
                assert_eq!(error_count, 1);
                kinds.push("failed");
            }
            _ => {}
        }
    }
    assert_eq!(kinds, vec!["applied", "failed"]);
}

#[tokio::test]
async fn test_second_failure_bumps_error_count() {
    let backend = ScriptedBackend {
        rejected_key: Some("forbidden".to_string()),
        ..Default::default()
    };
    let h = harness(backend).await;
    let queued = queue(&h.store, &["forbidden"]).await;
    let drainer = TransactionDrainer::new(h.store.clone(), h.registry.clone(), h.events.clone());

    for _ in 0..2 {
        drainer
            .drain("git", &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();
    }

    let failed = h.store.get(queued[0].id).await.unwrap().unwrap();
    assert_eq!(failed.error_count, 2);
}

#[tokio::test]
async fn test_cancel_between_transactions() {
    let h = harness(ScriptedBackend::default()).await;
    queue(&h.store, &["genre", "mood", "era"]).await;
    let drainer = TransactionDrainer::new(h.store.clone(), h.registry.clone(), h.events.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let outcome = drainer
        .drain("git", &cancel, move |applied, _| {
            if applied == 1 {
                trigger.cancel();
            }
        })
        .await
        .unwrap();

    assert!(outcome.stopped);
    assert_eq!(outcome.status(), "processing stopped, 1/3 applied");
    assert_eq!(h.store.count(Some("git")).await.unwrap(), 2);
}

// ============================================================================
// Fetch & Replay
// ============================================================================

#[tokio::test]
async fn test_fetch_reconciles_and_replays_pending() {
    let backend = ScriptedBackend {
        serves_library: true,
        library: vec![
            LibraryEntry::new(song("a")).with_meta("title", "A"),
            LibraryEntry::new(song("b")).with_meta("title", "B"),
        ],
        ..Default::default()
    };
    let committed = backend.committed();
    let h = harness(backend).await;

    // Local state from an older fetch
    h.library.add_meta(&song("a"), "title", "A").await.unwrap();
    h.library.add_meta(&song("c"), "title", "C").await.unwrap();

    // First edit is already upstream, the second is not
    h.store
        .append(Transaction::meta_add(song("b"), "title", "B").with_created_at(1))
        .await
        .unwrap();
    h.store
        .append(Transaction::meta_add(song("a"), "genre", "rock").with_created_at(2))
        .await
        .unwrap();

    let outcome = h.coordinator.run_scheduled("git", None).await;
    assert!(outcome.is_success(), "{:?}", outcome.update);
    assert_eq!(outcome.message(), "1/1 applied");
    assert_eq!(outcome.job.stats.entries_added, 1);
    assert_eq!(outcome.job.stats.entries_deleted, 1);

    assert_eq!(h.store.count(Some("git")).await.unwrap(), 0);
    assert_eq!(*committed.lock().unwrap(), vec!["add git:a genre=rock".to_string()]);

    let entries = h.library.library("git").await.unwrap();
    let ids: Vec<&str> = entries.iter().map(|e| e.id.local_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    let a = h.library.entry_meta(&song("a")).await.unwrap();
    assert!(a["genre"].contains("rock"));
}

#[tokio::test]
async fn test_playlist_one_removed_one_added() {
    let playlist = PlaylistId::new("git", "road-trip");
    let remote = Playlist::new(playlist.clone(), "Road trip")
        .with_entry(PlaylistEntry::new("e1".into(), song("one")))
        .with_entry(PlaylistEntry::new("e3".into(), song("three")));
    let backend = ScriptedBackend {
        serves_playlists: true,
        playlists: vec![remote],
        ..Default::default()
    };
    let h = harness(backend).await;

    h.library.add_playlist(&playlist, "Road trip").await.unwrap();
    h.library
        .add_playlist_entry(&playlist, &PlaylistEntry::new("e1".into(), song("one")), None)
        .await
        .unwrap();
    h.library
        .add_playlist_entry(&playlist, &PlaylistEntry::new("e2".into(), song("two")), None)
        .await
        .unwrap();

    let outcome = h.coordinator.run_scheduled("git", None).await;
    assert!(outcome.is_success(), "{:?}", outcome.update);

    let local = h.library.playlist(&playlist).await.unwrap().unwrap();
    let order: Vec<&str> = local.entries.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(order, vec!["e1", "e3"]);
}

// ============================================================================
// Coordinator
// ============================================================================

#[tokio::test]
async fn test_second_run_for_busy_source_is_refused() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend {
        serves_library: true,
        gate: Some(gate.clone()),
        ..Default::default()
    };
    let h = harness(backend).await;

    let handle = h.coordinator.run_now("git").await.unwrap();
    assert!(h.coordinator.is_active("git").await);

    let err = h.coordinator.run_now("git").await.unwrap_err();
    assert!(matches!(err, SyncError::SyncInProgress { .. }));

    gate.notify_one();
    let last = handle.wait().await.unwrap();
    assert!(matches!(last, SyncUpdate::Succeeded { .. }));
    assert!(!h.coordinator.is_active("git").await);
}

#[tokio::test]
async fn test_cancel_running_sync() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend {
        serves_library: true,
        gate: Some(gate.clone()),
        ..Default::default()
    };
    let h = harness(backend).await;
    queue(&h.store, &["genre"]).await;

    let handle = h.coordinator.run_now("git").await.unwrap();
    assert!(h.coordinator.cancel("git").await);
    gate.notify_one();

    let last = handle.wait().await.unwrap();
    assert!(matches!(last, SyncUpdate::Cancelled { .. }));
    assert_eq!(h.store.count(Some("git")).await.unwrap(), 1);

    let latest = h.coordinator.latest_job("git").await.unwrap().unwrap();
    assert_eq!(latest.phase.as_str(), "cancelled");
}

#[tokio::test]
async fn test_rejected_transaction_is_not_retried() {
    let backend = ScriptedBackend {
        rejected_key: Some("forbidden".to_string()),
        ..Default::default()
    };
    let h = harness(backend).await;
    queue(&h.store, &["forbidden"]).await;

    let mut handle = h.coordinator.run_now("git").await.unwrap();
    let mut updates = Vec::new();
    while let Some(update) = handle.recv().await {
        updates.push(update);
    }

    assert!(!updates
        .iter()
        .any(|u| matches!(u, SyncUpdate::Retrying { .. })));
    match updates.last() {
        Some(SyncUpdate::Failed {
            message,
            recoverable,
        }) => {
            assert!(!recoverable);
            assert!(message.starts_with("0/1 applied; failed to"));
        }
        other => panic!("unexpected terminal update {:?}", other),
    }

    let history = h.coordinator.history("git", 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_flush_pushes_without_fetching() {
    let backend = ScriptedBackend {
        serves_library: true,
        library: vec![LibraryEntry::new(song("remote-only"))],
        ..Default::default()
    };
    let h = harness(backend).await;
    queue(&h.store, &["genre"]).await;

    let outcome = h.coordinator.flush("git").await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.message(), "1/1 applied");
    assert!(h.library.library("git").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_applied_events_carry_kind() {
    let h = harness(ScriptedBackend::default()).await;
    let mut events = h.events.subscribe();
    queue(&h.store, &["genre"]).await;

    h.coordinator.flush("git").await.unwrap();

    let mut applied = None;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Transaction(TransactionEvent::Applied { kind, .. }) = event {
            applied = Some(kind);
        }
    }
    assert_eq!(applied.as_deref(), Some("META_ADD"));
}

#[tokio::test]
async fn test_run_deadline_never_repeats_a_commit() {
    let backend = ScriptedBackend {
        commit_delay: Some(Duration::from_millis(300)),
        ..Default::default()
    };
    let committed = backend.committed();
    let settings = SyncSettings {
        max_retries: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        run_timeout: Duration::from_millis(100),
        ..SyncSettings::default()
    };
    let h = harness_with(backend, settings).await;
    queue(&h.store, &["genre", "mood"]).await;

    let outcome = h.coordinator.run_scheduled("git", None).await;
    assert!(outcome.is_success(), "{:?}", outcome.update);

    // The first run stops after its slow commit, the retry pushes the rest
    assert_eq!(
        *committed.lock().unwrap(),
        vec!["add git:a genre=x".to_string(), "add git:a mood=x".to_string()]
    );
    assert_eq!(h.store.count(Some("git")).await.unwrap(), 0);

    let history = h.coordinator.history("git", 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|job| job
        .error_message
        .as_deref()
        .is_some_and(|m| m == "Sync timeout after 100 ms")));
}
