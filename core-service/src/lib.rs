//! Core service façade and bootstrap helpers.
//!
//! This crate is the composition root of the workspace. It opens the
//! database, builds the transaction store and the local projection, loads
//! settings into the backend adapters supplied by the host and wires them
//! into a [`SyncCoordinator`]. Nothing in the workspace is a global; hosts
//! hold one [`CoreService`] and go through it.
//!
//! Desktop apps typically enable the `desktop-shims` feature, which gives
//! the configuration a `TokioJobScheduler` for daily syncs.
//!
//! ```ignore
//! use core_runtime::config::{BackendSettings, CoreConfig};
//! use core_service::CoreService;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/data/library.db")
//!     .work_dir("/data/work")
//!     .backend(BackendSettings::new("local", "local"))
//!     .build()?;
//! let core = CoreService::bootstrap(config, Vec::new(), None).await?;
//!
//! core.submit(Transaction::meta_add(EntryId::new("local", "a.flac"), "genre", "jazz")).await?;
//! let outcome = core.flush("local").await?;
//! ```

pub mod error;

pub use error::{Result, ServiceError};

use core_library::db::{create_pool, ensure_parent_dir, DatabaseConfig};
use core_library::{EntryId, LocalLibrary};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, TransactionEvent};
use core_runtime::logging::{init_logging, redact_if_sensitive};
use core_sync::{
    AudioSource, BackendClient, BackendRegistry, LocalBackend, SearchIndexer,
    SqliteSyncJobRepository, SqliteTransactionStore, SyncCoordinator, SyncHandle, SyncJob,
    SyncOutcome, SyncPipeline, Transaction, TransactionStore,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Adapter kind served by the built-in [`LocalBackend`]
pub const LOCAL_BACKEND_KIND: &str = "local";

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    config: Arc<CoreConfig>,
    pool: SqlitePool,
    store: Arc<dyn TransactionStore>,
    library: LocalLibrary,
    backends: Arc<BackendRegistry>,
    coordinator: Arc<SyncCoordinator>,
    events: EventBus,
}

impl CoreService {
    /// Open the database at the configured path and build the service.
    ///
    /// `backends` are the host's adapters; configured sources of kind
    /// `"local"` without an adapter get a [`LocalBackend`].
    pub async fn bootstrap(
        config: CoreConfig,
        backends: Vec<Arc<dyn BackendClient>>,
        indexer: Option<Arc<dyn SearchIndexer>>,
    ) -> Result<Self> {
        config.validate()?;

        if let Err(e) = init_logging(config.logging.clone()) {
            debug!(error = %e, "Logging already initialized by the host");
        }

        ensure_parent_dir(&config.database_path)?;
        let pool = create_pool(DatabaseConfig::new(config.database_path.clone())).await?;

        let service = Self::from_pool(pool, config, backends, indexer).await?;
        if service.config.features.enable_scheduled_sync {
            let scheduled = service.schedule_all().await?;
            info!(scheduled, "Daily syncs scheduled");
        }
        Ok(service)
    }

    /// Build the service on an existing pool. Nothing is scheduled.
    pub async fn from_pool(
        pool: SqlitePool,
        config: CoreConfig,
        backends: Vec<Arc<dyn BackendClient>>,
        indexer: Option<Arc<dyn SearchIndexer>>,
    ) -> Result<Self> {
        let events = EventBus::new(1024);
        let store: Arc<dyn TransactionStore> = Arc::new(SqliteTransactionStore::new(pool.clone()));
        let library = LocalLibrary::new(pool.clone());
        let registry = Arc::new(BackendRegistry::new());

        let mut adapters = backends;
        for settings in &config.backends {
            let provided = adapters.iter().any(|b| b.source() == settings.source);
            if !provided && settings.kind == LOCAL_BACKEND_KIND {
                adapters.push(Arc::new(LocalBackend::new(settings.source.clone())));
            }
        }

        for backend in adapters {
            let source = backend.source().to_string();
            let settings = config
                .backend(&source)
                .map(|b| b.settings.clone())
                .unwrap_or_default();
            for (key, value) in &settings {
                debug!(source = %source, key = %key, value = %redact_if_sensitive(key, value), "Backend setting");
            }
            backend.load_settings(&config.work_dir, &settings).await?;
            registry.register(backend).await;
            info!(source = %source, "Backend registered");
        }

        let indexer = if config.features.enable_indexing {
            indexer
        } else {
            None
        };

        let pipeline = Arc::new(SyncPipeline::new(
            store.clone(),
            library.clone(),
            registry.clone(),
            indexer,
            Arc::new(SqliteSyncJobRepository::new(pool.clone())),
            events.clone(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            pipeline,
            events.clone(),
            config.sync.clone(),
            config.job_scheduler.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            pool,
            store,
            library,
            backends: registry,
            coordinator,
            events,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn library(&self) -> &LocalLibrary {
        &self.library
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Registered sources, sorted.
    pub async fn sources(&self) -> Vec<String> {
        self.backends.sources().await
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Record a user edit: queue it for its backend and apply it to the
    /// projection right away.
    ///
    /// A transaction that cannot be applied locally is not kept.
    pub async fn submit(&self, transaction: Transaction) -> Result<Transaction> {
        if self.backends.get(&transaction.source).await.is_none() {
            return Err(ServiceError::UnknownSource(transaction.source.clone()));
        }

        let queued = self.store.append(transaction).await?;
        if let Err(e) = queued.apply_locally(&self.library).await {
            warn!(id = queued.id, kind = %queued.op.kind_str(), error = %e, "Local apply failed, dropping transaction");
            self.store.remove(queued.id).await?;
            return Err(e.into());
        }
        self.store
            .mark_applied_locally(&queued.source, queued.group(), true)
            .await?;

        debug!(id = queued.id, kind = %queued.op.kind_str(), source = %queued.source, "Transaction queued");
        let _ = self
            .events
            .emit(CoreEvent::Transaction(TransactionEvent::Queued {
                transaction_id: queued.id,
                source: queued.source.clone(),
                kind: queued.op.kind_str().to_string(),
            }));

        match self.store.get(queued.id).await? {
            Some(stored) => Ok(stored),
            None => Ok(queued),
        }
    }

    /// Pending transactions, oldest first.
    pub async fn pending(&self, source: Option<&str>) -> Result<Vec<Transaction>> {
        Ok(self.store.list(source, None).await?)
    }

    /// Drop a pending transaction without sending it. The projection keeps
    /// the edit until the next fetch of its source.
    pub async fn discard(&self, id: i64) -> Result<bool> {
        let Some(transaction) = self.store.get(id).await? else {
            return Ok(false);
        };
        let removed = self.store.remove(id).await?;
        if removed {
            info!(id, kind = %transaction.op.kind_str(), "Transaction discarded");
            let _ = self
                .events
                .emit(CoreEvent::Transaction(TransactionEvent::Discarded {
                    transaction_id: id,
                    source: transaction.source.clone(),
                    kind: transaction.op.kind_str().to_string(),
                }));
        }
        Ok(removed)
    }

    /// Reset the error bookkeeping of a failed transaction.
    pub async fn retry(&self, id: i64) -> Result<Transaction> {
        Ok(self.store.clear_error(id).await?)
    }

    // ========================================================================
    // Sync
    // ========================================================================

    pub async fn sync_now(&self, source: &str) -> Result<SyncHandle> {
        Ok(self.coordinator.run_now(source).await?)
    }

    pub async fn cancel_sync(&self, source: &str) -> bool {
        self.coordinator.cancel(source).await
    }

    /// Push pending transactions of `source` without fetching.
    pub async fn flush(&self, source: &str) -> Result<SyncOutcome> {
        Ok(self.coordinator.flush(source).await?)
    }

    /// Enqueue the daily sync of every registered source. Returns how many
    /// were queued.
    pub async fn schedule_all(&self) -> Result<usize> {
        let mut scheduled = 0;
        for source in self.backends.sources().await {
            if self.coordinator.schedule_daily(source).await? {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    pub async fn history(&self, source: &str, limit: u32) -> Result<Vec<SyncJob>> {
        Ok(self.coordinator.history(source, limit).await?)
    }

    /// Where to read the audio of `entry` from, if its backend can serve it.
    pub async fn audio(&self, entry: &EntryId) -> Result<Option<AudioSource>> {
        let backend = self
            .backends
            .get(&entry.source)
            .await
            .ok_or_else(|| ServiceError::UnknownSource(entry.source.clone()))?;
        Ok(backend.get_audio_data(entry).await?)
    }
}

impl std::fmt::Debug for CoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
