//! # Sync Pipeline
//!
//! One run for one source: fetch → index → drain.
//!
//! ## Steps
//!
//! 1. **Fetch**: pull the remote library and playlists (only what the
//!    backend serves), reconcile the projection and replay pending edits
//! 2. **Index**: rebuild the search index; a failure is reported and the run
//!    carries on
//! 3. **Drain**: push pending transactions in creation order
//!
//! The job record is persisted at every phase change. Cancellation is
//! checked between steps and between transactions. The run never retries
//! by itself; that is up to the coordinator.

use crate::backend::{BackendClient, BackendRegistry};
use crate::drain::TransactionDrainer;
use crate::error::{Result, SyncError};
use crate::indexer::SearchIndexer;
use crate::job::SyncJob;
use crate::reconcile::{
    reconcile_library, reconcile_playlists, replay_pending, FetchedState, ReconcileStats,
};
use crate::repository::SyncJobRepository;
use crate::store::TransactionStore;
use crate::transaction::TransactionGroup;
use crate::update::{SyncUpdate, UpdateSink};
use core_library::LocalLibrary;
use core_runtime::events::{CoreEvent, EventBus, LibraryEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct SyncPipeline {
    store: Arc<dyn TransactionStore>,
    library: LocalLibrary,
    backends: Arc<BackendRegistry>,
    indexer: Option<Arc<dyn SearchIndexer>>,
    jobs: Arc<dyn SyncJobRepository>,
    drainer: TransactionDrainer,
    events: EventBus,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        library: LocalLibrary,
        backends: Arc<BackendRegistry>,
        indexer: Option<Arc<dyn SearchIndexer>>,
        jobs: Arc<dyn SyncJobRepository>,
        events: EventBus,
    ) -> Self {
        let drainer = TransactionDrainer::new(store.clone(), backends.clone(), events.clone());
        Self {
            store,
            library,
            backends,
            indexer,
            jobs,
            drainer,
            events,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn SyncJobRepository> {
        &self.jobs
    }

    /// Run the full pipeline for `job`.
    ///
    /// Returns the job in its final persisted state along with the outcome.
    /// On error the job is `Failed` or `Cancelled`.
    #[instrument(skip(self, job, cancel, sink), fields(source = %job.source, attempt = job.attempt))]
    pub async fn run(
        &self,
        job: SyncJob,
        cancel: &CancellationToken,
        sink: &UpdateSink,
        timeout: Duration,
    ) -> (SyncJob, Result<()>) {
        self.execute_bounded(job, cancel, sink, timeout, false).await
    }

    /// Only the drain step, used to flush pending edits without fetching.
    #[instrument(skip(self, job, cancel, sink), fields(source = %job.source))]
    pub async fn run_drain_only(
        &self,
        job: SyncJob,
        cancel: &CancellationToken,
        sink: &UpdateSink,
        timeout: Duration,
    ) -> (SyncJob, Result<()>) {
        self.execute_bounded(job, cancel, sink, timeout, true).await
    }

    async fn execute_bounded(
        &self,
        job: SyncJob,
        cancel: &CancellationToken,
        sink: &UpdateSink,
        timeout: Duration,
        drain_only: bool,
    ) -> (SyncJob, Result<()>) {
        if let Err(e) = self.jobs.insert(&job).await {
            return (job, Err(e));
        }

        let mut current = job;
        let deadline = Instant::now() + timeout;
        let result = self
            .execute(&mut current, cancel, sink, drain_only, deadline, timeout)
            .await;

        let current = self.finish(current, &result).await;
        (current, result)
    }

    async fn execute(
        &self,
        job: &mut SyncJob,
        cancel: &CancellationToken,
        sink: &UpdateSink,
        drain_only: bool,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<()> {
        let source = job.source.clone();
        let backend = self
            .backends
            .get(&source)
            .await
            .ok_or_else(|| SyncError::BackendNotFound(source.clone()))?;

        if !drain_only && (backend.has_library() || backend.has_playlists()) {
            tokio::time::timeout_at(deadline, self.fetch_and_index(job, backend.as_ref(), cancel, sink))
                .await
                .map_err(|_| timed_out(timeout))??;
        } else {
            debug!(source = %source, "Nothing to fetch");
        }

        check_cancelled(cancel)?;
        advance(job, SyncJob::begin_draining)?;
        self.persist(job, sink).await?;

        // The deadline only stops the drain between transactions, a commit in
        // flight always gets to remove its transaction from the store.
        let drain_cancel = cancel.child_token();
        let job_snapshot = job.clone();
        let drain = self.drainer.drain(&source, &drain_cancel, |applied, total| {
            let mut progress = job_snapshot.clone();
            progress.progress.update(
                applied as u64,
                Some(total as u64),
                &format!("{}/{} applied", applied, total),
            );
            sink.progress(&progress);
        });
        tokio::pin!(drain);
        let outcome = tokio::select! {
            outcome = &mut drain => outcome,
            _ = tokio::time::sleep_until(deadline) => {
                drain_cancel.cancel();
                drain.await
            }
        }?;

        job.progress.update(
            outcome.applied as u64,
            Some(outcome.total as u64),
            &outcome.status(),
        );
        job.stats.transactions_applied = outcome.applied as u64;
        job.stats.transactions_pending = self.store.count(Some(&source)).await?.max(0) as u64;
        job.status_message = Some(outcome.status());

        if let Some(failure) = &outcome.failed {
            return Err(SyncError::TransactionRejected {
                applied: outcome.applied,
                total: outcome.total,
                message: format!(
                    "{}; failed to {}: {}",
                    outcome.status(),
                    failure.description,
                    failure.message
                ),
            });
        }
        if outcome.stopped {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            warn!(source = %source, status = %outcome.status(), "Drain hit the run deadline");
            return Err(timed_out(timeout));
        }
        Ok(())
    }

    async fn fetch_and_index(
        &self,
        job: &mut SyncJob,
        backend: &dyn BackendClient,
        cancel: &CancellationToken,
        sink: &UpdateSink,
    ) -> Result<()> {
        advance(job, SyncJob::begin_fetch)?;
        self.persist(job, sink).await?;
        self.fetch(job, backend, sink).await?;
        check_cancelled(cancel)?;

        if backend.has_library() {
            if let Some(indexer) = &self.indexer {
                advance(job, SyncJob::begin_indexing)?;
                self.persist(job, sink).await?;
                self.index(job, indexer.as_ref(), sink).await;
                check_cancelled(cancel)?;
            }
        }
        Ok(())
    }

    async fn fetch(
        &self,
        job: &mut SyncJob,
        backend: &dyn BackendClient,
        sink: &UpdateSink,
    ) -> Result<()> {
        let source = job.source.clone();
        backend.heartbeat().await?;

        let mut fetched = FetchedState::default();

        if backend.has_library() {
            self.report(job, sink, 0, None, "Fetching library");
            let entries = backend.fetch_library().await?;
            self.report(job, sink, entries.len() as u64, Some(entries.len() as u64), "Library fetched");

            let stats = reconcile_library(&self.library, &source, &entries).await?;
            job.stats.entries_added = stats.added;
            job.stats.entries_updated = stats.updated;
            job.stats.entries_deleted = stats.deleted;
            self.emit_reconciled(&source, TransactionGroup::Library, stats);

            fetched = fetched.with_library(&entries);
            replay_pending(
                self.store.as_ref(),
                &self.library,
                &source,
                TransactionGroup::Library,
                &fetched,
            )
            .await?;
        }

        if backend.has_playlists() {
            self.report(job, sink, 0, None, "Fetching playlists");
            let playlists = backend.fetch_playlists().await?;
            self.report(
                job,
                sink,
                playlists.len() as u64,
                Some(playlists.len() as u64),
                "Playlists fetched",
            );

            let stats = reconcile_playlists(&self.library, &source, &playlists).await?;
            job.stats.playlists_changed = stats.added + stats.deleted + stats.updated + stats.moved;
            self.emit_reconciled(&source, TransactionGroup::Playlists, stats);

            fetched = fetched.with_playlists(&playlists);
            replay_pending(
                self.store.as_ref(),
                &self.library,
                &source,
                TransactionGroup::Playlists,
                &fetched,
            )
            .await?;
        }

        self.jobs.update(job).await?;
        Ok(())
    }

    async fn index(&self, job: &mut SyncJob, indexer: &dyn SearchIndexer, sink: &UpdateSink) {
        match indexer.rebuild(&job.source).await {
            Ok(indexed) => {
                info!(source = %job.source, indexed, "Search index rebuilt");
                self.report(job, sink, indexed as u64, Some(indexed as u64), "Search index rebuilt");
            }
            Err(message) => {
                warn!(source = %job.source, error = %message, "Search index rebuild failed");
                sink.send(job, SyncUpdate::IndexFailed { message });
            }
        }
    }

    fn report(&self, job: &mut SyncJob, sink: &UpdateSink, processed: u64, total: Option<u64>, message: &str) {
        if job.update_progress(processed, total, message).is_ok() {
            sink.progress(job);
        }
    }

    fn emit_reconciled(&self, source: &str, group: TransactionGroup, stats: ReconcileStats) {
        let _ = self.events.emit(CoreEvent::Library(LibraryEvent::Reconciled {
            source: source.to_string(),
            group: group.as_str().to_string(),
            added: stats.added,
            deleted: stats.deleted,
            updated: stats.updated,
            moved: stats.moved,
        }));
    }

    async fn persist(&self, job: &SyncJob, sink: &UpdateSink) -> Result<()> {
        self.jobs.update(job).await?;
        sink.progress(job);
        Ok(())
    }

    /// Move the job to its terminal phase and persist it.
    async fn finish(&self, job: SyncJob, result: &Result<()>) -> SyncJob {
        let fallback = job.clone();
        let finished = match result {
            Ok(()) => {
                let status = job
                    .status_message
                    .clone()
                    .unwrap_or_else(|| "0/0 applied".to_string());
                job.succeed(status)
            }
            Err(SyncError::Cancelled) => {
                let status = job
                    .status_message
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string());
                job.cancel(status)
            }
            Err(e) => job.fail(e.to_string()),
        };

        let finished = match finished {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Could not finish sync job");
                return fallback;
            }
        };

        if let Err(e) = self.jobs.update(&finished).await {
            warn!(job_id = %finished.id, error = %e, "Failed to persist finished sync job");
        }
        finished
    }
}

fn timed_out(timeout: Duration) -> SyncError {
    SyncError::Timeout(timeout.as_millis() as u64)
}

impl std::fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("has_indexer", &self.indexer.is_some())
            .finish_non_exhaustive()
    }
}

fn advance(job: &mut SyncJob, step: impl FnOnce(SyncJob) -> Result<SyncJob>) -> Result<()> {
    *job = step(job.clone())?;
    Ok(())
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::indexer::tests::MockIndexer;
    use crate::job::{SyncPhase, SyncTrigger};
    use crate::repository::SqliteSyncJobRepository;
    use crate::store::SqliteTransactionStore;
    use core_library::db::create_test_pool;
    use tokio::sync::mpsc;

    async fn pipeline(indexer: Option<Arc<dyn SearchIndexer>>) -> SyncPipeline {
        let pool = create_test_pool().await.unwrap();
        let backends = Arc::new(BackendRegistry::new());
        backends.register(Arc::new(LocalBackend::default())).await;
        SyncPipeline::new(
            Arc::new(SqliteTransactionStore::new(pool.clone())),
            LocalLibrary::new(pool.clone()),
            backends,
            indexer,
            Arc::new(SqliteSyncJobRepository::new(pool)),
            EventBus::new(32),
        )
    }

    #[tokio::test]
    async fn test_local_source_skips_fetch_and_index() {
        let mut indexer = MockIndexer::new();
        indexer.expect_rebuild().times(0);
        let pipeline = pipeline(Some(Arc::new(indexer))).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = UpdateSink::new("local", EventBus::new(8), Some(tx));
        let job = SyncJob::new("local", SyncTrigger::RunNow);

        let (job, result) = pipeline
            .run(job, &CancellationToken::new(), &sink, Duration::from_secs(5))
            .await;
        result.unwrap();
        assert_eq!(job.phase, SyncPhase::Success);
        assert_eq!(job.status_message.as_deref(), Some("0/0 applied"));

        drop(sink);
        let mut phases = Vec::new();
        while let Some(update) = rx.recv().await {
            if let SyncUpdate::Progress { phase, .. } = update {
                phases.push(phase);
            }
        }
        assert!(!phases.contains(&SyncPhase::Fetching));
        assert!(phases.contains(&SyncPhase::DrainingTransactions));

        let stored = pipeline.jobs().find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, SyncPhase::Success);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let pipeline = pipeline(None).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sink = UpdateSink::events_only("local", EventBus::new(8));
        let (job, result) = pipeline
            .run(SyncJob::new("local", SyncTrigger::RunNow), &cancel, &sink, Duration::from_secs(5))
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(job.phase, SyncPhase::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_source_fails_job() {
        let pipeline = pipeline(None).await;
        let sink = UpdateSink::events_only("ghost", EventBus::new(8));
        let (job, result) = pipeline
            .run(
                SyncJob::new("ghost", SyncTrigger::Scheduled),
                &CancellationToken::new(),
                &sink,
                Duration::from_secs(5),
            )
            .await;

        assert!(matches!(result, Err(SyncError::BackendNotFound(_))));
        assert_eq!(job.phase, SyncPhase::Failed);
        assert!(job.error_message.unwrap().contains("ghost"));
    }
}
