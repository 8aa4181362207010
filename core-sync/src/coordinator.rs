//! # Sync Coordinator
//!
//! Owns the per-source run lifecycle on top of [`SyncPipeline`].
//!
//! ## Overview
//!
//! The `SyncCoordinator` makes sure at most one pipeline runs per source:
//! - `run_now` starts a user-initiated run in the background and hands back
//!   a [`SyncHandle`] with the update stream; a busy source is refused
//! - `run_scheduled` waits for the source to become free instead
//! - `flush` pushes pending transactions without fetching
//! - `schedule_daily` registers the daily run with the host's `JobScheduler`
//!   and requeues it after every run
//!
//! Transient failures (network, database, timeout) are retried with
//! exponential backoff, each attempt with its own job record. Rejected
//! transactions end the run.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{SyncCoordinator, SyncUpdate};
//! use std::sync::Arc;
//!
//! # async fn example(coordinator: Arc<SyncCoordinator>) -> core_sync::Result<()> {
//! let mut handle = coordinator.run_now("git").await?;
//! while let Some(update) = handle.recv().await {
//!     println!("{:?}", update);
//! }
//!
//! // Daily background run at the configured time of day
//! coordinator.schedule_daily("git".to_string()).await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    job::{SyncJob, SyncJobId, SyncTrigger},
    pipeline::SyncPipeline,
    repository::SyncJobRepository,
    schedule::{backoff_delay, delay_until_next},
    update::{SyncUpdate, UpdateSink},
    Result, SyncError,
};
use bridge_traits::background::{
    job_handler, ExistingWorkPolicy, JobContext, JobOutcome, JobScheduler, WorkRequest,
};
use chrono::Local;
use core_runtime::config::SyncSettings;
use core_runtime::events::EventBus;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Name of the scheduled work for `source`
pub fn scheduled_work_name(source: &str) -> String {
    format!("sync:{}", source)
}

// ============================================================================
// Handles and outcomes
// ============================================================================

/// A run started by [`SyncCoordinator::run_now`].
///
/// Updates arrive in order: `Started`, any number of `Progress`, `Retrying`
/// and `Started` again for every retry, then exactly one terminal update.
#[derive(Debug)]
pub struct SyncHandle {
    source: String,
    updates: mpsc::UnboundedReceiver<SyncUpdate>,
    cancel: CancellationToken,
}

impl SyncHandle {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Next update, `None` once the run is over and the stream drained.
    pub async fn recv(&mut self) -> Option<SyncUpdate> {
        self.updates.recv().await
    }

    /// Ask the run to stop at the next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal update, discarding everything before it.
    pub async fn wait(mut self) -> Option<SyncUpdate> {
        let mut last = None;
        while let Some(update) = self.updates.recv().await {
            if update.is_terminal() {
                last = Some(update);
            }
        }
        last
    }
}

/// Result of a finished run: the last attempt's job and its terminal update.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub job: SyncJob,
    pub update: SyncUpdate,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.update, SyncUpdate::Succeeded { .. })
    }

    pub fn message(&self) -> &str {
        match &self.update {
            SyncUpdate::Succeeded { message, .. }
            | SyncUpdate::Failed { message, .. }
            | SyncUpdate::Cancelled { message } => message,
            _ => "",
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveRun {
    /// Job record of the current attempt
    job_id: Option<SyncJobId>,
    cancel: CancellationToken,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct SyncCoordinator {
    pipeline: Arc<SyncPipeline>,
    events: EventBus,
    settings: SyncSettings,
    scheduler: Option<Arc<dyn JobScheduler>>,
    /// Ownership token per source, held for the whole run
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl SyncCoordinator {
    pub fn new(
        pipeline: Arc<SyncPipeline>,
        events: EventBus,
        settings: SyncSettings,
        scheduler: Option<Arc<dyn JobScheduler>>,
    ) -> Self {
        Self {
            pipeline,
            events,
            settings,
            scheduler,
            locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn jobs(&self) -> &Arc<dyn SyncJobRepository> {
        self.pipeline.jobs()
    }

    async fn source_lock(&self, source: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(source.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn try_acquire(&self, source: &str) -> Result<OwnedMutexGuard<()>> {
        self.source_lock(source)
            .await
            .try_lock_owned()
            .map_err(|_| SyncError::SyncInProgress {
                src: source.to_string(),
            })
    }

    async fn register(&self, source: &str, cancel: &CancellationToken) {
        self.active.lock().await.insert(
            source.to_string(),
            ActiveRun {
                job_id: None,
                cancel: cancel.clone(),
            },
        );
    }

    async fn set_current_job(&self, source: &str, job_id: SyncJobId) {
        if let Some(run) = self.active.lock().await.get_mut(source) {
            run.job_id = Some(job_id);
        }
    }

    async fn unregister(&self, source: &str) {
        self.active.lock().await.remove(source);
    }

    /// Start a run for `source` in the background.
    ///
    /// # Errors
    ///
    /// `SyncInProgress` when a run or flush already owns the source.
    #[instrument(skip(self))]
    pub async fn run_now(self: &Arc<Self>, source: &str) -> Result<SyncHandle> {
        let guard = self.try_acquire(source).await?;

        let cancel = CancellationToken::new();
        self.register(source, &cancel).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = UpdateSink::new(source, self.events.clone(), Some(tx));

        info!(source = %source, "Starting sync");

        let this = Arc::clone(self);
        let task_source = source.to_string();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = this
                .run_with_retries(&task_source, SyncTrigger::RunNow, &task_cancel, &sink)
                .await;
            this.unregister(&task_source).await;
            debug!(source = %task_source, success = outcome.is_success(), "Sync task finished");
        });

        Ok(SyncHandle {
            source: source.to_string(),
            updates: rx,
            cancel,
        })
    }

    /// Run for `source` as the scheduled trigger, waiting for a run that
    /// already owns the source to finish first.
    #[instrument(skip(self, updates))]
    pub async fn run_scheduled(
        &self,
        source: &str,
        updates: Option<mpsc::UnboundedSender<SyncUpdate>>,
    ) -> SyncOutcome {
        let _guard = self.source_lock(source).await.lock_owned().await;

        let cancel = CancellationToken::new();
        self.register(source, &cancel).await;

        let sink = UpdateSink::new(source, self.events.clone(), updates);
        let outcome = self
            .run_with_retries(source, SyncTrigger::Scheduled, &cancel, &sink)
            .await;

        self.unregister(source).await;
        outcome
    }

    /// Push pending transactions for `source` without fetching. No retries.
    ///
    /// # Errors
    ///
    /// `SyncInProgress` when a run already owns the source.
    #[instrument(skip(self))]
    pub async fn flush(&self, source: &str) -> Result<SyncOutcome> {
        let _guard = self.try_acquire(source).await?;

        let cancel = CancellationToken::new();
        self.register(source, &cancel).await;

        let sink = UpdateSink::events_only(source, self.events.clone());
        let job = SyncJob::new(source, SyncTrigger::RunNow);
        self.set_current_job(source, job.id).await;
        sink.send(
            &job,
            SyncUpdate::Started {
                job_id: job.id,
                trigger: job.trigger,
                attempt: job.attempt,
            },
        );

        let (finished, result) = self
            .pipeline
            .run_drain_only(job, &cancel, &sink, self.settings.run_timeout)
            .await;
        let update = terminal_update(&finished, result);
        sink.send(&finished, update.clone());

        self.unregister(source).await;
        Ok(SyncOutcome {
            job: finished,
            update,
        })
    }

    async fn run_with_retries(
        &self,
        source: &str,
        trigger: SyncTrigger,
        cancel: &CancellationToken,
        sink: &UpdateSink,
    ) -> SyncOutcome {
        let mut job = SyncJob::new(source, trigger);

        loop {
            self.set_current_job(source, job.id).await;
            sink.send(
                &job,
                SyncUpdate::Started {
                    job_id: job.id,
                    trigger,
                    attempt: job.attempt,
                },
            );

            let (finished, result) = self
                .pipeline
                .run(job, cancel, sink, self.settings.run_timeout)
                .await;

            let error = match result {
                Err(e) if e.is_transient() && !cancel.is_cancelled() => e,
                other => {
                    let update = terminal_update(&finished, other);
                    sink.send(&finished, update.clone());
                    return SyncOutcome {
                        job: finished,
                        update,
                    };
                }
            };

            if finished.attempt >= self.settings.max_retries {
                error!(
                    source = %source,
                    attempts = finished.attempt + 1,
                    error = %error,
                    "Sync failed, retries exhausted"
                );
                let update = SyncUpdate::Failed {
                    message: error.to_string(),
                    recoverable: true,
                };
                sink.send(&finished, update.clone());
                return SyncOutcome {
                    job: finished,
                    update,
                };
            }

            let delay = backoff_delay(
                self.settings.initial_backoff,
                self.settings.max_backoff,
                finished.attempt,
            );
            warn!(
                source = %source,
                attempt = finished.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Sync failed, retrying"
            );
            sink.send(
                &finished,
                SyncUpdate::Retrying {
                    attempt: finished.attempt + 1,
                    delay,
                    message: error.to_string(),
                },
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    let update = SyncUpdate::Cancelled {
                        message: "cancelled before retry".to_string(),
                    };
                    sink.send(&finished, update.clone());
                    return SyncOutcome { job: finished, update };
                }
                _ = tokio::time::sleep(delay) => {}
            }

            job = finished.retry_of();
        }
    }

    /// Cancel the run owning `source`. Returns `false` when nothing runs.
    pub async fn cancel(&self, source: &str) -> bool {
        match self.active.lock().await.get(source) {
            Some(run) => {
                info!(source = %source, "Cancelling sync");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the run whose current attempt is `job_id`.
    ///
    /// # Errors
    ///
    /// `JobNotFound` when no active run has that job.
    pub async fn cancel_job(&self, job_id: SyncJobId) -> Result<()> {
        let active = self.active.lock().await;
        let run = active
            .values()
            .find(|run| run.job_id == Some(job_id))
            .ok_or_else(|| SyncError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        run.cancel.cancel();
        info!(job_id = %job_id, "Sync job cancelled");
        Ok(())
    }

    pub async fn is_active(&self, source: &str) -> bool {
        self.active.lock().await.contains_key(source)
    }

    /// Sources with a run in progress, sorted.
    pub async fn active_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.active.lock().await.keys().cloned().collect();
        sources.sort();
        sources
    }

    pub async fn job(&self, job_id: &SyncJobId) -> Result<Option<SyncJob>> {
        self.jobs().find_by_id(job_id).await
    }

    pub async fn latest_job(&self, source: &str) -> Result<Option<SyncJob>> {
        self.jobs().find_latest_by_source(source).await
    }

    /// Most recent jobs of `source` first.
    pub async fn history(&self, source: &str, limit: u32) -> Result<Vec<SyncJob>> {
        self.jobs().get_history(source, limit).await
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Enqueue the next daily run of `source` with the host scheduler.
    ///
    /// The run starts at the configured time of day under the scheduled
    /// constraints and always requeues itself, whatever its outcome.
    /// Returns `false` without a scheduler.
    pub fn schedule_daily(self: &Arc<Self>, source: String) -> BoxFuture<'static, Result<bool>> {
        let this = Arc::clone(self);
        async move {
            let scheduler = match &this.scheduler {
                Some(scheduler) => Arc::clone(scheduler),
                None => {
                    debug!(source = %source, "No job scheduler, daily sync not scheduled");
                    return Ok(false);
                }
            };

            let delay = delay_until_next(this.settings.daily_sync_time, Local::now().naive_local());
            let request = WorkRequest::new(scheduled_work_name(&source))
                .with_constraints(this.settings.scheduled_constraints.clone())
                .with_initial_delay(delay)
                .with_policy(ExistingWorkPolicy::Replace)
                .with_tag("sync");

            let handler_owner = Arc::clone(&this);
            let handler_source = source.clone();
            let handler = job_handler(move |ctx: JobContext| {
                let this = Arc::clone(&handler_owner);
                let source = handler_source.clone();
                async move { this.scheduled_run(ctx, source).await }
            });

            let queued = scheduler.enqueue_unique(request, handler).await?;
            info!(
                source = %source,
                delay_secs = delay.as_secs(),
                queued,
                "Daily sync scheduled"
            );
            Ok(queued)
        }
        .boxed()
    }

    async fn scheduled_run(self: Arc<Self>, ctx: JobContext, source: String) -> JobOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = self.run_scheduled(&source, Some(tx));
        let report = async {
            while let Some(update) = rx.recv().await {
                if let SyncUpdate::Progress {
                    phase, message, ..
                } = &update
                {
                    ctx.report_progress(&format!("{}: {}", phase, message));
                }
            }
        };
        let (outcome, ()) = tokio::join!(run, report);

        if let Err(e) = self.schedule_daily(source.clone()).await {
            error!(source = %source, error = %e, "Failed to requeue daily sync");
        }

        if outcome.is_success() {
            JobOutcome::success(outcome.message())
        } else {
            JobOutcome::failure(outcome.message())
        }
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("settings", &self.settings)
            .field("has_scheduler", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

/// Terminal update for a finished attempt that is not retried.
fn terminal_update(job: &SyncJob, result: Result<()>) -> SyncUpdate {
    match result {
        Ok(()) => SyncUpdate::Succeeded {
            message: job
                .status_message
                .clone()
                .unwrap_or_else(|| "0/0 applied".to_string()),
            stats: job.stats,
        },
        Err(SyncError::Cancelled) => SyncUpdate::Cancelled {
            message: job
                .status_message
                .clone()
                .unwrap_or_else(|| "cancelled".to_string()),
        },
        Err(e) => SyncUpdate::Failed {
            message: e.to_string(),
            recoverable: e.is_transient(),
        },
    }
}
