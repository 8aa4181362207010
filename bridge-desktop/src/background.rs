//! Background Job Queue Implementation

use async_trait::async_trait;
use bridge_traits::{
    background::{
        ExistingWorkPolicy, JobContext, JobHandler, JobInfo, JobScheduler, JobState,
        WorkConstraints, WorkRequest,
    },
    device::DeviceMonitor,
    error::{BridgeError, Result},
    time::{Clock, SystemClock},
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_CONSTRAINT_POLL: Duration = Duration::from_secs(5);

type JobTable = Arc<RwLock<HashMap<String, JobEntry>>>;

/// Tokio-based job queue for desktop.
///
/// Each enqueued request runs on its own task: wait for the initial delay,
/// wait until the constraints hold, then run the handler once. Entries are
/// tagged with a generation so a superseded run never overwrites the state
/// of the request that replaced it.
pub struct TokioJobScheduler {
    jobs: JobTable,
    device_monitor: Option<Arc<dyn DeviceMonitor>>,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
    constraint_poll: Duration,
}

struct JobEntry {
    generation: u64,
    /// Generation of a run that was still executing when this entry
    /// replaced it. Its outcome is recorded here once it finishes.
    replaced_running: Option<u64>,
    info: JobInfo,
    progress: Arc<StdMutex<Option<String>>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct RunSpec {
    name: String,
    generation: u64,
    delay: Duration,
    constraints: WorkConstraints,
    handler: JobHandler,
    cancel: CancellationToken,
    progress: Arc<StdMutex<Option<String>>>,
}

impl TokioJobScheduler {
    /// Create a job queue with no device monitoring.
    pub fn new() -> Self {
        Self::with_device_monitor(None)
    }

    /// Create a job queue with an optional device monitor.
    pub fn with_device_monitor(monitor: Option<Arc<dyn DeviceMonitor>>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_device_monitor_and_clock(monitor, clock)
    }

    /// Create a job queue with an optional device monitor and custom clock.
    pub fn with_device_monitor_and_clock(
        monitor: Option<Arc<dyn DeviceMonitor>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            device_monitor: monitor,
            clock,
            generation: AtomicU64::new(1),
            constraint_poll: DEFAULT_CONSTRAINT_POLL,
        }
    }

    /// How often blocked work re-checks its constraints.
    pub fn with_constraint_poll(mut self, poll: Duration) -> Self {
        self.constraint_poll = poll;
        self
    }

    fn duration_to_millis(duration: Duration) -> i64 {
        duration.as_millis().min(i64::MAX as u128) as i64
    }

    async fn constraints_satisfied(
        monitor: Option<Arc<dyn DeviceMonitor>>,
        constraints: &WorkConstraints,
    ) -> bool {
        if *constraints == WorkConstraints::relaxed() {
            return true;
        }

        match monitor {
            Some(monitor) => match monitor.conditions().await {
                Ok(conditions) => constraints.satisfied_by(&conditions),
                Err(err) => {
                    warn!("Device monitor error: {}", err);
                    false
                }
            },
            None => {
                warn!("Constraints requested but no device monitor provided; assuming satisfied");
                true
            }
        }
    }

    /// Apply `update` only if the entry still belongs to `generation`.
    async fn update_if_current<F>(jobs: &JobTable, name: &str, generation: u64, update: F) -> bool
    where
        F: FnOnce(&mut JobEntry),
    {
        let mut jobs = jobs.write().await;
        match jobs.get_mut(name) {
            Some(entry) if entry.generation == generation => {
                update(entry);
                true
            }
            _ => false,
        }
    }

    async fn run_job(
        jobs: JobTable,
        spec: RunSpec,
        monitor: Option<Arc<dyn DeviceMonitor>>,
        clock: Arc<dyn Clock>,
        poll: Duration,
    ) {
        let RunSpec {
            name,
            generation,
            delay,
            constraints,
            handler,
            cancel,
            progress,
        } = spec;

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }

        loop {
            if Self::constraints_satisfied(monitor.clone(), &constraints).await {
                break;
            }

            debug!(job = %name, "Constraints not satisfied; waiting");
            Self::update_if_current(&jobs, &name, generation, |entry| {
                entry.info.state = JobState::Blocked;
            })
            .await;

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(poll) => {}
            }
        }

        // Checked under the table lock so a concurrent cancel either wins
        // before the handler starts or not at all.
        let started = {
            let mut table = jobs.write().await;
            match table.get_mut(&name) {
                Some(entry) if entry.generation == generation && !cancel.is_cancelled() => {
                    entry.info.state = JobState::Running;
                    entry.info.next_run = None;
                    true
                }
                _ => false,
            }
        };
        if !started {
            return;
        }

        let sink = Arc::clone(&progress);
        let ctx = JobContext::new(
            name.clone(),
            Arc::new(move |text: &str| {
                if let Ok(mut slot) = sink.lock() {
                    *slot = Some(text.to_string());
                }
            }),
        );

        debug!(job = %name, "Running job handler");
        let outcome = handler(ctx).await;

        if outcome.success {
            info!(job = %name, status = %outcome.status, "Job succeeded");
        } else {
            warn!(job = %name, status = %outcome.status, "Job failed");
        }

        let finished_at = clock.unix_timestamp_millis();
        let mut table = jobs.write().await;
        match table.get_mut(&name) {
            Some(entry) if entry.generation == generation => {
                entry.info.state = if outcome.success {
                    JobState::Succeeded
                } else {
                    JobState::Failed
                };
                entry.info.status = Some(outcome.status);
                entry.info.last_run = Some(finished_at);
            }
            Some(entry) if entry.replaced_running == Some(generation) => {
                // Requeued while running: keep the successor pending
                entry.info.status = Some(outcome.status);
                entry.info.last_run = Some(finished_at);
                entry.replaced_running = None;
            }
            _ => debug!(job = %name, generation, "Outcome of superseded run dropped"),
        }
    }

    fn snapshot(entry: &JobEntry) -> JobInfo {
        let mut info = entry.info.clone();
        if let Ok(progress) = entry.progress.lock() {
            info.progress = progress.clone();
        }
        info
    }
}

impl Default for TokioJobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobScheduler for TokioJobScheduler {
    async fn enqueue_unique(&self, request: WorkRequest, handler: JobHandler) -> Result<bool> {
        let mut jobs = self.jobs.write().await;

        let mut last_run = None;
        let mut status = None;
        let mut replaced_running = None;
        if let Some(existing) = jobs.get_mut(&request.name) {
            if !existing.info.state.is_finished() {
                match request.policy {
                    ExistingWorkPolicy::Keep => {
                        debug!(job = %request.name, "Work already pending; keeping existing");
                        return Ok(false);
                    }
                    ExistingWorkPolicy::Replace => {
                        debug!(job = %request.name, state = %existing.info.state, "Replacing pending work");
                        existing.cancel.cancel();
                        existing.handle.take();
                        replaced_running = if existing.info.state == JobState::Running {
                            Some(existing.generation)
                        } else {
                            existing.replaced_running
                        };
                    }
                }
            }
            last_run = existing.info.last_run;
            status = existing.info.status.clone();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let progress = Arc::new(StdMutex::new(None));
        let now = self.clock.unix_timestamp_millis();

        debug!(
            job = %request.name,
            delay_secs = request.initial_delay.as_secs(),
            generation,
            "Enqueuing unique work"
        );

        let spec = RunSpec {
            name: request.name.clone(),
            generation,
            delay: request.initial_delay,
            constraints: request.constraints.clone(),
            handler,
            cancel: cancel.clone(),
            progress: Arc::clone(&progress),
        };

        let handle = tokio::spawn(Self::run_job(
            Arc::clone(&self.jobs),
            spec,
            self.device_monitor.clone(),
            Arc::clone(&self.clock),
            self.constraint_poll,
        ));

        jobs.insert(
            request.name.clone(),
            JobEntry {
                generation,
                replaced_running,
                info: JobInfo {
                    name: request.name,
                    state: JobState::Enqueued,
                    tags: request.tags,
                    status,
                    progress: None,
                    next_run: Some(now.saturating_add(Self::duration_to_millis(request.initial_delay))),
                    last_run,
                },
                progress,
                cancel,
                handle: Some(handle),
            },
        );

        Ok(true)
    }

    async fn cancel(&self, name: &str) -> Result<()> {
        debug!(job = %name, "Cancelling job");

        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(name)
            .ok_or_else(|| BridgeError::JobNotFound(name.to_string()))?;

        entry.cancel.cancel();
        if matches!(entry.info.state, JobState::Enqueued | JobState::Blocked) {
            entry.info.state = JobState::Cancelled;
            entry.info.next_run = None;
        }
        Ok(())
    }

    async fn job_info(&self, name: &str) -> Result<Option<JobInfo>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(name).map(Self::snapshot))
    }

    async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let jobs = self.jobs.read().await;
        let mut infos: Vec<JobInfo> = jobs.values().map(Self::snapshot).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}
