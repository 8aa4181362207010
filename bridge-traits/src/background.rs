//! Durable Job Queue
//!
//! Contract for scheduling named, uniquely keyed units of background work
//! (periodic library syncs, ad-hoc "sync now" requests, transaction drains).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::{device::DeviceConditions, device::NetworkStatus, error::Result};

/// Conditions that must hold before a unit of work may start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkConstraints {
    /// Require any network connection
    pub requires_network: bool,
    /// Refuse to start while the battery is reported low
    pub requires_battery_not_low: bool,
    /// Refuse to start while storage is reported low
    pub requires_storage_not_low: bool,
}

impl WorkConstraints {
    /// No constraints at all. Used for user-initiated work.
    pub fn relaxed() -> Self {
        Self {
            requires_network: false,
            requires_battery_not_low: false,
            requires_storage_not_low: false,
        }
    }

    /// Network plus healthy battery and storage. Used for periodic work.
    pub fn scheduled() -> Self {
        Self {
            requires_network: true,
            requires_battery_not_low: true,
            requires_storage_not_low: true,
        }
    }

    /// Check the constraints against a snapshot of device conditions.
    pub fn satisfied_by(&self, conditions: &DeviceConditions) -> bool {
        if self.requires_network && conditions.network != NetworkStatus::Connected {
            return false;
        }
        if self.requires_battery_not_low && conditions.battery_low {
            return false;
        }
        if self.requires_storage_not_low && conditions.storage_low {
            return false;
        }
        true
    }
}

impl Default for WorkConstraints {
    fn default() -> Self {
        Self {
            requires_network: true,
            requires_battery_not_low: false,
            requires_storage_not_low: false,
        }
    }
}

/// What to do when work with the same name is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistingWorkPolicy {
    /// Supersede the queued work. A handler that is already running is not
    /// interrupted, but its entry is taken over by the new request.
    Replace,
    /// Leave pending or running work alone and drop the new request.
    Keep,
}

/// A named unit of work to enqueue.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub name: String,
    pub constraints: WorkConstraints,
    pub initial_delay: Duration,
    pub policy: ExistingWorkPolicy,
    pub tags: Vec<String>,
}

impl WorkRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraints: WorkConstraints::default(),
            initial_delay: Duration::ZERO,
            policy: ExistingWorkPolicy::Keep,
            tags: Vec::new(),
        }
    }

    pub fn with_constraints(mut self, constraints: WorkConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_policy(mut self, policy: ExistingWorkPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Lifecycle of a queued unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for its initial delay to elapse
    Enqueued,
    /// Delay elapsed but constraints are not satisfied yet
    Blocked,
    /// Handler is executing
    Running,
    /// Handler reported success
    Succeeded,
    /// Handler reported failure
    Failed,
    /// Cancelled before the handler ran
    Cancelled,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Enqueued => "enqueued",
            JobState::Blocked => "blocked",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal result reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    /// Free-form status string shown to the user
    pub status: String,
}

impl JobOutcome {
    pub fn success(status: impl Into<String>) -> Self {
        Self {
            success: true,
            status: status.into(),
        }
    }

    pub fn failure(status: impl Into<String>) -> Self {
        Self {
            success: false,
            status: status.into(),
        }
    }
}

/// Snapshot of a queued or finished unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    pub state: JobState,
    pub tags: Vec<String>,
    /// Last terminal status string
    pub status: Option<String>,
    /// Last incremental progress string
    pub progress: Option<String>,
    /// Unix millis of the next planned start, if any
    pub next_run: Option<i64>,
    /// Unix millis of the last finished run, if any
    pub last_run: Option<i64>,
}

/// Handle given to a running handler.
#[derive(Clone)]
pub struct JobContext {
    name: String,
    progress: Arc<dyn Fn(&str) + Send + Sync>,
}

impl JobContext {
    pub fn new(name: impl Into<String>, progress: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            progress,
        }
    }

    /// Context whose progress reports go nowhere.
    pub fn detached(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(|_: &str| {}))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish an incremental progress string for this job.
    pub fn report_progress(&self, progress: &str) {
        (self.progress)(progress);
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub type JobHandler = Arc<dyn Fn(JobContext) -> BoxFuture<'static, JobOutcome> + Send + Sync>;

/// Box a closure into a [`JobHandler`].
pub fn job_handler<F, Fut>(handler: F) -> JobHandler
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    Arc::new(move |ctx| handler(ctx).boxed())
}

/// Durable job queue trait
///
/// Abstracts the host's background scheduler:
/// - **Android**: WorkManager unique work
/// - **Desktop**: in-process tokio scheduler (`bridge-desktop`)
///
/// Work is keyed by name. Enqueuing a name that is already pending is
/// resolved by the request's [`ExistingWorkPolicy`].
///
/// # Example
///
/// ```ignore
/// use bridge_traits::background::{job_handler, JobOutcome, JobScheduler, WorkRequest};
///
/// async fn schedule(scheduler: &dyn JobScheduler) -> Result<()> {
///     let request = WorkRequest::new("sync:git")
///         .with_initial_delay(Duration::from_secs(3600));
///     scheduler
///         .enqueue_unique(request, job_handler(|_ctx| async { JobOutcome::success("done") }))
///         .await?;
///     Ok(())
/// }
/// ```
#[async_trait::async_trait]
pub trait JobScheduler: Send + Sync {
    /// Enqueue uniquely named work.
    ///
    /// Returns `false` when the request was dropped because of
    /// [`ExistingWorkPolicy::Keep`].
    async fn enqueue_unique(&self, request: WorkRequest, handler: JobHandler) -> Result<bool>;

    /// Cancel work by name. Running handlers finish their current run.
    async fn cancel(&self, name: &str) -> Result<()>;

    /// Current snapshot of the named work.
    async fn job_info(&self, name: &str) -> Result<Option<JobInfo>>;

    /// All known work, finished entries included.
    async fn list_jobs(&self) -> Result<Vec<JobInfo>>;

    /// State of the named work, if known.
    async fn status(&self, name: &str) -> Result<Option<JobState>> {
        Ok(self.job_info(name).await?.map(|info| info.state))
    }

    /// Last progress string published by the named work.
    async fn progress(&self, name: &str) -> Result<Option<String>> {
        Ok(self.job_info(name).await?.and_then(|info| info.progress))
    }

    /// Check if background execution is available
    async fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn conditions(network: NetworkStatus, battery_low: bool, storage_low: bool) -> DeviceConditions {
        DeviceConditions {
            network,
            battery_low,
            storage_low,
        }
    }

    #[test]
    fn test_scheduled_constraints() {
        let constraints = WorkConstraints::scheduled();

        assert!(constraints.satisfied_by(&conditions(NetworkStatus::Connected, false, false)));
        assert!(!constraints.satisfied_by(&conditions(NetworkStatus::Disconnected, false, false)));
        assert!(!constraints.satisfied_by(&conditions(NetworkStatus::Connected, true, false)));
        assert!(!constraints.satisfied_by(&conditions(NetworkStatus::Connected, false, true)));
    }

    #[test]
    fn test_relaxed_constraints() {
        let constraints = WorkConstraints::relaxed();
        assert!(constraints.satisfied_by(&conditions(NetworkStatus::Indeterminate, true, true)));
    }

    #[test]
    fn test_work_request_builder() {
        let request = WorkRequest::new("sync:git")
            .with_initial_delay(Duration::from_secs(60))
            .with_policy(ExistingWorkPolicy::Replace)
            .with_tag("sync");

        assert_eq!(request.name, "sync:git");
        assert_eq!(request.initial_delay, Duration::from_secs(60));
        assert_eq!(request.policy, ExistingWorkPolicy::Replace);
        assert_eq!(request.tags, vec!["sync".to_string()]);
        assert!(request.constraints.requires_network);
    }

    #[tokio::test]
    async fn test_job_handler_receives_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = JobContext::new(
            "drain:local",
            Arc::new(move |p: &str| sink.lock().unwrap().push(p.to_string())),
        );

        let handler = job_handler(|ctx: JobContext| async move {
            ctx.report_progress("1/2");
            JobOutcome::success(format!("{} done", ctx.name()))
        });

        let outcome = handler(ctx).await;
        assert!(outcome.success);
        assert_eq!(outcome.status, "drain:local done");
        assert_eq!(*seen.lock().unwrap(), vec!["1/2".to_string()]);
    }

    #[test]
    fn test_job_state_finished() {
        assert!(JobState::Succeeded.is_finished());
        assert!(JobState::Cancelled.is_finished());
        assert!(!JobState::Blocked.is_finished());
        assert_eq!(JobState::Running.to_string(), "running");
    }
}
