//! # Sync Job State Machine
//!
//! Lifecycle of one sync pipeline run for one source, with validated phase
//! transitions. Every run is recorded in the `sync_jobs` history table.
//!
//! ## State Machine
//!
//! ```text
//! Idle → Fetching → Indexing → DrainingTransactions → Success
//!   │        │                          ↑
//!   │        └──────────────────────────┤
//!   └───────────────────────────────────┘
//!
//! any non-terminal phase → Failed | Cancelled
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{SyncJob, SyncTrigger};
//!
//! let job = SyncJob::new("git", SyncTrigger::RunNow);
//! let mut job = job.begin_fetch()?;
//! job.update_progress(120, Some(400), "Fetching library")?;
//! let job = job.begin_indexing()?.begin_draining()?;
//! let job = job.succeed("3/3 applied")?;
//! ```

use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncJobId(Uuid);

impl SyncJobId {
    /// Create a new random sync job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a sync job ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidJobId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SyncJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Phase and Trigger
// ============================================================================

/// Where a sync run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Created, not started
    Idle,
    /// Fetching the remote library and playlists
    Fetching,
    /// Rebuilding the search index
    Indexing,
    /// Pushing pending transactions to the backend
    DrainingTransactions,
    Success,
    Failed,
    Cancelled,
}

impl SyncPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Success | SyncPhase::Failed | SyncPhase::Cancelled
        )
    }

    /// Started and not finished
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SyncPhase::Fetching | SyncPhase::Indexing | SyncPhase::DrainingTransactions
        )
    }

    /// Get the string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Indexing => "indexing",
            SyncPhase::DrainingTransactions => "draining",
            SyncPhase::Success => "success",
            SyncPhase::Failed => "failed",
            SyncPhase::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SyncPhase {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(SyncPhase::Idle),
            "fetching" => Ok(SyncPhase::Fetching),
            "indexing" => Ok(SyncPhase::Indexing),
            "draining" => Ok(SyncPhase::DrainingTransactions),
            "success" => Ok(SyncPhase::Success),
            "failed" => Ok(SyncPhase::Failed),
            "cancelled" => Ok(SyncPhase::Cancelled),
            _ => Err(SyncError::InvalidPhase(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What started a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// User asked for it; relaxed constraints, fails fast when busy
    RunNow,
    /// Daily run; waits for a busy source and always requeues itself
    Scheduled,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::RunNow => "run_now",
            SyncTrigger::Scheduled => "scheduled",
        }
    }
}

impl FromStr for SyncTrigger {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "run_now" => Ok(SyncTrigger::RunNow),
            "scheduled" => Ok(SyncTrigger::Scheduled),
            _ => Err(SyncError::InvalidTrigger(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Progress Types
// ============================================================================

/// Progress of the current phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub processed: u64,
    /// Unknown while fetching
    pub total: Option<u64>,
    /// Progress percentage (0-100)
    pub percent: u8,
    pub message: String,
}

impl SyncProgress {
    pub fn update(&mut self, processed: u64, total: Option<u64>, message: &str) {
        self.processed = processed;
        self.total = total;
        self.message = message.to_string();

        // Calculate percentage (cap at 100)
        self.percent = match total {
            Some(total) if total > 0 => {
                ((processed as f64 / total as f64) * 100.0).min(100.0) as u8
            }
            _ => 0,
        };
    }
}

/// Outcome counters of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobStats {
    pub entries_added: u64,
    pub entries_updated: u64,
    pub entries_deleted: u64,
    /// Playlists and playlist entries touched by reconciliation
    pub playlists_changed: u64,
    pub transactions_applied: u64,
    /// Still queued when the run ended
    pub transactions_pending: u64,
}

impl SyncJobStats {
    pub fn library_changes(&self) -> u64 {
        self.entries_added + self.entries_updated + self.entries_deleted
    }
}

// ============================================================================
// Sync Job Entity
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: SyncJobId,
    /// Backend source being synced
    pub source: String,
    pub trigger: SyncTrigger,
    pub phase: SyncPhase,
    /// 0 for the first attempt, incremented on every retry
    pub attempt: u32,
    pub progress: SyncProgress,
    pub stats: SyncJobStats,
    /// Final human readable status, e.g. "processing stopped, 1/3 applied"
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl SyncJob {
    /// Create a new job in `Idle` phase
    pub fn new(source: impl Into<String>, trigger: SyncTrigger) -> Self {
        Self {
            id: SyncJobId::new(),
            source: source.into(),
            trigger,
            phase: SyncPhase::Idle,
            attempt: 0,
            progress: SyncProgress::default(),
            stats: SyncJobStats::default(),
            status_message: None,
            error_message: None,
            created_at: current_timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Fresh job record for the next attempt of the same run
    pub fn retry_of(&self) -> Self {
        let mut job = Self::new(self.source.clone(), self.trigger);
        job.attempt = self.attempt + 1;
        job
    }

    pub fn begin_fetch(self) -> Result<Self> {
        self.enter(SyncPhase::Fetching, "Fetching remote state")
    }

    pub fn begin_indexing(self) -> Result<Self> {
        self.enter(SyncPhase::Indexing, "Rebuilding search index")
    }

    pub fn begin_draining(self) -> Result<Self> {
        self.enter(SyncPhase::DrainingTransactions, "Applying pending transactions")
    }

    fn enter(mut self, phase: SyncPhase, message: &str) -> Result<Self> {
        self.validate_transition(phase)?;
        self.phase = phase;
        if self.started_at.is_none() {
            self.started_at = Some(current_timestamp());
        }
        self.progress = SyncProgress::default();
        self.progress.message = message.to_string();
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns an error if the job is not running
    pub fn update_progress(&mut self, processed: u64, total: Option<u64>, message: &str) -> Result<()> {
        if !self.phase.is_running() {
            return Err(SyncError::InvalidStateTransition {
                from: self.phase.as_str().to_string(),
                to: "update_progress".to_string(),
                reason: "Job must be running to update progress".to_string(),
            });
        }

        self.progress.update(processed, total, message);
        Ok(())
    }

    pub fn succeed(mut self, status_message: impl Into<String>) -> Result<Self> {
        self.validate_transition(SyncPhase::Success)?;
        self.phase = SyncPhase::Success;
        self.completed_at = Some(current_timestamp());
        self.status_message = Some(status_message.into());
        self.progress.percent = 100;
        Ok(self)
    }

    pub fn fail(mut self, error_message: impl Into<String>) -> Result<Self> {
        self.validate_transition(SyncPhase::Failed)?;
        let message = error_message.into();
        self.phase = SyncPhase::Failed;
        self.completed_at = Some(current_timestamp());
        self.status_message = Some(message.clone());
        self.error_message = Some(message);
        Ok(self)
    }

    pub fn cancel(mut self, status_message: impl Into<String>) -> Result<Self> {
        self.validate_transition(SyncPhase::Cancelled)?;
        self.phase = SyncPhase::Cancelled;
        self.completed_at = Some(current_timestamp());
        self.status_message = Some(status_message.into());
        Ok(self)
    }

    /// Returns None if the job hasn't started or completed yet
    pub fn duration_secs(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).max(0) as u64),
            _ => None,
        }
    }

    fn validate_transition(&self, to: SyncPhase) -> Result<()> {
        use SyncPhase::*;

        let valid = match (self.phase, to) {
            (Idle, Fetching) | (Idle, DrainingTransactions) => true,
            (Fetching, Indexing) | (Fetching, DrainingTransactions) => true,
            (Indexing, DrainingTransactions) => true,
            (DrainingTransactions, Success) => true,

            // Terminal states cannot transition
            (Success | Failed | Cancelled, _) => false,

            (_, Failed) | (_, Cancelled) => true,

            _ => false,
        };

        if !valid {
            return Err(SyncError::InvalidStateTransition {
                from: self.phase.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!(
                    "Cannot transition from {} to {}",
                    self.phase.as_str(),
                    to.as_str()
                ),
            });
        }

        Ok(())
    }
}

/// Current Unix timestamp in seconds
fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_job_id_from_string() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id = SyncJobId::from_string(uuid_str).unwrap();
        assert_eq!(id.as_str(), uuid_str);
        assert!(SyncJobId::from_string("not-a-uuid").is_err());
        assert_ne!(SyncJobId::new(), SyncJobId::new());
    }

    #[test]
    fn test_phase_strings() {
        for phase in [
            SyncPhase::Idle,
            SyncPhase::Fetching,
            SyncPhase::Indexing,
            SyncPhase::DrainingTransactions,
            SyncPhase::Success,
            SyncPhase::Failed,
            SyncPhase::Cancelled,
        ] {
            assert_eq!(phase.as_str().parse::<SyncPhase>().unwrap(), phase);
        }
        assert!("paused".parse::<SyncPhase>().is_err());
        assert_eq!("SCHEDULED".parse::<SyncTrigger>().unwrap(), SyncTrigger::Scheduled);
    }

    #[test]
    fn test_full_lifecycle() {
        let job = SyncJob::new("git", SyncTrigger::RunNow);
        assert_eq!(job.phase, SyncPhase::Idle);
        assert!(job.started_at.is_none());

        let mut job = job.begin_fetch().unwrap();
        assert!(job.started_at.is_some());
        job.update_progress(50, Some(200), "Fetching library").unwrap();
        assert_eq!(job.progress.percent, 25);

        let job = job.begin_indexing().unwrap().begin_draining().unwrap();
        let job = job.succeed("2/2 applied").unwrap();

        assert_eq!(job.phase, SyncPhase::Success);
        assert_eq!(job.progress.percent, 100);
        assert_eq!(job.status_message.as_deref(), Some("2/2 applied"));
        assert!(job.duration_secs().is_some());
    }

    #[test]
    fn test_drain_only_lifecycle() {
        let job = SyncJob::new("local", SyncTrigger::Scheduled)
            .begin_draining()
            .unwrap();
        assert_eq!(job.phase, SyncPhase::DrainingTransactions);
        assert!(job.succeed("0/0 applied").is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        let job = SyncJob::new("git", SyncTrigger::RunNow);
        assert!(job.clone().begin_indexing().is_err());
        assert!(job.clone().succeed("done").is_err());

        let mut idle = job.clone();
        assert!(idle.update_progress(1, None, "nope").is_err());

        let failed = job.begin_fetch().unwrap().fail("offline").unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("offline"));
        assert!(failed.clone().cancel("late").is_err());
        assert!(failed.begin_fetch().is_err());
    }

    #[test]
    fn test_cancel_from_any_running_phase() {
        let job = SyncJob::new("git", SyncTrigger::RunNow)
            .begin_fetch()
            .unwrap()
            .cancel("cancelled by user")
            .unwrap();
        assert_eq!(job.phase, SyncPhase::Cancelled);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_retry_of_increments_attempt() {
        let job = SyncJob::new("git", SyncTrigger::Scheduled);
        let retry = job.retry_of().retry_of();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.trigger, SyncTrigger::Scheduled);
        assert_ne!(retry.id, job.id);
    }

    #[test]
    fn test_progress_without_total() {
        let mut progress = SyncProgress::default();
        progress.update(10, None, "Fetching");
        assert_eq!(progress.percent, 0);
        progress.update(10, Some(5), "Draining");
        assert_eq!(progress.percent, 100);
    }
}
