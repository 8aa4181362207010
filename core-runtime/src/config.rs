//! # Core Configuration Module
//!
//! Provides configuration management for the library sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds the database location, the working directory handed
//! to backends, the sync schedule and retry policy, the per-backend settings
//! bundles and the host bridges used for background scheduling. It enforces
//! fail-fast validation so a bad schedule or a missing bridge is reported at
//! startup rather than on the first sync.
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `JobScheduler` - Durable job queue for daily syncs (desktop default:
//!   `TokioJobScheduler`)
//! - `DeviceMonitor` - Connectivity, battery and storage conditions
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{BackendSettings, CoreConfig};
//! use chrono::NaiveTime;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/library.db")
//!     .work_dir("/path/to/work")
//!     .daily_sync_time(NaiveTime::from_hms_opt(4, 30, 0).unwrap())
//!     .backend(BackendSettings::new("git", "git").with_setting("remote", "ssh://host/music.git"))
//!     .enable_scheduled_sync(true)
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::logging::{redact_settings, LoggingConfig};
use bridge_traits::{DeviceMonitor, JobScheduler, WorkConstraints};
use chrono::NaiveTime;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Core configuration for the library sync core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Directory backends may use for checkouts and caches
    pub work_dir: PathBuf,

    /// Schedule, retry and timeout policy for sync runs
    pub sync: SyncSettings,

    /// Settings bundles for each configured backend source
    pub backends: Vec<BackendSettings>,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Job queue for scheduled syncs (optional with desktop default)
    pub job_scheduler: Option<Arc<dyn JobScheduler>>,

    /// Device conditions monitor (optional)
    pub device_monitor: Option<Arc<dyn DeviceMonitor>>,

    /// Features flags
    pub features: FeatureFlags,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("work_dir", &self.work_dir)
            .field("sync", &self.sync)
            .field("backends", &self.backends)
            .field("logging", &self.logging)
            .field(
                "job_scheduler",
                &self.job_scheduler.as_ref().map(|_| "JobScheduler { ... }"),
            )
            .field(
                "device_monitor",
                &self.device_monitor.as_ref().map(|_| "DeviceMonitor { ... }"),
            )
            .field("features", &self.features)
            .finish()
    }
}

/// Feature flags control optional functionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Enqueue a daily sync per backend (requires JobScheduler)
    pub enable_scheduled_sync: bool,

    /// Rebuild the search index after each fetch
    pub enable_indexing: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_scheduled_sync: false,
            enable_indexing: true,
        }
    }
}

/// Schedule, retry and timeout policy for sync runs.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Local time of day the scheduled sync starts
    pub daily_sync_time: NaiveTime,

    /// Automatic job-level retries before a failure is surfaced
    pub max_retries: u32,

    /// Backoff before the first retry; doubles on every attempt
    pub initial_backoff: Duration,

    /// Upper bound for the backoff delay
    pub max_backoff: Duration,

    /// Upper bound for a whole pipeline run
    pub run_timeout: Duration,

    /// Constraints for scheduled runs. User-initiated runs start at once.
    pub scheduled_constraints: WorkConstraints,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            daily_sync_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            run_timeout: Duration::from_secs(1800),
            scheduled_constraints: WorkConstraints::scheduled(),
        }
    }
}

impl SyncSettings {
    /// Validates the retry and timeout policy
    pub fn validate(&self) -> Result<()> {
        if self.max_retries > 10 {
            return Err(Error::Config(
                "Max retries exceeds the maximum of 10".to_string(),
            ));
        }

        if self.initial_backoff.is_zero() {
            return Err(Error::Config(
                "Initial backoff must be greater than zero".to_string(),
            ));
        }

        if self.initial_backoff > self.max_backoff {
            return Err(Error::Config(format!(
                "Initial backoff ({:?}) exceeds max backoff ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }

        if self.run_timeout < Duration::from_secs(1) {
            return Err(Error::Config(
                "Run timeout must be at least one second".to_string(),
            ));
        }

        Ok(())
    }
}

/// Settings bundle for one backend source.
///
/// The bundle is handed verbatim to the backend adapter's `load_settings`.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendSettings {
    /// Source identifier used in EntryID/PlaylistID and transaction routing
    pub source: String,

    /// Adapter kind, e.g. "local", "git", "subsonic"
    pub kind: String,

    /// Free-form key/value settings
    pub settings: HashMap<String, String>,
}

impl BackendSettings {
    pub fn new(source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind: kind.into(),
            settings: HashMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("source", &self.source)
            .field("kind", &self.kind)
            .field("settings", &redact_settings(&self.settings))
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Settings bundle for a source, if configured.
    pub fn backend(&self, source: &str) -> Option<&BackendSettings> {
        self.backends.iter().find(|b| b.source == source)
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Paths are not empty
    /// - Sync policy is sane
    /// - Backend sources are non-empty and unique
    /// - Feature flags are consistent with available bridges
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.work_dir.as_os_str().is_empty() {
            return Err(Error::Config("Work directory cannot be empty".to_string()));
        }

        self.sync.validate()?;

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.source.trim().is_empty() {
                return Err(Error::Config("Backend source cannot be empty".to_string()));
            }
            if !seen.insert(backend.source.as_str()) {
                return Err(Error::Config(format!(
                    "Backend source '{}' configured more than once",
                    backend.source
                )));
            }
        }

        if self.features.enable_scheduled_sync && self.job_scheduler.is_none() {
            return Err(Error::CapabilityMissing {
                capability: "JobScheduler".to_string(),
                message: "Scheduled sync enabled but no JobScheduler provided. \
                          Desktop: enable the 'desktop-shims' feature to use TokioJobScheduler. \
                          Otherwise disable the feature or inject a JobScheduler implementation."
                    .to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_job_scheduler(
    monitor: Option<Arc<dyn DeviceMonitor>>,
) -> Option<Arc<dyn JobScheduler>> {
    use bridge_desktop::TokioJobScheduler;

    let scheduler: Arc<dyn JobScheduler> = Arc::new(TokioJobScheduler::with_device_monitor(monitor));
    Some(scheduler)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_job_scheduler(
    _monitor: Option<Arc<dyn DeviceMonitor>>,
) -> Option<Arc<dyn JobScheduler>> {
    None
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    sync: SyncSettings,
    backends: Vec<BackendSettings>,
    logging: Option<LoggingConfig>,
    job_scheduler: Option<Arc<dyn JobScheduler>>,
    device_monitor: Option<Arc<dyn DeviceMonitor>>,
    features: FeatureFlags,
}

impl CoreConfigBuilder {
    /// Sets the database path.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder()
    ///     .database_path("/path/to/library.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the working directory handed to backends.
    ///
    /// Defaults to a `work` directory next to the database.
    pub fn work_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.work_dir = Some(path.into());
        self
    }

    /// Sets the local time of day for the scheduled sync.
    pub fn daily_sync_time(mut self, time: NaiveTime) -> Self {
        self.sync.daily_sync_time = time;
        self
    }

    /// Sets the number of automatic job-level retries.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.sync.max_retries = retries;
        self
    }

    /// Sets the initial and maximum retry backoff.
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.sync.initial_backoff = initial;
        self.sync.max_backoff = max;
        self
    }

    /// Sets the timeout for a whole pipeline run.
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.sync.run_timeout = timeout;
        self
    }

    /// Replaces the whole sync policy.
    pub fn sync_settings(mut self, settings: SyncSettings) -> Self {
        self.sync = settings;
        self
    }

    /// Adds a backend settings bundle.
    pub fn backend(mut self, backend: BackendSettings) -> Self {
        self.backends.push(backend);
        self
    }

    /// Sets the logging configuration.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Sets the job queue implementation (optional).
    pub fn job_scheduler(mut self, scheduler: Arc<dyn JobScheduler>) -> Self {
        self.job_scheduler = Some(scheduler);
        self
    }

    /// Sets the device monitor implementation (optional).
    pub fn device_monitor(mut self, monitor: Arc<dyn DeviceMonitor>) -> Self {
        self.device_monitor = Some(monitor);
        self
    }

    /// Enables or disables the daily scheduled sync.
    ///
    /// Requires a `JobScheduler`. Default: false
    pub fn enable_scheduled_sync(mut self, enabled: bool) -> Self {
        self.features.enable_scheduled_sync = enabled;
        self
    }

    /// Enables or disables search index rebuilds.
    ///
    /// Default: true
    pub fn enable_indexing(mut self, enabled: bool) -> Self {
        self.features.enable_indexing = enabled;
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let config = CoreConfig::builder()
    ///     .database_path("/tmp/library.db")
    ///     .build()
    ///     .unwrap();
    /// assert!(config.work_dir.ends_with("work"));
    /// ```
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let work_dir = match self.work_dir {
            Some(dir) => dir,
            None => database_path
                .parent()
                .map(|parent| parent.join("work"))
                .unwrap_or_else(|| PathBuf::from("work")),
        };

        let job_scheduler = match self.job_scheduler {
            Some(scheduler) => Some(scheduler),
            None if self.features.enable_scheduled_sync => {
                provide_default_job_scheduler(self.device_monitor.clone())
            }
            None => None,
        };

        let config = CoreConfig {
            database_path,
            work_dir,
            sync: self.sync,
            backends: self.backends,
            logging: self.logging.unwrap_or_default(),
            job_scheduler,
            device_monitor: self.device_monitor,
            features: self.features,
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::background::{JobHandler, JobInfo, WorkRequest};
    use bridge_traits::BridgeError;

    struct NoopScheduler;

    #[async_trait::async_trait]
    impl JobScheduler for NoopScheduler {
        async fn enqueue_unique(
            &self,
            _request: WorkRequest,
            _handler: JobHandler,
        ) -> std::result::Result<bool, BridgeError> {
            Ok(true)
        }

        async fn cancel(&self, _name: &str) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        async fn job_info(&self, _name: &str) -> std::result::Result<Option<JobInfo>, BridgeError> {
            Ok(None)
        }

        async fn list_jobs(&self) -> std::result::Result<Vec<JobInfo>, BridgeError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_builder_defaults() {
        let config = CoreConfig::builder()
            .database_path("/data/library.db")
            .build()
            .unwrap();

        assert_eq!(config.work_dir, PathBuf::from("/data/work"));
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.scheduled_constraints, WorkConstraints::scheduled());
        assert!(config.features.enable_indexing);
        assert!(!config.features.enable_scheduled_sync);
        assert!(config.job_scheduler.is_none());
    }

    #[test]
    fn test_missing_database_path() {
        let err = CoreConfig::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("Database path")));
    }

    #[test]
    fn test_backoff_validation() {
        let err = CoreConfig::builder()
            .database_path("/data/library.db")
            .backoff(Duration::from_secs(600), Duration::from_secs(60))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("exceeds max backoff")));
    }

    #[test]
    fn test_duplicate_backend_rejected() {
        let err = CoreConfig::builder()
            .database_path("/data/library.db")
            .backend(BackendSettings::new("git", "git"))
            .backend(BackendSettings::new("git", "git"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("more than once")));
    }

    #[test]
    fn test_scheduled_sync_with_injected_scheduler() {
        let config = CoreConfig::builder()
            .database_path("/data/library.db")
            .job_scheduler(Arc::new(NoopScheduler))
            .enable_scheduled_sync(true)
            .daily_sync_time(NaiveTime::from_hms_opt(4, 30, 0).unwrap())
            .build()
            .unwrap();

        assert!(config.job_scheduler.is_some());
        assert_eq!(
            config.sync.daily_sync_time,
            NaiveTime::from_hms_opt(4, 30, 0).unwrap()
        );
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_scheduled_sync_requires_scheduler() {
        let err = CoreConfig::builder()
            .database_path("/data/library.db")
            .enable_scheduled_sync(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityMissing { capability, .. } if capability == "JobScheduler"));
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_scheduled_sync_uses_desktop_default() {
        let config = CoreConfig::builder()
            .database_path("/data/library.db")
            .enable_scheduled_sync(true)
            .build()
            .unwrap();
        assert!(config.job_scheduler.is_some());
    }

    #[test]
    fn test_backend_settings_lookup_and_redaction() {
        let config = CoreConfig::builder()
            .database_path("/data/library.db")
            .backend(
                BackendSettings::new("subsonic", "subsonic")
                    .with_setting("url", "https://music.local")
                    .with_setting("password", "hunter2"),
            )
            .build()
            .unwrap();

        let backend = config.backend("subsonic").unwrap();
        assert_eq!(backend.get("url"), Some("https://music.local"));

        let rendered = format!("{:?}", backend);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("hunter2"));
        assert!(config.backend("missing").is_none());
    }
}
