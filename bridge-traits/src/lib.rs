//! # Host Bridge Traits
//!
//! Host capabilities the sync engine needs but does not implement itself.
//!
//! ## Overview
//!
//! The transaction log and sync pipeline run inside a host application that
//! owns background scheduling and knows about the device (connectivity,
//! battery, storage). This crate defines that contract so the core stays
//! independent of any particular platform scheduler.
//!
//! ## Traits
//!
//! - [`JobScheduler`](background::JobScheduler) - Durable job queue: enqueue a
//!   uniquely named unit of work with constraints, an initial delay and an
//!   existing-work policy
//! - [`DeviceMonitor`](device::DeviceMonitor) - Network, battery and storage
//!   conditions used to evaluate [`WorkConstraints`](background::WorkConstraints)
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate |
//! |----------|---------------------|
//! | Desktop  | `bridge-desktop`    |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! convert platform errors into it and keep messages actionable.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so handles can be shared across
//! tokio tasks.

pub mod background;
pub mod device;
pub mod error;
pub mod time;

pub use error::BridgeError;

pub use background::{
    job_handler, ExistingWorkPolicy, JobContext, JobHandler, JobInfo, JobOutcome, JobScheduler,
    JobState, WorkConstraints, WorkRequest,
};
pub use device::{DeviceConditions, DeviceMonitor, NetworkStatus};
pub use time::{Clock, FixedClock, SystemClock};
