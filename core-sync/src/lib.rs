//! # Transaction Log & Sync Module
//!
//! Records local library edits as typed transactions and propagates them to
//! the backend that owns each source.
//!
//! ## Overview
//!
//! - Every edit is a [`Transaction`]: applied to the local projection right
//!   away, then queued in the [`TransactionStore`] until its backend accepts it
//! - A sync run fetches the remote state, reconciles the projection with it,
//!   replays edits that are still pending, rebuilds the search index and
//!   drains the queue in creation order
//! - At most one run per source; transient failures are retried with
//!   exponential backoff
//!
//! ## Components
//!
//! - **Transactions** (`transaction`): the closed set of edit kinds with their JSON args
//! - **Store** (`store`): durable queue with per-transaction error bookkeeping
//! - **Diff** (`diff`, `reconcile`): index diffs and projection reconciliation
//! - **Backends** (`backend`): adapter and batch contracts, registry, local-only backend
//! - **Sync Job State Machine** (`job`) and its history (`repository`)
//! - **Pipeline** (`pipeline`, `drain`): one fetch → index → drain run
//! - **Sync Coordinator** (`coordinator`): per-source ownership, retries, scheduling

pub mod backend;
pub mod coordinator;
pub mod diff;
pub mod drain;
pub mod error;
pub mod indexer;
pub mod job;
pub mod pipeline;
pub mod reconcile;
pub mod repository;
pub mod schedule;
pub mod store;
pub mod transaction;
pub mod update;

pub use backend::{AudioSource, BackendClient, BackendRegistry, Batch, LocalBackend};
pub use coordinator::{scheduled_work_name, SyncCoordinator, SyncHandle, SyncOutcome};
pub use diff::{diff, diff_by, edit_script, DiffResult, EditOp, EditScript};
pub use drain::{DrainFailure, DrainOutcome, TransactionDrainer};
pub use error::{BackendError, BatchError, Result, SyncError, TransactionError};
pub use indexer::{NoopIndexer, SearchIndexer};
pub use job::{SyncJob, SyncJobId, SyncJobStats, SyncPhase, SyncProgress, SyncTrigger};
pub use pipeline::SyncPipeline;
pub use reconcile::{FetchedState, ReconcileStats, ReplayOutcome};
pub use repository::{SqliteSyncJobRepository, SyncJobRepository};
pub use store::{SqliteTransactionStore, TransactionStore};
pub use transaction::{Transaction, TransactionGroup, TransactionKind, TransactionOp, ID_NONE};
pub use update::{SyncUpdate, UpdateSink};
