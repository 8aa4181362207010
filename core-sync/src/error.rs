use bridge_traits::error::BridgeError;
use core_library::LibraryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Sync already in progress for source {src}")]
    SyncInProgress { src: String },

    #[error("No backend registered for source {0}")]
    BackendNotFound(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Transaction {id} not found")]
    TransactionNotFound { id: i64 },

    #[error("{message}")]
    TransactionRejected {
        applied: usize,
        total: usize,
        message: String,
    },

    #[error("Search index rebuild failed: {0}")]
    Index(String),

    /// Run exceeded its time limit, in milliseconds
    #[error("Sync timeout after {0} ms")]
    Timeout(u64),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),

    #[error("Invalid sync phase: {0}")]
    InvalidPhase(String),

    #[error("Invalid sync trigger: {0}")]
    InvalidTrigger(String),

    #[error("Invalid transaction kind: {0}")]
    InvalidKind(String),

    #[error("Invalid transaction group: {0}")]
    InvalidGroup(String),

    #[error("Invalid transaction payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] BridgeError),
}

impl SyncError {
    /// Whether a later attempt of the same run can be expected to succeed.
    ///
    /// Network, database and timeout failures are transient. Rejected
    /// transactions, missing backends and state machine errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Backend(e) => e.is_transient(),
            SyncError::Timeout(_) | SyncError::Database(_) => true,
            SyncError::Library(LibraryError::Database(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failure talking to a backend outside of a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid backend settings: {0}")]
    InvalidSettings(String),

    #[error("Backend failure: {0}")]
    Other(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Network(_) | BackendError::Unavailable(_))
    }
}

/// Failure staging or committing a batch of edits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// The backend cannot express this edit. Terminal for the transaction.
    #[error("Unsupported by backend: {0}")]
    Unsupported(String),

    #[error("Rejected by backend: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Failure applying one transaction, locally or through its backend.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// Unknown kind or unparseable payload.
    #[error("unsupported transaction: {0}")]
    Unsupported(String),

    #[error("no backend registered for source {0}")]
    BackendNotFound(String),

    #[error("backend {backend} does not support {kind} for items from {arg_source}")]
    NotSupported {
        backend: String,
        kind: String,
        arg_source: String,
    },

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("local apply failed: {0}")]
    Library(#[from] LibraryError),
}
