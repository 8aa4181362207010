use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Library error: {0}")]
    Library(#[from] core_library::LibraryError),

    #[error("Backend error: {0}")]
    Backend(#[from] core_sync::BackendError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] core_sync::TransactionError),

    #[error("No backend registered for source {0}")]
    UnknownSource(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
