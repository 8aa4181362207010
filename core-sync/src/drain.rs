//! # Transaction Drain
//!
//! Pushes the pending transactions of one source to its backend, oldest
//! first, one batch per transaction.
//!
//! - A transaction the backend accepted is removed from the store
//! - The first failure is recorded on the transaction and ends the drain;
//!   later transactions may depend on it
//! - Cancellation is honoured between transactions, never in the middle of one

use crate::backend::BackendRegistry;
use crate::error::Result;
use crate::store::TransactionStore;
use core_runtime::events::{CoreEvent, EventBus, TransactionEvent};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transaction that stopped a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainFailure {
    pub transaction_id: i64,
    pub description: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub applied: usize,
    pub total: usize,
    pub failed: Option<DrainFailure>,
    /// Stopped by cancellation before the queue was empty
    pub stopped: bool,
}

impl DrainOutcome {
    /// `"N/M applied"`, or `"processing stopped, N/M applied"` after a
    /// cancellation.
    pub fn status(&self) -> String {
        if self.stopped {
            format!("processing stopped, {}/{} applied", self.applied, self.total)
        } else {
            format!("{}/{} applied", self.applied, self.total)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.applied == self.total
    }

    pub fn pending(&self) -> usize {
        self.total - self.applied
    }
}

pub struct TransactionDrainer {
    store: Arc<dyn TransactionStore>,
    backends: Arc<BackendRegistry>,
    events: EventBus,
}

impl TransactionDrainer {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        backends: Arc<BackendRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            backends,
            events,
        }
    }

    /// Apply the pending transactions of `source`. `progress` receives
    /// `(applied, total)` after every accepted transaction.
    pub async fn drain<P>(
        &self,
        source: &str,
        cancel: &CancellationToken,
        mut progress: P,
    ) -> Result<DrainOutcome>
    where
        P: FnMut(usize, usize) + Send,
    {
        let pending = self.store.list(Some(source), None).await?;
        let mut outcome = DrainOutcome {
            total: pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            debug!(source = %source, "No pending transactions");
            return Ok(outcome);
        }

        info!(source = %source, pending = outcome.total, "Draining transactions");
        progress(0, outcome.total);

        for tx in pending {
            if cancel.is_cancelled() {
                outcome.stopped = true;
                break;
            }

            match tx.apply(&self.backends).await {
                Ok(()) => {
                    self.store.remove(tx.id).await?;
                    outcome.applied += 1;
                    debug!(id = tx.id, kind = %tx.op.kind_str(), "Transaction applied");
                    let _ = self
                        .events
                        .emit(CoreEvent::Transaction(TransactionEvent::Applied {
                            transaction_id: tx.id,
                            source: tx.source.clone(),
                            kind: tx.op.kind_str().to_string(),
                        }));
                    progress(outcome.applied, outcome.total);
                }
                Err(e) => {
                    let message = e.to_string();
                    let failed = self.store.set_error(tx.id, &message).await?;
                    warn!(
                        id = tx.id,
                        kind = %tx.op.kind_str(),
                        error_count = failed.error_count,
                        error = %message,
                        "Transaction rejected, stopping drain"
                    );
                    let _ = self
                        .events
                        .emit(CoreEvent::Transaction(TransactionEvent::Failed {
                            transaction_id: tx.id,
                            source: tx.source.clone(),
                            kind: tx.op.kind_str().to_string(),
                            error_count: failed.error_count,
                            message: message.clone(),
                        }));
                    outcome.failed = Some(DrainFailure {
                        transaction_id: tx.id,
                        description: tx.describe(),
                        message,
                    });
                    break;
                }
            }
        }

        info!(source = %source, status = %outcome.status(), "Drain finished");
        Ok(outcome)
    }
}
