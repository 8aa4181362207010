//! # Event Bus System
//!
//! Broadcasts sync and transaction status to any number of observers using
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: `SyncEvent` (pipeline runs), `TransactionEvent`
//!   (the edit log), `LibraryEvent` (reconciliation results)
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! A single sync run also reports to its own ordered status channel (see
//! `core_sync::coordinator`). The bus is the fan-out view for UI layers that
//! want every source at once.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, TransactionEvent};
//!
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Transaction(TransactionEvent::Queued {
//!         transaction_id: 7,
//!         source: "git".to_string(),
//!         kind: "META_ADD".to_string(),
//!     }))
//!     .ok();
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Non-fatal; the subscriber keeps receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. Treat as shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Sync pipeline events
    Sync(SyncEvent),
    /// Transaction log events
    Transaction(TransactionEvent),
    /// Local projection events
    Library(LibraryEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Transaction(e) => e.description(),
            CoreEvent::Library(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Transaction(TransactionEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::IndexFailed { .. })
            | CoreEvent::Sync(SyncEvent::Retrying { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Completed { .. }) => EventSeverity::Info,
            CoreEvent::Library(LibraryEvent::Reconciled { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Source the event belongs to.
    pub fn source(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.source(),
            CoreEvent::Transaction(e) => e.source(),
            CoreEvent::Library(LibraryEvent::Reconciled { source, .. }) => source,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// Events emitted by a sync pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// Run accepted and started.
    Started {
        job_id: String,
        source: String,
        /// "run_now" or "scheduled"
        trigger: String,
    },
    /// Incremental progress inside a phase.
    Progress {
        job_id: String,
        source: String,
        /// Current phase (e.g., "fetching", "draining_transactions")
        phase: String,
        /// Human-readable status line
        message: String,
        processed: u64,
        total: Option<u64>,
    },
    /// Search index rebuild failed; the fetched data is kept.
    IndexFailed {
        job_id: String,
        source: String,
        message: String,
    },
    /// A transient failure will be retried after a backoff.
    Retrying {
        job_id: String,
        source: String,
        attempt: u32,
        delay_ms: u64,
        message: String,
    },
    /// Run finished successfully.
    Completed {
        job_id: String,
        source: String,
        message: String,
        transactions_applied: u64,
        duration_secs: u64,
    },
    /// Run failed.
    Failed {
        job_id: String,
        source: String,
        message: String,
        /// Whether a later run can be expected to succeed without user action
        recoverable: bool,
    },
    /// Run was stopped on request.
    Cancelled {
        job_id: String,
        source: String,
        message: String,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync started",
            SyncEvent::Progress { .. } => "Sync in progress",
            SyncEvent::IndexFailed { .. } => "Search index rebuild failed",
            SyncEvent::Retrying { .. } => "Sync retrying",
            SyncEvent::Completed { .. } => "Sync completed successfully",
            SyncEvent::Failed { .. } => "Sync failed",
            SyncEvent::Cancelled { .. } => "Sync cancelled",
        }
    }

    fn source(&self) -> &str {
        match self {
            SyncEvent::Started { source, .. }
            | SyncEvent::Progress { source, .. }
            | SyncEvent::IndexFailed { source, .. }
            | SyncEvent::Retrying { source, .. }
            | SyncEvent::Completed { source, .. }
            | SyncEvent::Failed { source, .. }
            | SyncEvent::Cancelled { source, .. } => source,
        }
    }

    /// Whether no further events follow for this job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncEvent::Completed { .. } | SyncEvent::Failed { .. } | SyncEvent::Cancelled { .. }
        )
    }
}

// ============================================================================
// Transaction Events
// ============================================================================

/// Events emitted by the transaction log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TransactionEvent {
    /// Edit persisted and applied locally.
    Queued {
        transaction_id: i64,
        source: String,
        kind: String,
    },
    /// Edit accepted by the backend and removed from the log.
    Applied {
        transaction_id: i64,
        source: String,
        kind: String,
    },
    /// Backend rejected the edit; it now blocks its source.
    Failed {
        transaction_id: i64,
        source: String,
        kind: String,
        error_count: u32,
        message: String,
    },
    /// Edit removed by the user without being applied.
    Discarded {
        transaction_id: i64,
        source: String,
        kind: String,
    },
}

impl TransactionEvent {
    fn description(&self) -> &str {
        match self {
            TransactionEvent::Queued { .. } => "Transaction queued",
            TransactionEvent::Applied { .. } => "Transaction applied",
            TransactionEvent::Failed { .. } => "Transaction failed",
            TransactionEvent::Discarded { .. } => "Transaction discarded",
        }
    }

    fn source(&self) -> &str {
        match self {
            TransactionEvent::Queued { source, .. }
            | TransactionEvent::Applied { source, .. }
            | TransactionEvent::Failed { source, .. }
            | TransactionEvent::Discarded { source, .. } => source,
        }
    }
}

// ============================================================================
// Library Events
// ============================================================================

/// Events related to the local projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LibraryEvent {
    /// Freshly fetched remote state was merged into the projection.
    Reconciled {
        source: String,
        /// "library" or "playlists"
        group: String,
        added: u64,
        deleted: u64,
        updated: u64,
        moved: u64,
    },
}

impl LibraryEvent {
    fn description(&self) -> &str {
        match self {
            LibraryEvent::Reconciled { .. } => "Remote state reconciled",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for broadcasting events to multiple subscribers.
///
/// Cloning the bus shares the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emits an event to all current subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error when nobody is listening. Callers usually ignore that error.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscription to the event bus.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Filtered subscription for one source.
    pub fn subscribe_source(&self, source: impl Into<String>) -> EventStream {
        let source = source.into();
        EventStream::new(self.subscribe()).filter(move |event| event.source() == source)
    }

    /// Returns the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Wrapper around a broadcast receiver with optional filtering.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only yield events matching `predicate`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive. `None` when no matching event is buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
