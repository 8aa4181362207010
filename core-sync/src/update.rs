//! Status updates of a running sync, delivered on the run's own channel and
//! mirrored to the [`EventBus`].

use crate::job::{SyncJob, SyncJobId, SyncJobStats, SyncPhase, SyncTrigger};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    /// A new attempt started with its own job record
    Started {
        job_id: SyncJobId,
        trigger: SyncTrigger,
        attempt: u32,
    },
    Progress {
        phase: SyncPhase,
        processed: u64,
        total: Option<u64>,
        message: String,
    },
    IndexFailed {
        message: String,
    },
    /// The attempt failed transiently; another one follows after `delay`
    Retrying {
        attempt: u32,
        delay: Duration,
        message: String,
    },
    Succeeded {
        message: String,
        stats: SyncJobStats,
    },
    Failed {
        message: String,
        recoverable: bool,
    },
    Cancelled {
        message: String,
    },
}

impl SyncUpdate {
    /// Last update of a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncUpdate::Succeeded { .. } | SyncUpdate::Failed { .. } | SyncUpdate::Cancelled { .. }
        )
    }
}

/// Where a run reports to. Cheap to clone.
#[derive(Clone)]
pub struct UpdateSink {
    source: String,
    events: EventBus,
    updates: Option<mpsc::UnboundedSender<SyncUpdate>>,
}

impl UpdateSink {
    pub fn new(
        source: impl Into<String>,
        events: EventBus,
        updates: Option<mpsc::UnboundedSender<SyncUpdate>>,
    ) -> Self {
        Self {
            source: source.into(),
            events,
            updates,
        }
    }

    /// Sink that only feeds the event bus
    pub fn events_only(source: impl Into<String>, events: EventBus) -> Self {
        Self::new(source, events, None)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn progress(&self, job: &SyncJob) {
        self.send(
            job,
            SyncUpdate::Progress {
                phase: job.phase,
                processed: job.progress.processed,
                total: job.progress.total,
                message: job.progress.message.clone(),
            },
        );
    }

    pub fn send(&self, job: &SyncJob, update: SyncUpdate) {
        // Nobody listening is fine on both paths
        let _ = self.events.emit(CoreEvent::Sync(self.to_event(job, &update)));
        if let Some(updates) = &self.updates {
            let _ = updates.send(update);
        }
    }

    fn to_event(&self, job: &SyncJob, update: &SyncUpdate) -> SyncEvent {
        let job_id = job.id.to_string();
        let source = self.source.clone();
        match update {
            SyncUpdate::Started { trigger, .. } => SyncEvent::Started {
                job_id,
                source,
                trigger: trigger.as_str().to_string(),
            },
            SyncUpdate::Progress {
                phase,
                processed,
                total,
                message,
            } => SyncEvent::Progress {
                job_id,
                source,
                phase: phase.as_str().to_string(),
                message: message.clone(),
                processed: *processed,
                total: *total,
            },
            SyncUpdate::IndexFailed { message } => SyncEvent::IndexFailed {
                job_id,
                source,
                message: message.clone(),
            },
            SyncUpdate::Retrying {
                attempt,
                delay,
                message,
            } => SyncEvent::Retrying {
                job_id,
                source,
                attempt: *attempt,
                delay_ms: delay.as_millis() as u64,
                message: message.clone(),
            },
            SyncUpdate::Succeeded { message, stats } => SyncEvent::Completed {
                job_id,
                source,
                message: message.clone(),
                transactions_applied: stats.transactions_applied,
                duration_secs: job.duration_secs().unwrap_or(0),
            },
            SyncUpdate::Failed {
                message,
                recoverable,
            } => SyncEvent::Failed {
                job_id,
                source,
                message: message.clone(),
                recoverable: *recoverable,
            },
            SyncUpdate::Cancelled { message } => SyncEvent::Cancelled {
                job_id,
                source,
                message: message.clone(),
            },
        }
    }
}

impl std::fmt::Debug for UpdateSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSink")
            .field("source", &self.source)
            .field("has_channel", &self.updates.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_updates_are_mirrored() {
        let events = EventBus::new(16);
        let mut stream = events.subscribe_source("git");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = UpdateSink::new("git", events.clone(), Some(tx));

        let job = SyncJob::new("git", SyncTrigger::RunNow);
        sink.send(
            &job,
            SyncUpdate::Failed {
                message: "offline".to_string(),
                recoverable: true,
            },
        );

        let update = rx.recv().await.unwrap();
        assert!(update.is_terminal());

        match stream.recv().await.unwrap() {
            CoreEvent::Sync(SyncEvent::Failed {
                job_id,
                recoverable,
                ..
            }) => {
                assert_eq!(job_id, job.id.to_string());
                assert!(recoverable);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_events_only_sink_without_listeners() {
        let sink = UpdateSink::events_only("git", EventBus::new(4));
        let job = SyncJob::new("git", SyncTrigger::RunNow);
        sink.progress(&job);
        assert_eq!(sink.source(), "git");
    }
}
