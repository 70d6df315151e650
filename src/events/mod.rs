//! Post-commit event publication
//!
//! Events are buffered while a write transaction runs and published only
//! after it commits. A failed transaction publishes nothing.

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::{ScheduledTask, ScheduleStatus};

/// Events published by the scheduler core after a transaction commits.
#[derive(Debug, Clone)]
pub enum PubsubEvent {
    /// A task's status changed. Carries the post-transition record.
    TaskStateChange {
        task: Box<ScheduledTask>,
        previous: ScheduleStatus,
    },

    /// A shard was rescheduled onto a replacement task.
    TaskRescheduled {
        role: String,
        job_name: String,
        shard_id: u32,
    },

    /// Tasks were garbage-collected from the store.
    TasksDeleted { task_ids: Vec<String> },

    /// The resource framework acknowledged our registration.
    DriverRegistered { framework_id: String },
}

/// Fan-out sink for post-commit events.
///
/// Sends are fire-and-forget: with no live subscribers events are dropped,
/// matching a pub/sub bus with no durable consumers.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<PubsubEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PubsubEvent> {
        self.tx.subscribe()
    }

    /// Publish a single event. Lagging or absent subscribers are not errors.
    pub fn publish(&self, event: PubsubEvent) {
        debug!(?event, "publishing event");
        let _ = self.tx.send(event);
    }

    /// Publish a batch in order.
    pub fn publish_all(&self, events: impl IntoIterator<Item = PubsubEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
