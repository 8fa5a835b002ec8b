//! Lifecycle events published per queue.
//!
//! Each queue has one broadcast channel. Publishing never blocks and never
//! fails: with no subscribers the event is dropped, and a slow subscriber
//! sees `Lagged` rather than holding up workers.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::job::{JobId, JobState, Progress};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Waiting {
        queue: String,
        job_id: JobId,
    },
    Active {
        queue: String,
        job_id: JobId,
        attempt: u32,
    },
    Progress {
        queue: String,
        job_id: JobId,
        progress: Progress,
    },
    Completed {
        queue: String,
        job_id: JobId,
        result: Value,
    },
    Retrying {
        queue: String,
        job_id: JobId,
        attempt: u32,
        reason: String,
        delay_ms: u64,
    },
    Failed {
        queue: String,
        job_id: JobId,
        attempts_made: u32,
        reason: String,
    },
    Stalled {
        queue: String,
        job_id: JobId,
    },
    Removed {
        queue: String,
        job_id: JobId,
        previous_state: JobState,
    },
    Paused {
        queue: String,
    },
    Resumed {
        queue: String,
    },
    Cleaned {
        queue: String,
        state: JobState,
        count: usize,
        at: DateTime<Utc>,
    },
}

impl QueueEvent {
    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::Waiting { queue, .. }
            | QueueEvent::Active { queue, .. }
            | QueueEvent::Progress { queue, .. }
            | QueueEvent::Completed { queue, .. }
            | QueueEvent::Retrying { queue, .. }
            | QueueEvent::Failed { queue, .. }
            | QueueEvent::Stalled { queue, .. }
            | QueueEvent::Removed { queue, .. }
            | QueueEvent::Paused { queue }
            | QueueEvent::Resumed { queue }
            | QueueEvent::Cleaned { queue, .. } => queue,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Waiting { .. } => "waiting",
            QueueEvent::Active { .. } => "active",
            QueueEvent::Progress { .. } => "progress",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::Retrying { .. } => "retrying",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::Stalled { .. } => "stalled",
            QueueEvent::Removed { .. } => "removed",
            QueueEvent::Paused { .. } => "paused",
            QueueEvent::Resumed { .. } => "resumed",
            QueueEvent::Cleaned { .. } => "cleaned",
        }
    }
}

#[derive(Default)]
pub struct QueueEvents {
    channels: DashMap<String, broadcast::Sender<QueueEvent>>,
}

impl QueueEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, queue: &str) -> broadcast::Sender<QueueEvent> {
        if let Some(tx) = self.channels.get(queue) {
            return tx.clone();
        }
        self.channels
            .entry(queue.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn emit(&self, event: QueueEvent) {
        let tx = self.sender(event.queue());
        // No subscribers is fine
        let _ = tx.send(event);
    }

    pub fn subscribe(&self, queue: &str) -> broadcast::Receiver<QueueEvent> {
        self.sender(queue).subscribe()
    }

    pub fn subscriber_count(&self, queue: &str) -> usize {
        self.channels
            .get(queue)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}
