use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::JobId;
use crate::policy::DispatchReason;

/// Metadata envelope attached to every scheduler event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerEvent {
    pub meta: EventMeta,
    pub payload: EventPayload,
}

impl SchedulerEvent {
    /// Wrap a payload with an idempotency key derived from its content.
    pub fn new(payload: EventPayload) -> Self {
        let key = match &payload {
            EventPayload::Created { job_id, .. } => format!("created-{job_id}"),
            EventPayload::Dispatched { job_id, .. } => format!("dispatch-{job_id}"),
            EventPayload::Completed { job_id, .. } => format!("complete-{job_id}"),
            EventPayload::Requeued {
                job_id,
                retry_count,
                ..
            } => format!("requeue-{job_id}-{retry_count}"),
            EventPayload::Failed { job_id, .. } => format!("fail-{job_id}"),
            EventPayload::SignalDegraded { zone, .. } => {
                format!("degraded-{zone}-{}", Utc::now().timestamp_millis())
            }
        };
        Self {
            meta: EventMeta::new(key),
            payload,
        }
    }
}

/// Lifecycle transitions and oracle health signals.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum EventPayload {
    /// Job accepted at intake.
    Created {
        job_id: JobId,
        baseline_intensity: f64,
        deadline: DateTime<Utc>,
    },
    /// Job claimed by a loop and handed to the execution adapter.
    Dispatched {
        job_id: JobId,
        reason: DispatchReason,
        intensity: f64,
    },
    Completed { job_id: JobId, token_count: u32 },
    /// Execution failed and the job went back to pending.
    Requeued {
        job_id: JobId,
        retry_count: u32,
        error: String,
    },
    /// Execution failed and retries are exhausted.
    Failed { job_id: JobId, error: String },
    /// A refresh failed and a stale sample was served instead.
    SignalDegraded { zone: String, reason: String },
}

/// Event publisher consumed by the oracle, intake, loop and recorder.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published.
    async fn publish(&self, event: SchedulerEvent) -> anyhow::Result<()>;
}

/// Event subscriber trait for receiving scheduler events.
pub trait EventSubscriber: Send + Sync {
    /// Subscribe to events, returning a broadcast receiver.
    ///
    /// Multiple subscribers can receive the same events (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for slow subscribers; a subscriber that falls more
/// than `capacity` events behind receives `RecvError::Lagged`. Events are
/// dropped silently when nobody is subscribed.
pub struct InProcEventBus {
    sender: broadcast::Sender<SchedulerEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking publish.
    pub fn publish_event(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish(&self, event: SchedulerEvent) -> anyhow::Result<()> {
        self.publish_event(event);
        Ok(())
    }
}

impl EventSubscriber for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }
}
