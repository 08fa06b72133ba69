use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::dispatch::DispatchOutcome;
use crate::job::{ClaimOutcome, DueTime, JobId};

/// Metadata envelope attached to every dispatcher event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            version: 1,
            worker_id: worker_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Event emitted as jobs move through claim, materialization and delivery.
#[derive(Clone, Debug)]
pub struct HeraldEvent {
    pub meta: EventMeta,
    pub payload: HeraldEventPayload,
}

impl HeraldEvent {
    pub fn new(worker_id: impl Into<String>, payload: HeraldEventPayload) -> Self {
        Self {
            meta: EventMeta::new(worker_id),
            payload,
        }
    }

    /// Identifier of the job this event concerns, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match &self.payload {
            HeraldEventPayload::Claimed { job_id, .. }
            | HeraldEventPayload::Dropped { job_id, .. }
            | HeraldEventPayload::Dispatched { job_id, .. } => Some(job_id),
            HeraldEventPayload::CycleCompleted { .. } => None,
        }
    }
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum HeraldEventPayload {
    /// This worker removed the job from the due-time queue.
    Claimed { job_id: JobId, due_time: DueTime },
    /// The job was claimed but never reached the gateway.
    Dropped { job_id: JobId, outcome: ClaimOutcome },
    /// The gateway call for the job finished (or was skipped).
    Dispatched {
        job_id: JobId,
        outcome: DispatchOutcome,
    },
    /// One claim cycle ran to completion.
    CycleCompleted { due: usize, claimed: usize },
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for slow subscribers: a subscriber that falls
/// more than `capacity` events behind receives `RecvError::Lagged`. With no
/// subscribers, events are dropped.
#[derive(Clone)]
pub struct InProcEventBus {
    sender: broadcast::Sender<HeraldEvent>,
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

impl InProcEventBus {
    /// Create a new event bus buffering at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish without awaiting. Never fails.
    pub fn emit(&self, event: HeraldEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HeraldEvent> {
        self.sender.subscribe()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher<HeraldEvent> for InProcEventBus {
    async fn publish(&self, event: HeraldEvent) -> anyhow::Result<()> {
        self.emit(event);
        Ok(())
    }
}

impl EventSubscriber<HeraldEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<HeraldEvent> {
        self.subscribe_events()
    }
}
