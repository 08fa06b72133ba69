use herald::*;

use crate::{InMemoryDueQueue, InMemoryPayloadStore};

/// 2024-01-01T12:00:00Z, so tests do not depend on the wall clock.
pub fn test_now() -> DueTime {
    DueTime(1_704_110_400.0)
}

pub fn payload_for(tokens: &[&str]) -> NotificationPayload {
    NotificationPayload::new(
        tokens.iter().map(|t| t.to_string()).collect(),
        "Reminder",
        "Your appointment starts soon",
    )
}

/// Queue and store pair sharing one key space.
#[derive(Clone, Default)]
pub struct TestStores {
    pub queue: InMemoryDueQueue,
    pub store: InMemoryPayloadStore,
    pub keys: KeySpace,
}

impl TestStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` and queue `id` at `due`, as a producer would.
    pub async fn seed_job(
        &self,
        id: &str,
        due: DueTime,
        payload: &NotificationPayload,
    ) -> anyhow::Result<JobId> {
        let raw = serde_json::to_string(payload)?;
        self.seed_raw(id, due, Some(&raw)).await
    }

    /// Queue `id` at `due` with an arbitrary raw payload, or none at all.
    pub async fn seed_raw(
        &self,
        id: &str,
        due: DueTime,
        raw: Option<&str>,
    ) -> anyhow::Result<JobId> {
        let job_id = JobId::new(id);
        if let Some(raw) = raw {
            self.store.put(&self.keys.payload_key(&job_id), raw).await?;
        }
        self.queue.schedule(&job_id, due).await?;
        Ok(job_id)
    }

    pub fn payload_exists(&self, job_id: &JobId) -> bool {
        self.store.contains(&self.keys.payload_key(job_id))
    }
}
