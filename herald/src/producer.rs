use std::sync::Arc;

use anyhow::Context;

use crate::job::{DueTime, JobId, NotificationPayload};
use crate::queue::{DueQueue, KeySpace, PayloadStore};

/// Schedules notifications for later delivery.
///
/// The payload is always written before the queue entry so a claimer never
/// observes a due id whose payload has not been stored yet.
pub struct NotificationProducer<Q: DueQueue + ?Sized, S: PayloadStore + ?Sized> {
    queue: Arc<Q>,
    store: Arc<S>,
    keys: KeySpace,
}

impl<Q, S> std::fmt::Debug for NotificationProducer<Q, S>
where
    Q: DueQueue + ?Sized,
    S: PayloadStore + ?Sized,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationProducer")
            .field("queue_type", &std::any::type_name::<Q>())
            .field("store_type", &std::any::type_name::<S>())
            .field("keys", &self.keys)
            .finish()
    }
}

impl<Q, S> NotificationProducer<Q, S>
where
    Q: DueQueue + ?Sized,
    S: PayloadStore + ?Sized,
{
    pub fn new(queue: Arc<Q>, store: Arc<S>, keys: KeySpace) -> Self {
        Self { queue, store, keys }
    }

    /// Store `payload` and make it due at `send_at`. Returns the new job id.
    pub async fn schedule(
        &self,
        payload: &NotificationPayload,
        send_at: DueTime,
    ) -> anyhow::Result<JobId> {
        let job_id = JobId::generate();
        self.write_payload(&job_id, payload).await?;
        self.queue
            .schedule(&job_id, send_at)
            .await
            .with_context(|| format!("failed to enqueue job {job_id}"))?;

        tracing::info!(
            job_id = %job_id,
            send_at = %send_at,
            tokens = payload.tokens.len(),
            "notification scheduled"
        );
        Ok(job_id)
    }

    /// Replace the payload of a pending job. Its due time is unchanged.
    pub async fn update_content(
        &self,
        job_id: &JobId,
        payload: &NotificationPayload,
    ) -> anyhow::Result<()> {
        self.write_payload(job_id, payload).await?;
        tracing::debug!(job_id = %job_id, "notification content updated");
        Ok(())
    }

    /// Move a pending job to a new due time.
    pub async fn reschedule(
        &self,
        job_id: &JobId,
        send_at: DueTime,
    ) -> anyhow::Result<()> {
        self.queue
            .schedule(job_id, send_at)
            .await
            .with_context(|| format!("failed to reschedule job {job_id}"))?;
        tracing::debug!(job_id = %job_id, send_at = %send_at, "notification rescheduled");
        Ok(())
    }

    /// Remove a pending job and its payload.
    ///
    /// Returns `false` if the job was no longer queued, i.e. a claimer got
    /// there first or it never existed. The payload key is deleted either way.
    pub async fn cancel(&self, job_id: &JobId) -> anyhow::Result<bool> {
        let removed = self
            .queue
            .claim(job_id)
            .await
            .with_context(|| format!("failed to remove job {job_id} from queue"))?;
        self.store
            .delete(&self.keys.payload_key(job_id))
            .await
            .with_context(|| format!("failed to delete payload of job {job_id}"))?;

        tracing::debug!(job_id = %job_id, removed, "notification cancelled");
        Ok(removed)
    }

    async fn write_payload(
        &self,
        job_id: &JobId,
        payload: &NotificationPayload,
    ) -> anyhow::Result<()> {
        let raw = payload
            .to_json()
            .with_context(|| format!("failed to encode payload of job {job_id}"))?;
        self.store
            .put(&self.keys.payload_key(job_id), &raw)
            .await
            .with_context(|| format!("failed to store payload of job {job_id}"))
    }
}
