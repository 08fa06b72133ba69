use async_trait::async_trait;

use crate::job::{DueEntry, DueTime, JobId};

/// Ordered index of job identifiers keyed by due time.
///
/// Implementors must make [`DueQueue::claim`] an atomic conditional removal:
/// of any number of concurrent callers claiming the same identifier, exactly
/// one observes `true`. This is the only coordination primitive the claim
/// loop relies on.
#[async_trait]
pub trait DueQueue: Send + Sync {
    /// Return up to `limit` entries with a score in `[-inf, now]`, earliest
    /// first. Entries sharing a score are ordered by identifier.
    async fn due(
        &self,
        now: DueTime,
        limit: usize,
    ) -> anyhow::Result<Vec<DueEntry>>;

    /// Remove `job_id` if present. Returns `true` only for the caller that
    /// actually removed the entry.
    async fn claim(&self, job_id: &JobId) -> anyhow::Result<bool>;

    /// Insert or move `job_id` to `due_time`.
    async fn schedule(
        &self,
        job_id: &JobId,
        due_time: DueTime,
    ) -> anyhow::Result<()>;

    /// Total number of entries, due or not.
    async fn depth(&self) -> anyhow::Result<usize>;
}

/// Key-value store holding serialized payloads.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Fetch a value. `Ok(None)` means the key does not exist; `Err` is
    /// reserved for store failures.
    async fn fetch(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Naming convention shared between producers and the dispatcher.
#[derive(Clone, Debug)]
pub struct KeySpace {
    queue_key: String,
    payload_prefix: String,
}

impl KeySpace {
    pub fn new(
        queue_key: impl Into<String>,
        payload_prefix: impl Into<String>,
    ) -> Self {
        Self {
            queue_key: queue_key.into(),
            payload_prefix: payload_prefix.into(),
        }
    }

    /// Key of the sorted set used as the due-time queue.
    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn payload_prefix(&self) -> &str {
        &self.payload_prefix
    }

    /// Payload key for a job: the fixed prefix followed by the identifier.
    pub fn payload_key(&self, job_id: &JobId) -> String {
        format!("{}{}", self.payload_prefix, job_id)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_QUEUE_KEY,
            crate::config::DEFAULT_PAYLOAD_PREFIX,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_key_uses_prefix() {
        let keys = KeySpace::default();
        assert_eq!(keys.queue_key(), "notification_queue");
        assert_eq!(
            keys.payload_key(&JobId::new("j1")),
            "notification:data:j1"
        );
    }

    #[test]
    fn test_custom_key_space() {
        let keys = KeySpace::new("q", "p:");
        assert_eq!(keys.payload_key(&JobId::new("abc")), "p:abc");
        assert_eq!(keys.payload_prefix(), "p:");
    }
}
