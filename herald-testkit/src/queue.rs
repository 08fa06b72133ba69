use async_trait::async_trait;
use herald::*;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sorted-set style due queue held in memory.
///
/// `claim` removes under a single lock, so it has the same exactly-one-winner
/// guarantee as `ZREM`.
#[derive(Clone, Default)]
pub struct InMemoryDueQueue {
    entries: Arc<Mutex<HashMap<JobId, f64>>>,
    fail_due: Arc<AtomicBool>,
    fail_claim: Arc<Mutex<HashSet<JobId>>>,
    claims_won: Arc<AtomicUsize>,
}

impl InMemoryDueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `due` call fail until cleared.
    pub fn set_fail_due(&self, fail: bool) {
        self.fail_due.store(fail, Ordering::SeqCst);
    }

    /// Make `claim` fail for this id.
    pub fn fail_claim_for(&self, job_id: impl Into<JobId>) {
        self.fail_claim.lock().insert(job_id.into());
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.entries.lock().contains_key(job_id)
    }

    pub fn score_of(&self, job_id: &JobId) -> Option<f64> {
        self.entries.lock().get(job_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of `claim` calls that removed an entry.
    pub fn claims_won(&self) -> usize {
        self.claims_won.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DueQueue for InMemoryDueQueue {
    async fn due(
        &self,
        now: DueTime,
        limit: usize,
    ) -> anyhow::Result<Vec<DueEntry>> {
        if self.fail_due.load(Ordering::SeqCst) {
            anyhow::bail!("due-time query unavailable");
        }

        let mut due: Vec<DueEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, score)| **score <= now.as_secs())
            .map(|(id, score)| DueEntry::new(id.clone(), DueTime(*score)))
            .collect();
        due.sort_by(|a, b| {
            a.due_time
                .as_secs()
                .total_cmp(&b.due_time.as_secs())
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, job_id: &JobId) -> anyhow::Result<bool> {
        if self.fail_claim.lock().contains(job_id) {
            anyhow::bail!("claim unavailable for {job_id}");
        }
        let removed = self.entries.lock().remove(job_id).is_some();
        if removed {
            self.claims_won.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn schedule(
        &self,
        job_id: &JobId,
        due_time: DueTime,
    ) -> anyhow::Result<()> {
        self.entries.lock().insert(job_id.clone(), due_time.as_secs());
        Ok(())
    }

    async fn depth(&self) -> anyhow::Result<usize> {
        Ok(self.len())
    }
}

/// Key-value payload store held in memory.
#[derive(Clone, Default)]
pub struct InMemoryPayloadStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    fail_fetch: Arc<AtomicBool>,
    deletes: Arc<Mutex<Vec<String>>>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `fetch` fail until cleared.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    /// Keys passed to `delete`, in call order.
    pub fn deleted_keys(&self) -> Vec<String> {
        self.deletes.lock().clone()
    }
}

#[async_trait]
impl PayloadStore for InMemoryPayloadStore {
    async fn fetch(&self, key: &str) -> anyhow::Result<Option<String>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            anyhow::bail!("payload store unavailable");
        }
        Ok(self.get(key))
    }

    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.deletes.lock().push(key.to_string());
        self.values.lock().remove(key);
        Ok(())
    }
}
