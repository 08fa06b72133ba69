use std::fmt;
use std::sync::Arc;

use tracing::Instrument;

use crate::config::{TransientPolicy, DEFAULT_BATCH_SIZE};
use crate::dispatch::{DeliveryGateway, Dispatcher};
use crate::events::{HeraldEvent, HeraldEventPayload, InProcEventBus};
use crate::job::{ClaimOutcome, DueEntry, DueTime, JobId};
use crate::materialize::{JobMaterializer, MaterializeError};
use crate::queue::{DueQueue, KeySpace, PayloadStore};
use crate::telemetry;

/// Summary of one claim cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    /// Number of due entries returned by the queue.
    pub due: usize,
    /// The due-time query failed; nothing was processed.
    pub query_failed: bool,
    /// Claim calls that errored; those jobs were skipped.
    pub claim_errors: usize,
    /// Final outcome per processed job, in queue order.
    pub outcomes: Vec<(JobId, ClaimOutcome)>,
}

impl CycleReport {
    fn query_failed() -> Self {
        Self {
            query_failed: true,
            ..Self::default()
        }
    }

    pub fn count(&self, outcome: ClaimOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }

    /// Jobs this caller removed from the queue.
    pub fn claimed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_owned()).count()
    }

    pub fn dispatched(&self) -> usize {
        self.count(ClaimOutcome::Dispatched)
    }

    pub fn outcome_of(&self, job_id: &JobId) -> Option<ClaimOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == job_id)
            .map(|(_, outcome)| *outcome)
    }

    pub fn is_empty(&self) -> bool {
        self.due == 0
    }
}

/// Claims due jobs, materializes them and hands them to the dispatcher.
///
/// Ownership of a job is decided solely by [`DueQueue::claim`]; no
/// in-process lock is held, so any number of loops (in this process or
/// others) may poll the same queue.
pub struct ClaimLoop<Q, S, G>
where
    Q: DueQueue + ?Sized,
    S: PayloadStore + ?Sized,
    G: DeliveryGateway + 'static,
{
    queue: Arc<Q>,
    materializer: JobMaterializer<S>,
    dispatcher: Arc<Dispatcher<G>>,
    batch_size: usize,
    transient_policy: TransientPolicy,
    events: InProcEventBus,
    worker_id: String,
}

impl<Q, S, G> fmt::Debug for ClaimLoop<Q, S, G>
where
    Q: DueQueue + ?Sized,
    S: PayloadStore + ?Sized,
    G: DeliveryGateway + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimLoop")
            .field("worker_id", &self.worker_id)
            .field("queue_type", &std::any::type_name::<Q>())
            .field("materializer", &self.materializer)
            .field("batch_size", &self.batch_size)
            .field("transient_policy", &self.transient_policy)
            .finish()
    }
}

impl<Q, S, G> ClaimLoop<Q, S, G>
where
    Q: DueQueue + ?Sized,
    S: PayloadStore + ?Sized,
    G: DeliveryGateway + 'static,
{
    pub fn new(
        queue: Arc<Q>,
        store: Arc<S>,
        keys: KeySpace,
        dispatcher: Arc<Dispatcher<G>>,
        events: InProcEventBus,
    ) -> Self {
        Self {
            queue,
            materializer: JobMaterializer::new(store, keys),
            dispatcher,
            batch_size: DEFAULT_BATCH_SIZE,
            transient_policy: TransientPolicy::default(),
            events,
            worker_id: "herald".to_string(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_transient_policy(mut self, policy: TransientPolicy) -> Self {
        self.transient_policy = policy;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher<G>> {
        Arc::clone(&self.dispatcher)
    }

    /// Run one claim cycle against jobs due at or before `now`.
    pub async fn run_cycle(&self, now: DueTime) -> CycleReport {
        let span = telemetry::cycle_span(&self.worker_id, self.batch_size);
        self.run_cycle_inner(now).instrument(span).await
    }

    async fn run_cycle_inner(&self, now: DueTime) -> CycleReport {
        let entries = match self.queue.due(now, self.batch_size).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("due-time query failed: {err:#}");
                return CycleReport::query_failed();
            }
        };

        let mut report = CycleReport {
            due: entries.len(),
            ..CycleReport::default()
        };
        if entries.is_empty() {
            return report;
        }

        for entry in entries {
            let job_id = entry.job_id.clone();
            let span = telemetry::claim_span(&job_id);
            match self.process(entry).instrument(span).await {
                Some(outcome) => {
                    telemetry::record_claim_outcome(&job_id, outcome);
                    report.outcomes.push((job_id, outcome));
                }
                None => report.claim_errors += 1,
            }
        }

        self.events.emit(HeraldEvent::new(
            self.worker_id.clone(),
            HeraldEventPayload::CycleCompleted {
                due: report.due,
                claimed: report.claimed(),
            },
        ));
        report
    }

    /// Attempt to take ownership of a single entry.
    ///
    /// Returns [`ClaimOutcome::Claimed`] only if this caller removed it.
    pub async fn claim(&self, entry: &DueEntry) -> anyhow::Result<ClaimOutcome> {
        if self.queue.claim(&entry.job_id).await? {
            self.events.emit(HeraldEvent::new(
                self.worker_id.clone(),
                HeraldEventPayload::Claimed {
                    job_id: entry.job_id.clone(),
                    due_time: entry.due_time,
                },
            ));
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyClaimed)
        }
    }

    /// Claim, materialize and dispatch one entry. `None` means the claim
    /// call itself failed and the job was skipped.
    async fn process(&self, entry: DueEntry) -> Option<ClaimOutcome> {
        match self.claim(&entry).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(outcome) => return Some(outcome),
            Err(err) => {
                tracing::warn!(job_id = %entry.job_id, "claim failed: {err:#}");
                return None;
            }
        }

        let outcome = match self.materializer.materialize(&entry.job_id).await {
            Ok(payload) => {
                self.dispatcher.dispatch(entry.job_id.clone(), payload);
                return Some(ClaimOutcome::Dispatched);
            }
            Err(MaterializeError::Orphaned { .. }) => ClaimOutcome::Orphaned,
            Err(MaterializeError::Malformed { .. }) => ClaimOutcome::Malformed,
            Err(MaterializeError::Store { .. }) => self.on_transient(&entry).await,
        };

        self.events.emit(HeraldEvent::new(
            self.worker_id.clone(),
            HeraldEventPayload::Dropped {
                job_id: entry.job_id,
                outcome,
            },
        ));
        Some(outcome)
    }

    async fn on_transient(&self, entry: &DueEntry) -> ClaimOutcome {
        match self.transient_policy {
            TransientPolicy::Drop => {
                self.materializer.discard(&entry.job_id).await;
                ClaimOutcome::Transient
            }
            TransientPolicy::Requeue => {
                match self.queue.schedule(&entry.job_id, entry.due_time).await {
                    Ok(()) => {
                        tracing::info!(
                            job_id = %entry.job_id,
                            due_time = %entry.due_time,
                            "job requeued after payload read failure"
                        );
                        ClaimOutcome::Requeued
                    }
                    Err(err) => {
                        tracing::error!(
                            job_id = %entry.job_id,
                            "requeue failed, job dropped: {err:#}"
                        );
                        self.materializer.discard(&entry.job_id).await;
                        ClaimOutcome::Transient
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BatchResponse, MulticastMessage};
    use crate::runtime::WorkerConfig;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct TestQueue {
        entries: Mutex<BTreeMap<String, f64>>,
        fail_query: AtomicBool,
        fail_claim_for: Option<String>,
    }

    #[async_trait]
    impl DueQueue for TestQueue {
        async fn due(
            &self,
            now: DueTime,
            limit: usize,
        ) -> anyhow::Result<Vec<DueEntry>> {
            if self.fail_query.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            let entries = self.entries.lock().await;
            let mut due: Vec<_> = entries
                .iter()
                .filter(|(_, score)| **score <= now.0)
                .map(|(id, score)| DueEntry::new(id.as_str(), DueTime(*score)))
                .collect();
            due.sort_by(|a, b| {
                a.due_time
                    .0
                    .total_cmp(&b.due_time.0)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            });
            due.truncate(limit);
            Ok(due)
        }

        async fn claim(&self, job_id: &JobId) -> anyhow::Result<bool> {
            if self.fail_claim_for.as_deref() == Some(job_id.as_str()) {
                anyhow::bail!("timeout");
            }
            Ok(self.entries.lock().await.remove(job_id.as_str()).is_some())
        }

        async fn schedule(
            &self,
            job_id: &JobId,
            due_time: DueTime,
        ) -> anyhow::Result<()> {
            self.entries
                .lock()
                .await
                .insert(job_id.to_string(), due_time.0);
            Ok(())
        }

        async fn depth(&self) -> anyhow::Result<usize> {
            Ok(self.entries.lock().await.len())
        }
    }

    #[derive(Default)]
    struct TestStore {
        values: Mutex<HashMap<String, String>>,
        fail_fetch: bool,
    }

    #[async_trait]
    impl PayloadStore for TestStore {
        async fn fetch(&self, key: &str) -> anyhow::Result<Option<String>> {
            if self.fail_fetch {
                anyhow::bail!("broken pipe");
            }
            Ok(self.values.lock().await.get(key).cloned())
        }

        async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.values
                .lock()
                .await
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.values.lock().await.remove(key);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestGateway {
        calls: Mutex<Vec<MulticastMessage>>,
    }

    #[async_trait]
    impl DeliveryGateway for TestGateway {
        async fn send_multicast(
            &self,
            message: &MulticastMessage,
        ) -> anyhow::Result<BatchResponse> {
            self.calls.lock().await.push(message.clone());
            Ok(BatchResponse::new(message.tokens.len(), 0))
        }
    }

    fn build(
        queue: Arc<TestQueue>,
        store: Arc<TestStore>,
        gateway: Arc<TestGateway>,
    ) -> ClaimLoop<TestQueue, TestStore, TestGateway> {
        let events = InProcEventBus::new(64);
        let dispatcher = Arc::new(Dispatcher::new(
            gateway,
            &WorkerConfig::new("test"),
            events.clone(),
        ));
        ClaimLoop::new(queue, store, KeySpace::default(), dispatcher, events)
            .with_worker_id("test")
    }

    async fn seed(
        queue: &TestQueue,
        store: &TestStore,
        id: &str,
        due: DueTime,
        payload: Option<&str>,
    ) {
        queue.schedule(&JobId::new(id), due).await.unwrap();
        if let Some(payload) = payload {
            store
                .put(&format!("notification:data:{id}"), payload)
                .await
                .unwrap();
        }
    }

    const PAYLOAD: &str =
        r#"{"tokens":["tok-a"],"title":"Hi","body":"There","data":{}}"#;

    #[tokio::test]
    async fn test_due_job_is_claimed_and_dispatched() {
        let queue = Arc::new(TestQueue::default());
        let store = Arc::new(TestStore::default());
        let gateway = Arc::new(TestGateway::default());
        let now = DueTime(1_000.0);
        seed(&queue, &store, "j1", now.offset_secs(-10), Some(PAYLOAD)).await;

        let claim_loop = build(queue.clone(), store.clone(), gateway.clone());
        let report = claim_loop.run_cycle(now).await;
        claim_loop.dispatcher().drain().await;

        assert_eq!(report.outcome_of(&JobId::new("j1")), Some(ClaimOutcome::Dispatched));
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert!(store.values.lock().await.is_empty());
        let calls = gateway.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tokens, vec!["tok-a"]);
    }

    #[tokio::test]
    async fn test_future_job_is_not_claimed() {
        let queue = Arc::new(TestQueue::default());
        let store = Arc::new(TestStore::default());
        let now = DueTime(1_000.0);
        seed(&queue, &store, "j2", now.offset_secs(10), Some(PAYLOAD)).await;

        let claim_loop = build(queue.clone(), store, Arc::default());
        let report = claim_loop.run_cycle(now).await;

        assert!(report.is_empty());
        assert_eq!(report.claimed(), 0);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_cycle_in_due_order() {
        let queue = Arc::new(TestQueue::default());
        let store = Arc::new(TestStore::default());
        let now = DueTime(1_000.0);
        seed(&queue, &store, "b", now.offset_secs(-5), Some(PAYLOAD)).await;
        seed(&queue, &store, "a", now.offset_secs(-5), Some(PAYLOAD)).await;
        seed(&queue, &store, "c", now.offset_secs(-50), Some(PAYLOAD)).await;

        let claim_loop =
            build(queue.clone(), store, Arc::default()).with_batch_size(2);
        let report = claim_loop.run_cycle(now).await;

        let ids: Vec<_> =
            report.outcomes.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_failure_returns_early() {
        let queue = Arc::new(TestQueue::default());
        queue.fail_query.store(true, Ordering::SeqCst);
        let store = Arc::new(TestStore::default());

        let claim_loop = build(queue, store, Arc::default());
        let report = claim_loop.run_cycle(DueTime(1_000.0)).await;

        assert!(report.query_failed);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_claim_error_skips_only_that_job() {
        let queue = Arc::new(TestQueue {
            fail_claim_for: Some("flaky".to_string()),
            ..TestQueue::default()
        });
        let store = Arc::new(TestStore::default());
        let now = DueTime(1_000.0);
        seed(&queue, &store, "flaky", now.offset_secs(-20), Some(PAYLOAD)).await;
        seed(&queue, &store, "ok", now.offset_secs(-10), Some(PAYLOAD)).await;

        let claim_loop = build(queue, store, Arc::default());
        let report = claim_loop.run_cycle(now).await;

        assert_eq!(report.claim_errors, 1);
        assert_eq!(report.outcome_of(&JobId::new("flaky")), None);
        assert_eq!(
            report.outcome_of(&JobId::new("ok")),
            Some(ClaimOutcome::Dispatched)
        );
    }

    #[tokio::test]
    async fn test_orphan_and_malformed_are_dropped() {
        let queue = Arc::new(TestQueue::default());
        let store = Arc::new(TestStore::default());
        let gateway = Arc::new(TestGateway::default());
        let now = DueTime(1_000.0);
        seed(&queue, &store, "j4", now.offset_secs(-10), None).await;
        seed(&queue, &store, "j5", now.offset_secs(-10), Some("[1,2")).await;

        let claim_loop = build(queue.clone(), store.clone(), gateway.clone());
        let report = claim_loop.run_cycle(now).await;
        claim_loop.dispatcher().drain().await;

        assert_eq!(report.outcome_of(&JobId::new("j4")), Some(ClaimOutcome::Orphaned));
        assert_eq!(report.outcome_of(&JobId::new("j5")), Some(ClaimOutcome::Malformed));
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert!(store.values.lock().await.is_empty());
        assert!(gateway.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_policies() {
        let now = DueTime(1_000.0);
        let due = now.offset_secs(-10);

        let queue = Arc::new(TestQueue::default());
        let store = Arc::new(TestStore {
            fail_fetch: true,
            ..TestStore::default()
        });
        seed(&queue, &store, "j6", due, Some(PAYLOAD)).await;
        let report = build(queue.clone(), store.clone(), Arc::default())
            .run_cycle(now)
            .await;
        assert_eq!(report.outcome_of(&JobId::new("j6")), Some(ClaimOutcome::Transient));
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert!(!store
            .values
            .lock()
            .await
            .contains_key("notification:data:j6"));

        seed(&queue, &store, "j7", due, Some(PAYLOAD)).await;
        let report = build(queue.clone(), store.clone(), Arc::default())
            .with_transient_policy(TransientPolicy::Requeue)
            .run_cycle(now)
            .await;
        assert_eq!(report.outcome_of(&JobId::new("j7")), Some(ClaimOutcome::Requeued));
        let remaining = queue.due(now, 10).await.unwrap();
        assert_eq!(remaining, vec![DueEntry::new("j7", due)]);
        assert!(store
            .values
            .lock()
            .await
            .contains_key("notification:data:j7"));
    }
}
