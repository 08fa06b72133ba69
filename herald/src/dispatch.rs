use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::events::{HeraldEvent, HeraldEventPayload, InProcEventBus};
use crate::job::{JobId, NotificationPayload};
use crate::runtime::WorkerConfig;
use crate::telemetry;

/// A single batched delivery request covering every token of a job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastMessage {
    pub tokens: Vec<String>,
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
}

impl From<NotificationPayload> for MulticastMessage {
    fn from(payload: NotificationPayload) -> Self {
        Self {
            tokens: payload.tokens,
            title: payload.title,
            body: payload.body,
            data: payload.data,
        }
    }
}

/// Per-token tallies returned by the gateway for one multicast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchResponse {
    pub fn new(success_count: usize, failure_count: usize) -> Self {
        Self {
            success_count,
            failure_count,
        }
    }
}

/// Push-notification gateway.
///
/// One call per job, carrying the full token list. An `Err` means the call
/// failed as a whole (network, auth); per-token rejections are reported in
/// the [`BatchResponse`] instead.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn send_multicast(
        &self,
        message: &MulticastMessage,
    ) -> anyhow::Result<BatchResponse>;
}

#[async_trait]
impl<G: DeliveryGateway + ?Sized> DeliveryGateway for Arc<G> {
    async fn send_multicast(
        &self,
        message: &MulticastMessage,
    ) -> anyhow::Result<BatchResponse> {
        (**self).send_multicast(message).await
    }
}

/// Job-level result of a dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every token was accepted.
    Delivered { success: usize },
    /// Some tokens were accepted, some rejected.
    PartiallyDelivered { success: usize, failure: usize },
    /// Every token was rejected.
    Failed { failure: usize },
    /// The gateway call failed as a whole.
    GatewayError { error: String },
    /// The gateway call did not finish within the configured timeout.
    TimedOut { after: Duration },
    /// The payload had no tokens; the gateway was not called.
    Skipped,
}

impl DispatchOutcome {
    /// Reduce per-token tallies to a job-level outcome.
    pub fn from_response(response: BatchResponse) -> Self {
        match (response.success_count, response.failure_count) {
            (success, 0) => DispatchOutcome::Delivered { success },
            (0, failure) => DispatchOutcome::Failed { failure },
            (success, failure) => {
                DispatchOutcome::PartiallyDelivered { success, failure }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Delivered { .. } => "delivered",
            DispatchOutcome::PartiallyDelivered { .. } => "partially_delivered",
            DispatchOutcome::Failed { .. } => "failed",
            DispatchOutcome::GatewayError { .. } => "gateway_error",
            DispatchOutcome::TimedOut { .. } => "timed_out",
            DispatchOutcome::Skipped => "skipped",
        }
    }

    /// `(success, failure)` token counts reported by the gateway.
    pub fn token_counts(&self) -> (usize, usize) {
        match self {
            DispatchOutcome::Delivered { success } => (*success, 0),
            DispatchOutcome::PartiallyDelivered { success, failure } => {
                (*success, *failure)
            }
            DispatchOutcome::Failed { failure } => (0, *failure),
            _ => (0, 0),
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Send one job's message through the gateway and classify the result.
pub async fn deliver<G>(
    gateway: &G,
    job_id: &JobId,
    message: &MulticastMessage,
    timeout: Option<Duration>,
) -> DispatchOutcome
where
    G: DeliveryGateway + ?Sized,
{
    if message.tokens.is_empty() {
        return DispatchOutcome::Skipped;
    }

    let timing = telemetry::record_dispatch_start(job_id);
    let call = gateway.send_multicast(message);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                telemetry::record_dispatch_end(timing, "timed_out");
                return DispatchOutcome::TimedOut { after: limit };
            }
        },
        None => call.await,
    };

    let outcome = match result {
        Ok(response) => DispatchOutcome::from_response(response),
        Err(err) => DispatchOutcome::GatewayError {
            error: format!("{err:#}"),
        },
    };
    telemetry::record_dispatch_end(timing, outcome.as_str());
    outcome
}

/// Fans claimed jobs out to the gateway without blocking the claim loop.
///
/// Each job runs as its own task on a [`TaskTracker`] so shutdown can wait
/// for in-flight calls. A semaphore caps how many gateway calls run at once;
/// tasks beyond the cap wait for a permit.
pub struct Dispatcher<G: DeliveryGateway + 'static> {
    gateway: Arc<G>,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    timeout: Option<Duration>,
    events: InProcEventBus,
    worker_id: String,
}

impl<G: DeliveryGateway + 'static> fmt::Debug for Dispatcher<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("gateway_type", &std::any::type_name::<G>())
            .field("max_in_flight", &self.max_in_flight)
            .field("pending", &self.tracker.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<G: DeliveryGateway + 'static> Dispatcher<G> {
    pub fn new(
        gateway: Arc<G>,
        config: &WorkerConfig,
        events: InProcEventBus,
    ) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            gateway,
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            timeout: config.dispatch_timeout(),
            events,
            worker_id: config.worker_id.clone(),
        }
    }

    pub fn gateway(&self) -> Arc<G> {
        Arc::clone(&self.gateway)
    }

    /// Jobs handed off and not yet finished, including those waiting for a
    /// permit.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Gateway calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        in_flight(&self.permits, self.max_in_flight)
    }

    /// Hand a materialized job off for delivery.
    ///
    /// Returns `false` when the payload has no tokens; nothing is spawned and
    /// the gateway is not called.
    pub fn dispatch(&self, job_id: JobId, payload: NotificationPayload) -> bool {
        if !payload.has_recipients() {
            let outcome = DispatchOutcome::Skipped;
            telemetry::record_dispatch_outcome(&job_id, &outcome);
            self.events.emit(HeraldEvent::new(
                self.worker_id.clone(),
                HeraldEventPayload::Dispatched { job_id, outcome },
            ));
            return false;
        }

        let gateway = Arc::clone(&self.gateway);
        let permits = Arc::clone(&self.permits);
        let max_in_flight = self.max_in_flight;
        let events = self.events.clone();
        let worker_id = self.worker_id.clone();
        let timeout = self.timeout;
        let message = MulticastMessage::from(payload);
        let token_count = message.tokens.len();

        let span_id = job_id.clone();
        self.tracker.spawn(telemetry::instrument_dispatch(
            span_id,
            token_count,
            async move {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await
                else {
                    tracing::error!(job_id = %job_id, "dispatch permits closed");
                    return;
                };
                telemetry::set_in_flight(in_flight(&permits, max_in_flight));

                let outcome =
                    deliver(gateway.as_ref(), &job_id, &message, timeout).await;
                drop(permit);
                telemetry::set_in_flight(in_flight(&permits, max_in_flight));

                telemetry::record_dispatch_outcome(&job_id, &outcome);
                events.emit(HeraldEvent::new(
                    worker_id,
                    HeraldEventPayload::Dispatched { job_id, outcome },
                ));
            },
        ));
        true
    }

    /// Wait until every dispatch handed off so far has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting the current batch and wait up to `grace` for in-flight
    /// dispatches. Returns `true` if everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "waiting for in-flight dispatches");
        }
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    pending = self.tracker.len(),
                    "dispatches still running after shutdown grace period"
                );
                false
            }
        }
    }
}

fn in_flight(permits: &Semaphore, max_in_flight: usize) -> usize {
    max_in_flight.saturating_sub(permits.available_permits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct CountingGateway {
        calls: Mutex<Vec<MulticastMessage>>,
        response: anyhow::Result<BatchResponse>,
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingGateway {
        fn new(response: anyhow::Result<BatchResponse>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                response,
                delay: Duration::ZERO,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl DeliveryGateway for CountingGateway {
        async fn send_multicast(
            &self,
            message: &MulticastMessage,
        ) -> anyhow::Result<BatchResponse> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().await.push(message.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            match &self.response {
                Ok(response) => Ok(*response),
                Err(err) => Err(anyhow::anyhow!("{err}")),
            }
        }
    }

    fn payload(tokens: &[&str]) -> NotificationPayload {
        NotificationPayload::new(
            tokens.iter().map(|t| t.to_string()).collect(),
            "Hi",
            "There",
        )
    }

    #[test]
    fn test_outcome_reduction() {
        assert_eq!(
            DispatchOutcome::from_response(BatchResponse::new(3, 0)),
            DispatchOutcome::Delivered { success: 3 }
        );
        assert_eq!(
            DispatchOutcome::from_response(BatchResponse::new(2, 1)),
            DispatchOutcome::PartiallyDelivered {
                success: 2,
                failure: 1
            }
        );
        assert_eq!(
            DispatchOutcome::from_response(BatchResponse::new(0, 4)),
            DispatchOutcome::Failed { failure: 4 }
        );
        assert_eq!(
            DispatchOutcome::PartiallyDelivered {
                success: 2,
                failure: 1
            }
            .token_counts(),
            (2, 1)
        );
    }

    #[tokio::test]
    async fn test_deliver_sends_single_batched_call() {
        let gateway = CountingGateway::new(Ok(BatchResponse::new(2, 0)));
        let message = MulticastMessage::from(
            payload(&["tok-a", "tok-b"]).with_data("k", "v"),
        );

        let outcome =
            deliver(&gateway, &JobId::new("j1"), &message, None).await;

        assert_eq!(outcome, DispatchOutcome::Delivered { success: 2 });
        let calls = gateway.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tokens, vec!["tok-a", "tok-b"]);
        assert_eq!(calls[0].data.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_deliver_skips_empty_tokens() {
        let gateway = CountingGateway::new(Ok(BatchResponse::new(1, 0)));
        let message = MulticastMessage::from(payload(&[]));

        let outcome =
            deliver(&gateway, &JobId::new("j1"), &message, None).await;

        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert!(gateway.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_reports_gateway_error() {
        let gateway =
            CountingGateway::new(Err(anyhow::anyhow!("unauthenticated")));
        let message = MulticastMessage::from(payload(&["tok-a"]));

        let outcome =
            deliver(&gateway, &JobId::new("j1"), &message, None).await;

        match outcome {
            DispatchOutcome::GatewayError { error } => {
                assert!(error.contains("unauthenticated"))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_times_out() {
        let gateway = CountingGateway::new(Ok(BatchResponse::new(1, 0)))
            .with_delay(Duration::from_secs(60));
        let message = MulticastMessage::from(payload(&["tok-a"]));

        let outcome = deliver(
            &gateway,
            &JobId::new("j1"),
            &message,
            Some(Duration::from_secs(5)),
        )
        .await;

        assert_eq!(
            outcome,
            DispatchOutcome::TimedOut {
                after: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test]
    async fn test_dispatcher_caps_concurrent_calls() {
        let gateway = Arc::new(
            CountingGateway::new(Ok(BatchResponse::new(1, 0)))
                .with_delay(Duration::from_millis(20)),
        );
        let config = WorkerConfig::new("w").with_max_in_flight(2);
        let dispatcher =
            Dispatcher::new(Arc::clone(&gateway), &config, InProcEventBus::new(64));

        for i in 0..6 {
            assert!(dispatcher.dispatch(JobId::new(format!("j{i}")), payload(&["t"])));
        }
        dispatcher.drain().await;

        assert_eq!(gateway.calls.lock().await.len(), 6);
        assert!(gateway.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_returns_to_zero_after_drain() {
        let gateway = Arc::new(
            CountingGateway::new(Ok(BatchResponse::new(1, 0)))
                .with_delay(Duration::from_millis(50)),
        );
        let config = WorkerConfig::new("w").with_max_in_flight(4);
        let dispatcher =
            Dispatcher::new(Arc::clone(&gateway), &config, InProcEventBus::new(64));

        for i in 0..3 {
            dispatcher.dispatch(JobId::new(format!("j{i}")), payload(&["t"]));
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while gateway.active.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dispatches did not start");
        assert_eq!(dispatcher.in_flight(), 3);

        dispatcher.drain().await;
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(gateway.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatcher_emits_outcomes() {
        let gateway = Arc::new(CountingGateway::new(Ok(BatchResponse::new(1, 1))));
        let events = InProcEventBus::new(16);
        let mut rx = events.subscribe_events();
        let dispatcher =
            Dispatcher::new(gateway, &WorkerConfig::new("w"), events);

        assert!(!dispatcher.dispatch(JobId::new("empty"), payload(&[])));
        assert!(dispatcher.dispatch(JobId::new("j1"), payload(&["a", "b"])));
        dispatcher.drain().await;

        let mut outcomes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let HeraldEventPayload::Dispatched { job_id, outcome } = event.payload {
                outcomes.push((job_id.to_string(), outcome));
            }
        }
        assert_eq!(
            outcomes,
            vec![
                ("empty".to_string(), DispatchOutcome::Skipped),
                (
                    "j1".to_string(),
                    DispatchOutcome::PartiallyDelivered {
                        success: 1,
                        failure: 1
                    }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        let gateway = Arc::new(
            CountingGateway::new(Ok(BatchResponse::new(1, 0)))
                .with_delay(Duration::from_millis(50)),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&gateway),
            &WorkerConfig::new("w"),
            InProcEventBus::new(8),
        );

        dispatcher.dispatch(JobId::new("j1"), payload(&["t"]));
        assert!(dispatcher.shutdown(Duration::from_secs(5)).await);
        assert_eq!(gateway.calls.lock().await.len(), 1);
    }
}
