use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::claim::{ClaimLoop, CycleReport};
use crate::dispatch::{DeliveryGateway, Dispatcher};
use crate::events::InProcEventBus;
use crate::job::DueTime;
use crate::queue::{DueQueue, KeySpace, PayloadStore};

use super::worker::WorkerConfig;

/// Token for signaling graceful shutdown to the cycle driver.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // Registered before the flag check so a concurrent cancel is not missed.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the claim loop on a fixed poll interval until shut down.
pub struct DispatchRuntime<Q, S, G>
where
    Q: DueQueue + 'static,
    S: PayloadStore + 'static,
    G: DeliveryGateway + 'static,
{
    config: WorkerConfig,
    queue: Arc<Q>,
    claim_loop: ClaimLoop<Q, S, G>,
    dispatcher: Arc<Dispatcher<G>>,
    events: InProcEventBus,
    shutdown_token: ShutdownToken,
}

impl<Q, S, G> fmt::Debug for DispatchRuntime<Q, S, G>
where
    Q: DueQueue + 'static,
    S: PayloadStore + 'static,
    G: DeliveryGateway + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRuntime")
            .field("config", &self.config)
            .field("queue_type", &type_name::<Q>())
            .field("store_type", &type_name::<S>())
            .field("gateway_type", &type_name::<G>())
            .field("claim_loop", &self.claim_loop)
            .field("shutdown", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<Q, S, G> DispatchRuntime<Q, S, G>
where
    Q: DueQueue + 'static,
    S: PayloadStore + 'static,
    G: DeliveryGateway + 'static,
{
    pub fn new(
        config: WorkerConfig,
        queue: Arc<Q>,
        store: Arc<S>,
        gateway: Arc<G>,
        keys: KeySpace,
        batch_size: usize,
        events: InProcEventBus,
    ) -> Self {
        let dispatcher =
            Arc::new(Dispatcher::new(gateway, &config, events.clone()));
        let claim_loop = ClaimLoop::new(
            Arc::clone(&queue),
            store,
            keys,
            Arc::clone(&dispatcher),
            events.clone(),
        )
        .with_batch_size(batch_size)
        .with_transient_policy(config.transient_policy)
        .with_worker_id(config.worker_id.clone());

        Self {
            config,
            queue,
            claim_loop,
            dispatcher,
            events,
            shutdown_token: ShutdownToken::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher<G>> {
        Arc::clone(&self.dispatcher)
    }

    pub fn events(&self) -> InProcEventBus {
        self.events.clone()
    }

    pub fn claim_loop(&self) -> &ClaimLoop<Q, S, G> {
        &self.claim_loop
    }

    /// Token that stops [`DispatchRuntime::run`] between cycles.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Run a single claim cycle at `now` without sleeping.
    pub async fn run_cycle(&self, now: DueTime) -> CycleReport {
        self.claim_loop.run_cycle(now).await
    }

    /// Poll the queue until the shutdown token fires, then wait for
    /// in-flight dispatches up to the configured grace period.
    pub async fn run(&self) -> anyhow::Result<()> {
        let interval = self.config.poll_interval();
        tracing::info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.claim_loop.batch_size(),
            "dispatch runtime started"
        );

        while !self.shutdown_token.is_cancelled() {
            let report = self.run_cycle(DueTime::now()).await;
            if !report.is_empty() {
                tracing::debug!(
                    due = report.due,
                    claimed = report.claimed(),
                    dispatched = report.dispatched(),
                    "cycle complete"
                );
            }

            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("dispatch runtime shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Signal shutdown and wait for in-flight dispatches.
    ///
    /// Returns `false` if the grace period elapsed first.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_token.cancel();
        self.drain().await
    }

    async fn drain(&self) -> bool {
        let drained = self
            .dispatcher
            .shutdown(self.config.shutdown_grace())
            .await;
        if drained {
            tracing::info!("dispatch runtime shutdown complete");
        }
        drained
    }
}
