use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::{HeraldConfig, DEFAULT_BATCH_SIZE};
use crate::dispatch::DeliveryGateway;
use crate::events::InProcEventBus;
use crate::queue::{DueQueue, KeySpace, PayloadStore};

use super::supervisor::DispatchRuntime;
use super::worker::WorkerConfig;

/// Builder for constructing a `DispatchRuntime` with explicit dependencies.
///
/// Queue, payload store and gateway are required; key space, batch size and
/// event bus fall back to defaults.
///
/// # Example
///
/// ```ignore
/// use herald::*;
///
/// let runtime = DispatchRuntimeBuilder::new(WorkerConfig::new("worker-1"))
///     .with_queue(store.clone())
///     .with_store(store)
///     .with_gateway(gateway)
///     .with_batch_size(10)
///     .build()?;
/// ```
pub struct DispatchRuntimeBuilder<Q, S, G>
where
    Q: DueQueue + 'static,
    S: PayloadStore + 'static,
    G: DeliveryGateway + 'static,
{
    config: WorkerConfig,
    queue: Option<Arc<Q>>,
    store: Option<Arc<S>>,
    gateway: Option<Arc<G>>,
    events: Option<InProcEventBus>,
    keys: Option<KeySpace>,
    batch_size: usize,
}

impl<Q, S, G> fmt::Debug for DispatchRuntimeBuilder<Q, S, G>
where
    Q: DueQueue + 'static,
    S: PayloadStore + 'static,
    G: DeliveryGateway + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("DispatchRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("queue_set", &self.queue.is_some());
        debug.field("store_set", &self.store.is_some());
        debug.field("gateway_set", &self.gateway.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("keys", &self.keys);
        debug.field("batch_size", &self.batch_size);

        if self.queue.is_some() {
            debug.field("queue_type", &type_name::<Q>());
        }
        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        if self.gateway.is_some() {
            debug.field("gateway_type", &type_name::<G>());
        }

        debug.finish()
    }
}

impl<Q, S, G> DispatchRuntimeBuilder<Q, S, G>
where
    Q: DueQueue + 'static,
    S: PayloadStore + 'static,
    G: DeliveryGateway + 'static,
{
    /// Create a new builder with the given worker configuration.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            queue: None,
            store: None,
            gateway: None,
            events: None,
            keys: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Start from a full process configuration: worker settings, key space
    /// and batch size are taken from it.
    pub fn from_config(config: &HeraldConfig) -> Self {
        Self::new(config.worker.clone())
            .with_keys(config.queue.key_space())
            .with_batch_size(config.queue.batch_size)
    }

    /// Set the due-time queue.
    pub fn with_queue(mut self, queue: Arc<Q>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the payload store.
    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the delivery gateway.
    pub fn with_gateway(mut self, gateway: Arc<G>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the event bus.
    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_keys(mut self, keys: KeySpace) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Build the `DispatchRuntime` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<DispatchRuntime<Q, S, G>> {
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let gateway = self
            .gateway
            .ok_or_else(|| anyhow::anyhow!("gateway dependency missing"))?;

        Ok(DispatchRuntime::new(
            self.config,
            queue,
            store,
            gateway,
            self.keys.unwrap_or_default(),
            self.batch_size,
            self.events.unwrap_or_default(),
        ))
    }
}
