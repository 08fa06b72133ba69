//! Herald - delayed push-notification dispatch over a shared due-time queue.
//!
//! Producers store a notification payload under a derived key and add the job
//! identifier to a queue scored by its due time. Any number of herald workers
//! poll that queue; each due job is dispatched at most once, because claiming
//! it is a single atomic conditional removal on the shared store.
//!
//! # Core Concepts
//!
//! - **Queue**: [`DueQueue`] is the ordered index of job ids by due time and
//!   [`PayloadStore`] holds the serialized [`NotificationPayload`]s. Both are
//!   implemented over Redis by [`persistence::RedisStore`].
//!
//! - **Claim loop**: [`ClaimLoop`] fetches a bounded batch of due ids, claims
//!   each one and hands owned jobs on. Every job ends the cycle with a
//!   [`ClaimOutcome`].
//!
//! - **Materializer**: [`JobMaterializer`] reads and deletes a claimed job's
//!   payload, classifying failures as [`MaterializeError`]s.
//!
//! - **Dispatch**: [`Dispatcher`] sends each job through a [`DeliveryGateway`]
//!   on its own task, so a slow gateway never stalls claiming.
//!
//! - **Runtime**: [`DispatchRuntime`] drives the claim loop on a poll
//!   interval until its [`ShutdownToken`] fires.
//!
//! - **Events**: [`InProcEventBus`] broadcasts [`HeraldEvent`]s for every
//!   claim, drop and dispatch.
//!
//! # Feature Flags
//!
//! - `redis` - Redis queue and payload store (default)
//! - `fcm` - Firebase Cloud Messaging gateway (default)
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use herald::*;
//! use herald::persistence::RedisStore;
//! use herald::gateway::FcmGateway;
//!
//! let config = HeraldConfig::from_env()?;
//! let store = Arc::new(RedisStore::from_config(&config.store, config.queue.key_space()).await?);
//! let gateway = Arc::new(FcmGateway::from_config(&config.gateway)?);
//!
//! let runtime = DispatchRuntimeBuilder::from_config(&config)
//!     .with_queue(store.clone())
//!     .with_store(store)
//!     .with_gateway(gateway)
//!     .build()?;
//! runtime.run().await?;
//! ```

/// Claiming due jobs and reporting per-job outcomes.
pub mod claim;

/// Configuration structures for the store, queue, gateway and worker.
///
/// [`HeraldConfig::from_env`] reads every setting from the environment.
pub mod config;

/// Delivery fan-out.
///
/// - [`DeliveryGateway`] - trait for push providers
/// - [`MulticastMessage`] and [`BatchResponse`] - gateway request and reply
/// - [`DispatchOutcome`] - reduced result of one job's delivery
/// - [`Dispatcher`] - bounded, tracked background delivery
pub mod dispatch;

/// Event publishing and subscription.
///
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`HeraldEvent`] and [`HeraldEventPayload`] for event data
/// - [`InProcEventBus`] for in-process event broadcasting
pub mod events;

/// Core job types: [`JobId`], [`DueTime`], [`DueEntry`],
/// [`NotificationPayload`] and [`ClaimOutcome`].
pub mod job;

/// Turning a claimed job id into its payload.
pub mod materialize;

#[cfg(feature = "metrics")]
/// Prometheus collectors, enabled by the `metrics` feature.
pub mod metrics;

/// Scheduling, updating and cancelling notifications.
pub mod producer;

/// Store seams: [`DueQueue`], [`PayloadStore`] and the [`KeySpace`] naming
/// convention shared with producers.
pub mod queue;

/// Tracing spans and outcome recording.
pub mod telemetry;

#[cfg(feature = "redis")]
/// Redis implementation of the queue and payload store.
pub mod persistence;

#[cfg(feature = "fcm")]
/// Firebase Cloud Messaging gateway.
pub mod gateway;

/// Cycle driver and worker management.
///
/// - [`DispatchRuntime`] - polls the queue until shut down
/// - [`DispatchRuntimeBuilder`] - constructs a runtime from its dependencies
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`WorkerConfig`] - per-worker settings
pub mod runtime;

pub use claim::*;
pub use config::*;
pub use dispatch::*;
pub use events::*;
pub use job::*;
pub use materialize::*;
pub use producer::*;
pub use queue::*;
pub use runtime::*;
