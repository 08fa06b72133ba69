/// Runtime builder for constructing dispatch runtimes.
pub mod builder;
/// Cycle driver and shutdown signalling.
pub mod supervisor;
/// Worker configuration.
pub mod worker;

pub use builder::DispatchRuntimeBuilder;
pub use supervisor::{DispatchRuntime, ShutdownToken};
pub use worker::WorkerConfig;
