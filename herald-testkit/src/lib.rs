//! In-memory fakes for exercising herald without Redis or a push provider.
mod job;
mod mock;
mod queue;

pub use job::*;
pub use mock::*;
pub use queue::*;
