//! Store backends for the due-time queue and payload store.
//!
//! [`RedisStore`] implements both [`DueQueue`](crate::queue::DueQueue) and
//! [`PayloadStore`](crate::queue::PayloadStore) over a single connection.
pub mod redis;

pub use self::redis::RedisStore;
