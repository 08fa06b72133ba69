//! Push delivery gateways.
pub mod fcm;

pub use fcm::{FcmGateway, ServiceAccountKey};
