//! # Data Models
//!
//! SeaORM entities for subscriptions, their event sets and deliveries.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod delivery;
pub mod subscription;
pub mod subscription_event;

pub use delivery::DeliveryStatus;
pub use delivery::Entity as Delivery;
pub use subscription::Entity as Subscription;
pub use subscription_event::Entity as SubscriptionEvent;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "webhooks".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
