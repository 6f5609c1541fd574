//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM operations
//! for the webhook tables, providing a clean API for data access with tenant-aware methods.

pub mod delivery;
pub mod subscription;

pub use delivery::{DeliveryOutcome, DeliveryRepository, DeliveryStatistics, PendingDelivery};
pub use subscription::{
    NewSubscription, SubscriptionPatch, SubscriptionRepository, SubscriptionWithEvents,
};
