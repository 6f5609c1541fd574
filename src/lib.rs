//! # Webhooks Library
//!
//! Tenant-scoped webhook subscriptions, HMAC-signed event fan-out and a
//! durable, retried delivery pipeline, exposed through an axum API.

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod retry;
pub mod server;
pub mod signature;
pub mod telemetry;
pub mod transport;
pub mod worker;
pub use migration;
