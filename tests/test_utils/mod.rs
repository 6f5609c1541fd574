//! Test utilities for database and delivery testing.
//!
//! In-memory SQLite with migrations applied, a settable clock and a scripted
//! transport that records every outbound request instead of sending it.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use uuid::Uuid;

use webhooks::clock::{Clock, ManualClock};
use webhooks::config::DeliveryConfig;
use webhooks::models::delivery::{self, Entity as DeliveryEntity};
use webhooks::repositories::subscription::{
    NewSubscription, SubscriptionRepository, SubscriptionWithEvents,
};
use webhooks::signature::RawSecret;
use webhooks::transport::{
    OutboundWebhook, TransportError, TransportResponse, WebhookTransport,
};
use webhooks::worker::DeliveryWorker;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Fixed, whole-second starting instant for deterministic schedules.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

pub fn ok(status_code: u16) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status_code,
        body_snippet: String::new(),
    })
}

/// Transport that replays scripted results in order and records requests.
///
/// Once the script is exhausted every request gets `fallback`.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    fallback: Result<TransportResponse, TransportError>,
    sent: Mutex<Vec<OutboundWebhook>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn always(result: Result<TransportResponse, TransportError>) -> Arc<Self> {
        Self::scripted(Vec::new(), result)
    }

    pub fn scripted(
        script: Vec<Result<TransportResponse, TransportError>>,
        fallback: Result<TransportResponse, TransportError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            sent: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    /// Successful transport that sleeps before answering.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: ok(200),
            sent: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn sent(&self) -> Vec<OutboundWebhook> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn send(&self, webhook: &OutboundWebhook) -> Result<TransportResponse, TransportError> {
        self.sent.lock().unwrap().push(webhook.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn delivery_config() -> DeliveryConfig {
    DeliveryConfig::default()
}

pub fn worker(
    db: &DatabaseConnection,
    transport: Arc<dyn WebhookTransport>,
    clock: Arc<dyn Clock>,
) -> DeliveryWorker {
    DeliveryWorker::new(db.clone(), transport, clock, &delivery_config())
}

pub async fn create_subscription(
    db: &DatabaseConnection,
    tenant_id: Uuid,
    target_url: &str,
    events: &[&str],
) -> Result<(SubscriptionWithEvents, RawSecret)> {
    let repo = SubscriptionRepository::new(db.clone());
    let created = repo
        .create(
            tenant_id,
            NewSubscription {
                name: Some("test subscription".to_string()),
                target_url: target_url.to_string(),
                events: events.iter().map(|e| e.to_string()).collect(),
                metadata: None,
            },
        )
        .await?;
    Ok(created)
}

pub async fn deliveries_for(
    db: &DatabaseConnection,
    subscription_id: Uuid,
) -> Result<Vec<delivery::Model>> {
    Ok(DeliveryEntity::find()
        .filter(delivery::Column::SubscriptionId.eq(subscription_id))
        .order_by_asc(delivery::Column::CreatedAt)
        .all(db)
        .await?)
}

pub async fn reload(db: &DatabaseConnection, id: Uuid) -> Result<delivery::Model> {
    DeliveryEntity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow::anyhow!("delivery {id} missing"))
}
