//! # Event Dispatcher
//!
//! Fans a domain event out to every active subscription of the tenant that
//! listens for it. The canonical payload is serialized once, signed per
//! subscription and persisted as `pending` deliveries in a single transaction;
//! nothing is sent over the network here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::WebhookError;
use crate::models::DeliveryStatus;
use crate::models::subscription::Model as SubscriptionModel;
use crate::repositories::delivery::{DeliveryRepository, PendingDelivery};
use crate::repositories::subscription::{SubscriptionRepository, validate_event_type};
use crate::signature;

/// Event type used by [`EventDispatcher::dispatch_test`].
pub const TEST_EVENT_TYPE: &str = "webhook.test";

/// Body transmitted to subscribers, byte-for-byte what gets signed.
#[derive(Debug, Serialize)]
struct EventEnvelope<'a> {
    event: &'a str,
    #[serde(rename = "emittedAt")]
    emitted_at: DateTime<Utc>,
    data: &'a JsonValue,
}

/// Serialize the canonical payload for an event emitted at `emitted_at`.
pub fn canonical_payload(
    event_type: &str,
    emitted_at: DateTime<Utc>,
    data: &JsonValue,
) -> Result<String, WebhookError> {
    Ok(serde_json::to_string(&EventEnvelope {
        event: event_type,
        emitted_at,
        data,
    })?)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DispatchedDelivery {
    pub subscription_id: Uuid,
    pub delivery_id: Uuid,
    pub status: DeliveryStatus,
}

/// Outcome of a dispatch call.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct DispatchResult {
    /// Number of subscriptions a delivery was enqueued for
    pub triggered_count: usize,
    pub deliveries: Vec<DispatchedDelivery>,
}

#[derive(Clone)]
pub struct EventDispatcher {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
}

impl EventDispatcher {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Enqueue one delivery per matching active subscription.
    ///
    /// Zero matches is not an error. The lookup and the inserts share one
    /// transaction, so either every delivery is persisted or none is, and a
    /// subscription deleted concurrently is either fully matched or not at all.
    #[instrument(skip(self, data), fields(tenant_id = %tenant_id, event_type = %event_type))]
    pub async fn dispatch(
        &self,
        tenant_id: Uuid,
        event_type: &str,
        data: &JsonValue,
    ) -> Result<DispatchResult, WebhookError> {
        validate_event_type(event_type)?;

        let txn = self.db.begin().await?;
        let targets =
            SubscriptionRepository::active_for_event(&txn, tenant_id, event_type).await?;

        if targets.is_empty() {
            txn.commit().await?;
            debug!("No active subscriptions for event");
            return Ok(DispatchResult::default());
        }

        let now = self.clock.now();
        let payload = canonical_payload(event_type, now, data)?;
        let deliveries = enqueue(&txn, tenant_id, event_type, &payload, &targets, now).await?;
        txn.commit().await?;

        counter!("webhook_dispatched_total", "event_type" => event_type.to_string())
            .increment(deliveries.len() as u64);
        info!(
            triggered_count = deliveries.len(),
            "Event dispatched to webhook subscriptions"
        );

        Ok(DispatchResult {
            triggered_count: deliveries.len(),
            deliveries,
        })
    }

    /// Enqueue a `webhook.test` delivery for a single active subscription.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn dispatch_test(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<DispatchedDelivery, WebhookError> {
        let txn = self.db.begin().await?;
        let subscription =
            SubscriptionRepository::find_for_tenant(&txn, tenant_id, subscription_id).await?;
        if !subscription.active {
            return Err(WebhookError::SubscriptionInactive {
                id: subscription_id,
            });
        }

        let now = self.clock.now();
        let data = json!({
            "subscriptionId": subscription_id,
            "message": "This is a test webhook delivery",
        });
        let payload = canonical_payload(TEST_EVENT_TYPE, now, &data)?;

        let mut deliveries = enqueue(
            &txn,
            tenant_id,
            TEST_EVENT_TYPE,
            &payload,
            std::slice::from_ref(&subscription),
            now,
        )
        .await?;
        txn.commit().await?;

        counter!("webhook_dispatched_total", "event_type" => TEST_EVENT_TYPE).increment(1);

        deliveries
            .pop()
            .ok_or_else(|| WebhookError::subscription_not_found(subscription_id))
    }
}

async fn enqueue<C: ConnectionTrait>(
    conn: &C,
    tenant_id: Uuid,
    event_type: &str,
    payload: &str,
    targets: &[SubscriptionModel],
    now: DateTime<Utc>,
) -> Result<Vec<DispatchedDelivery>, WebhookError> {
    let mut deliveries = Vec::with_capacity(targets.len());

    for subscription in targets {
        let signature = signature::sign(payload.as_bytes(), &subscription.secret_hash)?;
        let delivery = DeliveryRepository::insert_pending(
            conn,
            PendingDelivery {
                tenant_id,
                subscription_id: subscription.id,
                event_type: event_type.to_string(),
                payload: payload.to_string(),
                signature,
            },
            now,
        )
        .await?;

        deliveries.push(DispatchedDelivery {
            subscription_id: subscription.id,
            delivery_id: delivery.id,
            status: DeliveryStatus::Pending,
        });
    }

    Ok(deliveries)
}
