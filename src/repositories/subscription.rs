//! # Subscription Repository
//!
//! Tenant-scoped registry of webhook endpoints. Every mutating operation checks
//! ownership by `(id, tenant_id)`; a subscription owned by another tenant is
//! reported as not found.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    EntityTrait, JoinType, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
    TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::error::WebhookError;
use crate::models::delivery::{Column as DeliveryColumn, Entity as DeliveryEntity};
use crate::models::subscription::{
    ActiveModel as SubscriptionActiveModel, Column as SubscriptionColumn,
    Entity as SubscriptionEntity, Model as SubscriptionModel,
};
use crate::models::subscription_event::{
    self, ActiveModel as EventActiveModel, Column as EventColumn, Entity as EventEntity,
};
use crate::signature::{self, RawSecret};

pub const MAX_EVENT_TYPE_LEN: usize = 100;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_TARGET_URL_LEN: usize = 2048;

static EVENT_TYPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_]+(\.[a-z0-9_]+)*$").expect("event type pattern compiles")
});

/// Input for [`SubscriptionRepository::create`].
#[derive(Debug, Clone, Default)]
pub struct NewSubscription {
    pub name: Option<String>,
    pub target_url: String,
    pub events: Vec<String>,
    pub metadata: Option<JsonValue>,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub name: Option<String>,
    pub target_url: Option<String>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
    pub metadata: Option<JsonValue>,
}

/// A subscription with its event set, sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionWithEvents {
    pub subscription: SubscriptionModel,
    pub events: Vec<String>,
}

/// Checks that `target_url` is an absolute http(s) URL with a host.
pub fn validate_target_url(target_url: &str) -> Result<Url, WebhookError> {
    if target_url.len() > MAX_TARGET_URL_LEN {
        return Err(WebhookError::validation(
            "target_url",
            format!("target_url cannot exceed {MAX_TARGET_URL_LEN} characters"),
        ));
    }

    let parsed = Url::parse(target_url.trim()).map_err(|e| {
        WebhookError::validation("target_url", format!("target_url is not a valid URL: {e}"))
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(WebhookError::validation(
            "target_url",
            "target_url must use http or https",
        ));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(WebhookError::validation(
            "target_url",
            "target_url must include a host",
        ));
    }

    Ok(parsed)
}

/// Checks a single event type such as `campaign.completed`.
pub fn validate_event_type(event_type: &str) -> Result<(), WebhookError> {
    if event_type.is_empty() || event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(WebhookError::validation(
            "event_type",
            format!("event type must be 1 to {MAX_EVENT_TYPE_LEN} characters"),
        ));
    }
    if !EVENT_TYPE_PATTERN.is_match(event_type) {
        return Err(WebhookError::validation(
            "event_type",
            format!("event type '{event_type}' must be dot-separated lowercase segments"),
        ));
    }
    Ok(())
}

/// Validates and de-duplicates an event set. An empty set is rejected.
pub fn normalize_events(events: &[String]) -> Result<Vec<String>, WebhookError> {
    let mut normalized = BTreeSet::new();
    for event in events {
        let event = event.trim();
        validate_event_type(event).map_err(|err| match err {
            WebhookError::Validation { message, .. } => WebhookError::validation("events", message),
            other => other,
        })?;
        normalized.insert(event.to_string());
    }

    if normalized.is_empty() {
        return Err(WebhookError::validation(
            "events",
            "at least one event type is required",
        ));
    }

    Ok(normalized.into_iter().collect())
}

fn normalize_name(name: Option<String>) -> Result<Option<String>, WebhookError> {
    let Some(name) = name else {
        return Ok(None);
    };
    let trimmed = name.trim();
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(WebhookError::validation(
            "name",
            format!("name cannot exceed {MAX_NAME_LEN} characters"),
        ));
    }
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

/// Repository for subscription database operations
#[derive(Clone)]
pub struct SubscriptionRepository {
    db: DatabaseConnection,
}

impl SubscriptionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Registers a subscription and returns it together with the raw secret,
    /// which is not retrievable afterwards.
    pub async fn create(
        &self,
        tenant_id: Uuid,
        input: NewSubscription,
    ) -> Result<(SubscriptionWithEvents, RawSecret), WebhookError> {
        let target_url = validate_target_url(&input.target_url)?;
        let events = normalize_events(&input.events)?;
        let name = normalize_name(input.name)?;

        let secret = signature::generate_secret();
        let now = Utc::now().fixed_offset();
        let id = Uuid::new_v4();

        let txn = self.db.begin().await?;

        let subscription = SubscriptionActiveModel {
            id: Set(id),
            tenant_id: Set(tenant_id),
            name: Set(name),
            target_url: Set(target_url.to_string()),
            secret_hash: Set(secret.digest()),
            active: Set(true),
            metadata: Set(input.metadata),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        insert_events(&txn, tenant_id, id, &events).await?;
        txn.commit().await?;

        info!(
            tenant_id = %tenant_id,
            subscription_id = %id,
            events = ?events,
            "Webhook subscription created"
        );

        Ok((
            SubscriptionWithEvents {
                subscription,
                events,
            },
            secret,
        ))
    }

    /// Fetches a subscription owned by `tenant_id`.
    pub async fn get(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<SubscriptionWithEvents, WebhookError> {
        let subscription = self.find_owned(&self.db, tenant_id, id).await?;
        let events = load_events(&self.db, id).await?;
        Ok(SubscriptionWithEvents {
            subscription,
            events,
        })
    }

    /// All subscriptions of a tenant, newest first.
    pub async fn list(&self, tenant_id: Uuid) -> Result<Vec<SubscriptionWithEvents>, WebhookError> {
        let subscriptions = SubscriptionEntity::find()
            .filter(SubscriptionColumn::TenantId.eq(tenant_id))
            .order_by_desc(SubscriptionColumn::CreatedAt)
            .order_by_asc(SubscriptionColumn::Id)
            .all(&self.db)
            .await?;

        let ids: Vec<Uuid> = subscriptions.iter().map(|s| s.id).collect();
        let mut events_by_subscription: HashMap<Uuid, Vec<String>> = HashMap::new();
        if !ids.is_empty() {
            let rows = EventEntity::find()
                .filter(EventColumn::SubscriptionId.is_in(ids))
                .order_by_asc(EventColumn::EventType)
                .all(&self.db)
                .await?;
            for row in rows {
                events_by_subscription
                    .entry(row.subscription_id)
                    .or_default()
                    .push(row.event_type);
            }
        }

        Ok(subscriptions
            .into_iter()
            .map(|subscription| SubscriptionWithEvents {
                events: events_by_subscription
                    .remove(&subscription.id)
                    .unwrap_or_default(),
                subscription,
            })
            .collect())
    }

    /// Applies a partial update. Replacing the event set is atomic.
    pub async fn update(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        patch: SubscriptionPatch,
    ) -> Result<SubscriptionWithEvents, WebhookError> {
        let target_url = patch
            .target_url
            .as_deref()
            .map(validate_target_url)
            .transpose()?;
        let events = patch.events.as_deref().map(normalize_events).transpose()?;
        let name = match patch.name {
            Some(name) => Some(normalize_name(Some(name))?),
            None => None,
        };

        let txn = self.db.begin().await?;
        let existing = self.find_owned(&txn, tenant_id, id).await?;
        let was_active = existing.active;

        let mut active: SubscriptionActiveModel = existing.into();
        if let Some(name) = name {
            active.name = Set(name);
        }
        if let Some(url) = target_url {
            active.target_url = Set(url.to_string());
        }
        if let Some(flag) = patch.active {
            active.active = Set(flag);
        }
        if let Some(metadata) = patch.metadata {
            active.metadata = Set(Some(metadata));
        }
        active.updated_at = Set(Utc::now().fixed_offset());
        let subscription = active.update(&txn).await?;

        if let Some(events) = &events {
            EventEntity::delete_many()
                .filter(EventColumn::SubscriptionId.eq(id))
                .exec(&txn)
                .await?;
            insert_events(&txn, tenant_id, id, events).await?;
        }

        let events = match events {
            Some(events) => events,
            None => load_events(&txn, id).await?,
        };
        txn.commit().await?;

        if was_active != subscription.active {
            info!(
                tenant_id = %tenant_id,
                subscription_id = %id,
                active = subscription.active,
                "Webhook subscription active flag changed"
            );
        }

        Ok(SubscriptionWithEvents {
            subscription,
            events,
        })
    }

    /// Removes a subscription together with its event set and delivery history.
    pub async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<(), WebhookError> {
        let txn = self.db.begin().await?;
        let mut owned = SubscriptionEntity::find_by_id(id)
            .filter(SubscriptionColumn::TenantId.eq(tenant_id));
        if txn.get_database_backend() == DatabaseBackend::Postgres {
            owned = owned.lock_exclusive();
        }
        owned
            .one(&txn)
            .await?
            .ok_or_else(|| WebhookError::subscription_not_found(id))?;

        let deliveries = DeliveryEntity::delete_many()
            .filter(DeliveryColumn::SubscriptionId.eq(id))
            .exec(&txn)
            .await?;
        EventEntity::delete_many()
            .filter(EventColumn::SubscriptionId.eq(id))
            .exec(&txn)
            .await?;
        SubscriptionEntity::delete_by_id(id).exec(&txn).await?;
        txn.commit().await?;

        info!(
            tenant_id = %tenant_id,
            subscription_id = %id,
            deliveries_removed = deliveries.rows_affected,
            "Webhook subscription deleted"
        );
        Ok(())
    }

    /// Issues a new secret. Deliveries already enqueued keep their original signature.
    pub async fn rotate_secret(&self, tenant_id: Uuid, id: Uuid) -> Result<RawSecret, WebhookError> {
        let existing = self.find_owned(&self.db, tenant_id, id).await?;
        let secret = signature::generate_secret();

        let mut active: SubscriptionActiveModel = existing.into();
        active.secret_hash = Set(secret.digest());
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&self.db).await?;

        info!(tenant_id = %tenant_id, subscription_id = %id, "Webhook secret rotated");
        Ok(secret)
    }

    /// Active subscriptions of `tenant_id` whose event set contains `event_type`.
    ///
    /// On Postgres the matched rows are share-locked, so a concurrent delete
    /// waits until the caller's transaction ends.
    pub async fn active_for_event<C: ConnectionTrait>(
        conn: &C,
        tenant_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<SubscriptionModel>, WebhookError> {
        let mut query = SubscriptionEntity::find()
            .join(
                JoinType::InnerJoin,
                crate::models::subscription::Relation::Events.def(),
            )
            .filter(EventColumn::TenantId.eq(tenant_id))
            .filter(EventColumn::EventType.eq(event_type))
            .filter(SubscriptionColumn::TenantId.eq(tenant_id))
            .filter(SubscriptionColumn::Active.eq(true))
            .order_by_asc(SubscriptionColumn::CreatedAt)
            .order_by_asc(SubscriptionColumn::Id);
        if conn.get_database_backend() == DatabaseBackend::Postgres {
            query = query.lock_shared();
        }
        Ok(query.all(conn).await?)
    }

    /// Owned lookup on any connection, share-locked on Postgres like
    /// [`Self::active_for_event`].
    pub async fn find_for_tenant<C: ConnectionTrait>(
        conn: &C,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<SubscriptionModel, WebhookError> {
        let mut query = SubscriptionEntity::find_by_id(id)
            .filter(SubscriptionColumn::TenantId.eq(tenant_id));
        if conn.get_database_backend() == DatabaseBackend::Postgres {
            query = query.lock_shared();
        }
        query
            .one(conn)
            .await?
            .ok_or_else(|| WebhookError::subscription_not_found(id))
    }

    /// Unscoped lookup used by the delivery worker.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<SubscriptionModel>, WebhookError> {
        Ok(SubscriptionEntity::find_by_id(id).one(&self.db).await?)
    }

    async fn find_owned<C: ConnectionTrait>(
        &self,
        conn: &C,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<SubscriptionModel, WebhookError> {
        SubscriptionEntity::find_by_id(id)
            .filter(SubscriptionColumn::TenantId.eq(tenant_id))
            .one(conn)
            .await?
            .ok_or_else(|| WebhookError::subscription_not_found(id))
    }
}

async fn insert_events<C: ConnectionTrait>(
    conn: &C,
    tenant_id: Uuid,
    subscription_id: Uuid,
    events: &[String],
) -> Result<(), WebhookError> {
    let rows = events.iter().map(|event_type| EventActiveModel {
        id: Set(Uuid::new_v4()),
        subscription_id: Set(subscription_id),
        tenant_id: Set(tenant_id),
        event_type: Set(event_type.clone()),
    });
    EventEntity::insert_many(rows).exec(conn).await?;
    Ok(())
}

async fn load_events<C: ConnectionTrait>(
    conn: &C,
    subscription_id: Uuid,
) -> Result<Vec<String>, WebhookError> {
    let rows: Vec<subscription_event::Model> = EventEntity::find()
        .filter(EventColumn::SubscriptionId.eq(subscription_id))
        .order_by_asc(EventColumn::EventType)
        .all(conn)
        .await?;
    Ok(rows.into_iter().map(|row| row.event_type).collect())
}
