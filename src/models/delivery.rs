//! Delivery entity model
//!
//! This module contains the SeaORM entity model for the `webhook_deliveries`
//! table. Each row tracks one event's journey to one subscription: the exact
//! payload bytes, the signature computed at enqueue time, the attempt counter
//! and the schedule for the next attempt.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Delivery entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "webhook_deliveries")]
pub struct Model {
    /// Unique identifier, also sent as `X-Webhook-Delivery`
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier copied from the owning subscription
    pub tenant_id: Uuid,

    /// Owning subscription
    pub subscription_id: Uuid,

    /// Event type, e.g. `campaign.completed`
    pub event_type: String,

    /// Canonical JSON payload exactly as transmitted
    #[sea_orm(column_type = "Text")]
    pub payload: String,

    /// Hex HMAC-SHA256 of `payload`
    #[sea_orm(column_type = "Text")]
    pub signature: String,

    /// One of `pending`, `retrying`, `success`, `failed`
    pub status: String,

    /// Number of attempts made so far
    pub attempts: i32,

    /// Earliest time the next attempt may run
    pub next_attempt_at: DateTimeWithTimeZone,

    /// HTTP status of the most recent response, if any was received
    pub last_status_code: Option<i32>,

    /// Error text of the most recent failed attempt
    pub last_error: Option<String>,

    pub delivered_at: Option<DateTimeWithTimeZone>,
    pub failed_at: Option<DateTimeWithTimeZone>,

    /// Token of the worker batch currently holding the claim lease
    pub claim_token: Option<Uuid>,

    /// Claim lease expiry; an expired lease makes the row claimable again
    pub claimed_until: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::subscription::Entity",
        from = "Column::SubscriptionId",
        to = "super::subscription::Column::Id",
        on_delete = "Cascade"
    )]
    Subscription,
}

impl Related<super::subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscription.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parsed status; unknown values are reported as `Failed` so they are never retried.
    pub fn delivery_status(&self) -> DeliveryStatus {
        self.status.parse().unwrap_or(DeliveryStatus::Failed)
    }
}

/// Delivery lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 4] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Retrying,
        DeliveryStatus::Success,
        DeliveryStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// `success` and `failed` are final; nothing mutates a terminal row.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }

    /// Status strings a worker may claim.
    pub fn claimable() -> [&'static str; 2] {
        [
            DeliveryStatus::Pending.as_str(),
            DeliveryStatus::Retrying.as_str(),
        ]
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(DeliveryStatus::Pending),
            "retrying" => Ok(DeliveryStatus::Retrying),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{other}'")),
        }
    }
}
