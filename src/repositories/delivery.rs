//! # Delivery Repository
//!
//! Durable delivery records and the claim primitive the worker pool relies on.
//!
//! Claiming stamps due rows with a batch token and a lease expiry
//! (`claim_token`, `claimed_until`) through a guarded `UPDATE` that re-checks
//! eligibility, so two workers can never both own a row. On Postgres the
//! candidate select also takes `FOR UPDATE SKIP LOCKED`. The claim transaction
//! commits before any network I/O; finalization is guarded by the same token.

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Expr, LockBehavior, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseBackend,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::WebhookError;
use crate::models::delivery::{
    ActiveModel as DeliveryActiveModel, Column, DeliveryStatus, Entity as DeliveryEntity, Model,
};

pub const DEFAULT_HISTORY_LIMIT: u64 = 50;
pub const MAX_HISTORY_LIMIT: u64 = 100;
pub const DEFAULT_STATS_WINDOW_DAYS: i64 = 7;
pub const MAX_STATS_WINDOW_DAYS: i64 = 365;

/// A signed delivery ready to be enqueued.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub event_type: String,
    pub payload: String,
    pub signature: String,
}

/// Result of one processing step, written back by [`DeliveryRepository::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// 2xx received.
    Succeeded { status_code: u16 },
    /// Attempt failed; another one is scheduled.
    Retry {
        next_attempt_at: DateTime<Utc>,
        status_code: Option<u16>,
        error: String,
    },
    /// Terminal failure: attempts exhausted or subscription gone.
    Failed {
        status_code: Option<u16>,
        error: String,
    },
}

impl DeliveryOutcome {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            DeliveryOutcome::Succeeded { .. } => DeliveryStatus::Success,
            DeliveryOutcome::Retry { .. } => DeliveryStatus::Retrying,
            DeliveryOutcome::Failed { .. } => DeliveryStatus::Failed,
        }
    }
}

/// Per-subscription delivery counts over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct DeliveryStatistics {
    pub window_days: i64,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub retrying: u64,
    /// `succeeded / total * 100`, two decimals; 0 when there are no deliveries.
    pub success_rate_percent: f64,
}

impl DeliveryStatistics {
    fn from_counts(window_days: i64, counts: &[(String, i64)]) -> Self {
        let mut stats = DeliveryStatistics {
            window_days,
            ..Default::default()
        };
        for (status, count) in counts {
            let count = (*count).max(0) as u64;
            match status.parse::<DeliveryStatus>() {
                Ok(DeliveryStatus::Success) => stats.succeeded += count,
                Ok(DeliveryStatus::Failed) => stats.failed += count,
                Ok(DeliveryStatus::Pending) => stats.pending += count,
                Ok(DeliveryStatus::Retrying) => stats.retrying += count,
                Err(_) => {}
            }
            stats.total += count;
        }
        stats.success_rate_percent = success_rate(stats.succeeded, stats.total);
        stats
    }
}

fn success_rate(succeeded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rate = succeeded as f64 / total as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

/// Clamp a requested history page size into `1..=100`, defaulting to 50.
pub fn clamp_history_limit(limit: Option<u64>) -> u64 {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

/// Clamp a statistics window into `1..=365` days, defaulting to 7.
pub fn clamp_window_days(window_days: Option<i64>) -> i64 {
    window_days
        .unwrap_or(DEFAULT_STATS_WINDOW_DAYS)
        .clamp(1, MAX_STATS_WINDOW_DAYS)
}

/// Repository for delivery records
#[derive(Clone)]
pub struct DeliveryRepository {
    db: DatabaseConnection,
}

impl DeliveryRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts a `pending` delivery due at `now`.
    ///
    /// Takes any connection so the dispatcher can enqueue a whole fan-out in
    /// one transaction.
    pub async fn insert_pending<C: ConnectionTrait>(
        conn: &C,
        pending: PendingDelivery,
        now: DateTime<Utc>,
    ) -> Result<Model, WebhookError> {
        let now = now.fixed_offset();
        let delivery = DeliveryActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(pending.tenant_id),
            subscription_id: Set(pending.subscription_id),
            event_type: Set(pending.event_type),
            payload: Set(pending.payload),
            signature: Set(pending.signature),
            status: Set(DeliveryStatus::Pending.as_str().to_string()),
            attempts: Set(0),
            next_attempt_at: Set(now),
            last_status_code: Set(None),
            last_error: Set(None),
            delivered_at: Set(None),
            failed_at: Set(None),
            claim_token: Set(None),
            claimed_until: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(delivery.insert(conn).await?)
    }

    /// Claims up to `batch_size` due deliveries for the calling worker.
    ///
    /// A row is due when its status is `pending` or `retrying`, its
    /// `next_attempt_at` has passed and it carries no live lease.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_size: u64,
        lease: Duration,
    ) -> Result<Vec<Model>, WebhookError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let now_db = now.fixed_offset();
        let txn = self.db.begin().await?;

        let mut candidates = DeliveryEntity::find()
            .select_only()
            .column(Column::Id)
            .filter(due_condition(now))
            .order_by_asc(Column::NextAttemptAt)
            .order_by_asc(Column::CreatedAt)
            .limit(batch_size);
        if txn.get_database_backend() == DatabaseBackend::Postgres {
            candidates = candidates.lock_with_behavior(LockType::Update, LockBehavior::SkipLocked);
        }
        let ids: Vec<Uuid> = candidates.into_tuple().all(&txn).await?;

        if ids.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        let token = Uuid::new_v4();
        let claimed_until = (now + lease).fixed_offset();

        // Re-check eligibility in the UPDATE itself; a row taken by another worker
        // between the select and here is skipped.
        let update = DeliveryEntity::update_many()
            .col_expr(Column::ClaimToken, Expr::value(token))
            .col_expr(Column::ClaimedUntil, Expr::value(claimed_until))
            .col_expr(Column::UpdatedAt, Expr::value(now_db))
            .filter(Column::Id.is_in(ids.clone()))
            .filter(due_condition(now))
            .exec(&txn)
            .await?;

        let claimed = if update.rows_affected > 0 {
            DeliveryEntity::find()
                .filter(Column::ClaimToken.eq(token))
                .order_by_asc(Column::NextAttemptAt)
                .order_by_asc(Column::CreatedAt)
                .all(&txn)
                .await?
        } else {
            Vec::new()
        };

        txn.commit().await?;

        debug!(
            candidates = ids.len(),
            claimed = claimed.len(),
            claim_token = %token,
            "Claimed due deliveries"
        );

        Ok(claimed)
    }

    /// Writes the outcome of processing `claimed` and releases its lease.
    ///
    /// `attempts` is the new attempt count. Returns `false` when the claim was
    /// lost (lease expired and another worker took over, or the row is
    /// already terminal); nothing is written in that case.
    pub async fn finalize(
        &self,
        claimed: &Model,
        attempts: i32,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, WebhookError> {
        let Some(token) = claimed.claim_token else {
            warn!(delivery_id = %claimed.id, "Refusing to finalize an unclaimed delivery");
            return Ok(false);
        };
        let now_db = now.fixed_offset();
        let attempts = attempts.max(claimed.attempts);

        let mut update = DeliveryEntity::update_many()
            .col_expr(Column::Status, Expr::value(outcome.status().as_str()))
            .col_expr(Column::Attempts, Expr::value(attempts))
            .col_expr(Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::ClaimedUntil,
                Expr::value(Option::<DateTime<chrono::FixedOffset>>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now_db));

        update = match outcome {
            DeliveryOutcome::Succeeded { status_code } => update
                .col_expr(Column::LastStatusCode, Expr::value(Some(*status_code as i32)))
                .col_expr(Column::LastError, Expr::value(Option::<String>::None))
                .col_expr(Column::DeliveredAt, Expr::value(Some(now_db))),
            DeliveryOutcome::Retry {
                next_attempt_at,
                status_code,
                error,
            } => update
                .col_expr(
                    Column::LastStatusCode,
                    Expr::value(status_code.map(i32::from)),
                )
                .col_expr(Column::LastError, Expr::value(Some(error.clone())))
                .col_expr(
                    Column::NextAttemptAt,
                    Expr::value(next_attempt_at.fixed_offset()),
                ),
            DeliveryOutcome::Failed { status_code, error } => update
                .col_expr(
                    Column::LastStatusCode,
                    Expr::value(status_code.map(i32::from)),
                )
                .col_expr(Column::LastError, Expr::value(Some(error.clone())))
                .col_expr(Column::FailedAt, Expr::value(Some(now_db))),
        };

        let result = update
            .filter(Column::Id.eq(claimed.id))
            .filter(Column::ClaimToken.eq(token))
            .filter(Column::Status.is_in(DeliveryStatus::claimable()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            warn!(
                delivery_id = %claimed.id,
                claim_token = %token,
                "Delivery claim lost before finalization; outcome discarded"
            );
            return Ok(false);
        }

        Ok(true)
    }

    /// A single delivery owned by `tenant_id`.
    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Model, WebhookError> {
        DeliveryEntity::find_by_id(id)
            .filter(Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| WebhookError::delivery_not_found(id))
    }

    /// Most recent deliveries of a subscription, newest first.
    pub async fn history(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        limit: u64,
    ) -> Result<Vec<Model>, WebhookError> {
        Ok(DeliveryEntity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::SubscriptionId.eq(subscription_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .limit(limit.clamp(1, MAX_HISTORY_LIMIT))
            .all(&self.db)
            .await?)
    }

    /// Status counts for deliveries created within the last `window_days`.
    pub async fn statistics(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatistics, WebhookError> {
        let window_days = window_days.clamp(1, MAX_STATS_WINDOW_DAYS);
        let since = (now - Duration::days(window_days)).fixed_offset();

        let counts: Vec<(String, i64)> = DeliveryEntity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Expr::col(Column::Id).count(), "count")
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::SubscriptionId.eq(subscription_id))
            .filter(Column::CreatedAt.gte(since))
            .group_by(Column::Status)
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(DeliveryStatistics::from_counts(window_days, &counts))
    }
}

fn due_condition(now: DateTime<Utc>) -> Condition {
    let now_db = now.fixed_offset();
    Condition::all()
        .add(Column::Status.is_in(DeliveryStatus::claimable()))
        .add(Column::NextAttemptAt.lte(now_db))
        .add(
            Condition::any()
                .add(Column::ClaimedUntil.is_null())
                .add(Column::ClaimedUntil.lte(now_db)),
        )
}
