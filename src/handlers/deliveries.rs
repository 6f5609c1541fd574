//! # Delivery History Handlers
//!
//! Read-only views over delivery records: per-subscription history,
//! windowed statistics and single-delivery lookup.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension, TenantHeader};
use crate::error::ApiError;
use crate::models::DeliveryStatus;
use crate::models::delivery::Model as DeliveryModel;
use crate::repositories::delivery::{
    DeliveryRepository, DeliveryStatistics, clamp_history_limit, clamp_window_days,
};
use crate::repositories::subscription::SubscriptionRepository;
use crate::server::AppState;

/// Query parameters for delivery history
#[derive(Debug, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct HistoryQuery {
    /// Maximum number of deliveries to return (default: 50, clamped to 1..=100)
    pub limit: Option<u64>,
}

/// Query parameters for delivery statistics
#[derive(Debug, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct StatisticsQuery {
    /// Window in days (default: 7, clamped to 1..=365)
    pub window_days: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeliveryResponse {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_status_code: Option<i32>,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Canonical payload as transmitted
    #[schema(value_type = Object)]
    pub payload: JsonValue,
}

impl From<DeliveryModel> for DeliveryResponse {
    fn from(model: DeliveryModel) -> Self {
        let status = model.delivery_status();
        // Stored payloads are always JSON; fall back to the raw text rather than fail a read.
        let payload = serde_json::from_str(&model.payload)
            .unwrap_or_else(|_| JsonValue::String(model.payload.clone()));
        Self {
            id: model.id,
            subscription_id: model.subscription_id,
            event_type: model.event_type,
            status,
            attempts: model.attempts,
            next_attempt_at: model.next_attempt_at.with_timezone(&Utc),
            last_status_code: model.last_status_code,
            last_error: model.last_error,
            delivered_at: model.delivered_at.map(|at| at.with_timezone(&Utc)),
            failed_at: model.failed_at.map(|at| at.with_timezone(&Utc)),
            created_at: model.created_at.with_timezone(&Utc),
            payload,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeliveryHistoryResponse {
    pub subscription_id: Uuid,
    pub deliveries: Vec<DeliveryResponse>,
}

/// Recent deliveries of a subscription, newest first
#[utoipa::path(
    get,
    path = "/api/v1/webhooks/subscriptions/{id}/deliveries",
    security(("bearer_auth" = [])),
    params(TenantHeader, ("id" = Uuid, Path, description = "Subscription id"), HistoryQuery),
    responses(
        (status = 200, description = "Delivery history", body = DeliveryHistoryResponse),
        (status = 404, description = "Subscription not found", body = ApiError)
    ),
    tag = "deliveries"
)]
pub async fn delivery_history(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(subscription_id): Path<Uuid>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<DeliveryHistoryResponse>, ApiError> {
    let Query(query) = query?;

    // 404 for subscriptions of other tenants instead of an empty list.
    SubscriptionRepository::new(state.db.clone())
        .get(tenant.id(), subscription_id)
        .await?;

    let deliveries = DeliveryRepository::new(state.db.clone())
        .history(
            tenant.id(),
            subscription_id,
            clamp_history_limit(query.limit),
        )
        .await?;

    Ok(Json(DeliveryHistoryResponse {
        subscription_id,
        deliveries: deliveries.into_iter().map(Into::into).collect(),
    }))
}

/// Delivery counts by status over a time window
#[utoipa::path(
    get,
    path = "/api/v1/webhooks/subscriptions/{id}/statistics",
    security(("bearer_auth" = [])),
    params(TenantHeader, ("id" = Uuid, Path, description = "Subscription id"), StatisticsQuery),
    responses(
        (status = 200, description = "Delivery statistics", body = DeliveryStatistics),
        (status = 404, description = "Subscription not found", body = ApiError)
    ),
    tag = "deliveries"
)]
pub async fn delivery_statistics(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(subscription_id): Path<Uuid>,
    query: Result<Query<StatisticsQuery>, QueryRejection>,
) -> Result<Json<DeliveryStatistics>, ApiError> {
    let Query(query) = query?;

    SubscriptionRepository::new(state.db.clone())
        .get(tenant.id(), subscription_id)
        .await?;

    let statistics = DeliveryRepository::new(state.db.clone())
        .statistics(
            tenant.id(),
            subscription_id,
            clamp_window_days(query.window_days),
            state.clock.now(),
        )
        .await?;

    Ok(Json(statistics))
}

#[utoipa::path(
    get,
    path = "/api/v1/webhooks/deliveries/{id}",
    security(("bearer_auth" = [])),
    params(TenantHeader, ("id" = Uuid, Path, description = "Delivery id")),
    responses(
        (status = 200, description = "Delivery", body = DeliveryResponse),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "deliveries"
)]
pub async fn get_delivery(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(delivery_id): Path<Uuid>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let delivery = DeliveryRepository::new(state.db.clone())
        .get(tenant.id(), delivery_id)
        .await?;
    Ok(Json(delivery.into()))
}
