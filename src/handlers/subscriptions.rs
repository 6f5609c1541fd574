//! # Subscription Handlers
//!
//! Tenant-scoped CRUD over webhook subscriptions, secret rotation and test
//! deliveries. Raw secrets appear only in the create and rotate responses.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension, TenantHeader};
use crate::dispatcher::DispatchResult;
use crate::error::ApiError;
use crate::repositories::subscription::{
    NewSubscription, SubscriptionPatch, SubscriptionRepository, SubscriptionWithEvents,
};
use crate::server::AppState;

/// Request body for registering a subscription
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateSubscriptionRequest {
    /// Optional display name
    #[schema(example = "Campaign notifications")]
    pub name: Option<String>,
    /// Absolute http(s) URL receiving POSTed events
    #[schema(example = "https://hooks.example.com/campaigns")]
    pub target_url: String,
    /// Event types to receive
    #[schema(example = json!(["campaign.completed", "campaign.failed"]))]
    pub events: Vec<String>,
    /// Free-form metadata stored with the subscription
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<JsonValue>,
}

/// Partial update; omitted fields are left unchanged
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct UpdateSubscriptionRequest {
    pub name: Option<String>,
    pub target_url: Option<String>,
    /// Replaces the whole event set when present
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<JsonValue>,
}

/// Subscription as returned by the API; never includes the secret
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub name: Option<String>,
    pub target_url: String,
    pub events: Vec<String>,
    pub active: bool,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SubscriptionWithEvents> for SubscriptionResponse {
    fn from(value: SubscriptionWithEvents) -> Self {
        let SubscriptionWithEvents {
            subscription,
            events,
        } = value;
        Self {
            id: subscription.id,
            name: subscription.name,
            target_url: subscription.target_url,
            events,
            active: subscription.active,
            metadata: subscription.metadata,
            created_at: subscription.created_at.with_timezone(&Utc),
            updated_at: subscription.updated_at.with_timezone(&Utc),
        }
    }
}

/// Returned once at creation; the secret cannot be retrieved later
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSubscriptionResponse {
    pub subscription_id: Uuid,
    /// Signing secret, shown only in this response
    #[schema(example = "whsec_9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08")]
    pub secret: String,
    pub subscription: SubscriptionResponse,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RotateSecretResponse {
    pub subscription_id: Uuid,
    /// New signing secret. Deliveries already queued keep the signature made
    /// with the previous one
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionsResponse {
    pub subscriptions: Vec<SubscriptionResponse>,
}

fn repository(state: &AppState) -> SubscriptionRepository {
    SubscriptionRepository::new(state.db.clone())
}

/// Registers a webhook subscription and returns its signing secret once
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/subscriptions",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    request_body = CreateSubscriptionRequest,
    responses(
        (status = 201, description = "Subscription created", body = CreateSubscriptionResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "subscriptions"
)]
pub async fn create_subscription(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    payload: Result<Json<CreateSubscriptionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateSubscriptionResponse>), ApiError> {
    let Json(request) = payload?;

    let (created, secret) = repository(&state)
        .create(
            tenant.id(),
            NewSubscription {
                name: request.name,
                target_url: request.target_url,
                events: request.events,
                metadata: request.metadata,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSubscriptionResponse {
            subscription_id: created.subscription.id,
            secret: secret.expose().to_string(),
            subscription: created.into(),
        }),
    ))
}

/// Lists the tenant's subscriptions, newest first
#[utoipa::path(
    get,
    path = "/api/v1/webhooks/subscriptions",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Tenant subscriptions", body = SubscriptionsResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "subscriptions"
)]
pub async fn list_subscriptions(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
) -> Result<Json<SubscriptionsResponse>, ApiError> {
    let subscriptions = repository(&state).list(tenant.id()).await?;
    Ok(Json(SubscriptionsResponse {
        subscriptions: subscriptions.into_iter().map(Into::into).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/webhooks/subscriptions/{id}",
    security(("bearer_auth" = [])),
    params(TenantHeader, ("id" = Uuid, Path, description = "Subscription id")),
    responses(
        (status = 200, description = "Subscription", body = SubscriptionResponse),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "subscriptions"
)]
pub async fn get_subscription(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(id): Path<Uuid>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let subscription = repository(&state).get(tenant.id(), id).await?;
    Ok(Json(subscription.into()))
}

#[utoipa::path(
    patch,
    path = "/api/v1/webhooks/subscriptions/{id}",
    security(("bearer_auth" = [])),
    params(TenantHeader, ("id" = Uuid, Path, description = "Subscription id")),
    request_body = UpdateSubscriptionRequest,
    responses(
        (status = 200, description = "Updated subscription", body = SubscriptionResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "subscriptions"
)]
pub async fn update_subscription(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(id): Path<Uuid>,
    payload: Result<Json<UpdateSubscriptionRequest>, JsonRejection>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let Json(request) = payload?;

    let updated = repository(&state)
        .update(
            tenant.id(),
            id,
            SubscriptionPatch {
                name: request.name,
                target_url: request.target_url,
                events: request.events,
                active: request.active,
                metadata: request.metadata,
            },
        )
        .await?;

    Ok(Json(updated.into()))
}

/// Deletes a subscription together with its delivery history
#[utoipa::path(
    delete,
    path = "/api/v1/webhooks/subscriptions/{id}",
    security(("bearer_auth" = [])),
    params(TenantHeader, ("id" = Uuid, Path, description = "Subscription id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "subscriptions"
)]
pub async fn delete_subscription(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    repository(&state).delete(tenant.id(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/webhooks/subscriptions/{id}/rotate-secret",
    security(("bearer_auth" = [])),
    params(TenantHeader, ("id" = Uuid, Path, description = "Subscription id")),
    responses(
        (status = 200, description = "New secret", body = RotateSecretResponse),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "subscriptions"
)]
pub async fn rotate_secret(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(id): Path<Uuid>,
) -> Result<Json<RotateSecretResponse>, ApiError> {
    let secret = repository(&state).rotate_secret(tenant.id(), id).await?;
    Ok(Json(RotateSecretResponse {
        subscription_id: id,
        secret: secret.expose().to_string(),
    }))
}

/// Enqueues a `webhook.test` delivery for one subscription
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/subscriptions/{id}/test",
    security(("bearer_auth" = [])),
    params(TenantHeader, ("id" = Uuid, Path, description = "Subscription id")),
    responses(
        (status = 202, description = "Test delivery enqueued", body = DispatchResult),
        (status = 404, description = "Not found", body = ApiError),
        (status = 409, description = "Subscription inactive", body = ApiError)
    ),
    tag = "subscriptions"
)]
pub async fn send_test(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DispatchResult>), ApiError> {
    let delivery = state.dispatcher.dispatch_test(tenant.id(), id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchResult {
            triggered_count: 1,
            deliveries: vec![delivery],
        }),
    ))
}
