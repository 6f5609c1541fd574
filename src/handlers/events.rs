//! Event ingestion endpoint: fans an event out to matching subscriptions.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;

use crate::auth::{OperatorAuth, TenantExtension, TenantHeader};
use crate::dispatcher::DispatchResult;
use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct DispatchEventRequest {
    #[schema(example = "campaign.completed")]
    pub event_type: String,
    /// Event data, embedded verbatim under `data` in the delivered payload
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: JsonValue,
}

#[utoipa::path(
    post,
    path = "/api/v1/webhooks/events",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    request_body = DispatchEventRequest,
    responses(
        (status = 202, description = "Deliveries enqueued", body = DispatchResult),
        (status = 400, description = "Invalid event type", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "events"
)]
pub async fn dispatch_event(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    payload: Result<Json<DispatchEventRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DispatchResult>), ApiError> {
    let Json(request) = payload?;

    let result = state
        .dispatcher
        .dispatch(tenant.id(), &request.event_type, &request.data)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(result)))
}
