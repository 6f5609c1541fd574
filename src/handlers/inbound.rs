//! # Inbound Webhook Receiver
//!
//! Accepts signed callbacks from configured peers. The signature scheme is the
//! same one used for outbound deliveries: the configured secret for a source is
//! reduced to its digest and the raw body is verified against
//! `X-Webhook-Signature`.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiError, ErrorType, unauthorized};
use crate::server::AppState;
use crate::signature;
use crate::transport::{EVENT_HEADER, SIGNATURE_HEADER};

/// Path parameter for the inbound source
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Path)]
pub struct InboundSourcePath {
    /// Configured source name (`WEBHOOKS_INBOUND_SECRET_<SOURCE>`)
    #[param(min_length = 1, example = "billing")]
    pub source: String,
}

/// Signature header documented for OpenAPI
#[derive(Debug, Serialize, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Header)]
pub struct InboundSignatureHeader {
    /// Hex HMAC-SHA256 of the raw body, optionally prefixed with `sha256=`
    #[serde(rename = "X-Webhook-Signature")]
    #[param(rename = "X-Webhook-Signature", value_type = String)]
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InboundAcceptResponse {
    #[schema(example = "accepted")]
    pub status: String,
}

#[utoipa::path(
    post,
    path = "/webhooks/inbound/{source}",
    params(InboundSourcePath, InboundSignatureHeader),
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 202, description = "Signature verified", body = InboundAcceptResponse),
        (status = 401, description = "Missing or invalid signature", body = ApiError),
        (status = 404, description = "Unknown source", body = ApiError)
    ),
    tag = "inbound"
)]
pub async fn receive_inbound(
    State(state): State<AppState>,
    Path(InboundSourcePath { source }): Path<InboundSourcePath>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<InboundAcceptResponse>), ApiError> {
    let Some(secret) = state.config.inbound_secret(&source) else {
        return Err(ErrorType::NotFound.into());
    };

    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| unauthorized(Some("Missing X-Webhook-Signature header")))?;

    let key = signature::secret_digest(secret);
    if !signature::verify(&body, provided, &key) {
        warn!(source = %source, body_len = body.len(), "Inbound webhook signature mismatch");
        return Err(unauthorized(Some("Invalid webhook signature")));
    }

    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");
    info!(
        source = %source,
        event_type = %event_type,
        body_len = body.len(),
        "Inbound webhook accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(InboundAcceptResponse {
            status: "accepted".to_string(),
        }),
    ))
}
