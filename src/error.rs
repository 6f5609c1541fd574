//! # Error Handling
//!
//! Domain errors for the webhook subsystem ([`WebhookError`]) and the unified
//! problem+json API error ([`ApiError`]) they map onto, with trace ID propagation.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::telemetry;

/// Errors produced by the registry, dispatcher and delivery store.
///
/// Delivery-time failures (`TransientDelivery`) are recorded on the delivery
/// row by the worker and never surface through the API.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("{message}")]
    Validation {
        message: String,
        field: &'static str,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("subscription {id} is inactive")]
    SubscriptionInactive { id: Uuid },

    #[error("{0}")]
    TransientDelivery(String),

    #[error("signing failed: {0}")]
    Signing(#[from] crate::signature::SignatureError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl WebhookError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        WebhookError::Validation {
            message: message.into(),
            field,
        }
    }

    pub fn subscription_not_found(id: Uuid) -> Self {
        WebhookError::NotFound {
            entity: "subscription",
            id,
        }
    }

    pub fn delivery_not_found(id: Uuid) -> Self {
        WebhookError::NotFound {
            entity: "delivery",
            id,
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    #[schema(value_type = String)]
    pub code: Box<str>,
    /// Human-readable error message
    #[schema(value_type = String)]
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Request trace id when inside a request scope, otherwise a short correlation id.
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| Some(format!("corr-{}", &Uuid::new_v4().to_string()[..8]).into_boxed_str()))
    }
}

/// Standard error types with predefined status codes
#[derive(Debug, Error)]
pub enum ErrorType {
    #[error("Bad Request")]
    BadRequest,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Not Found")]
    NotFound,
    #[error("Conflict")]
    Conflict,
    #[error("Internal Server Error")]
    InternalServerError,
    #[error("Service Unavailable")]
    ServiceUnavailable,
}

impl ErrorType {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::Conflict => StatusCode::CONFLICT,
            ErrorType::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorType::BadRequest => "VALIDATION_FAILED",
            ErrorType::Unauthorized => "UNAUTHORIZED",
            ErrorType::NotFound => "NOT_FOUND",
            ErrorType::Conflict => "CONFLICT",
            ErrorType::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorType::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ErrorType> for ApiError {
    fn from(error_type: ErrorType) -> Self {
        Self::new(
            error_type.status_code(),
            error_type.error_code(),
            error_type.to_string(),
        )
    }
}

impl From<crate::transport::TransportError> for WebhookError {
    fn from(error: crate::transport::TransportError) -> Self {
        WebhookError::TransientDelivery(error.to_string())
    }
}

impl From<WebhookError> for ApiError {
    fn from(error: WebhookError) -> Self {
        match error {
            WebhookError::Validation { message, field } => {
                let mut details = serde_json::Map::new();
                details.insert(field.to_string(), serde_json::Value::from(message.as_str()));
                validation_error(&message, serde_json::Value::Object(details))
            }
            WebhookError::NotFound { entity, id } => Self::new(
                StatusCode::NOT_FOUND,
                ErrorType::NotFound.error_code(),
                format!("{entity} {id} not found"),
            ),
            WebhookError::SubscriptionInactive { id } => Self::new(
                ErrorType::Conflict.status_code(),
                "SUBSCRIPTION_INACTIVE",
                format!("Subscription {id} is inactive"),
            ),
            WebhookError::Database(err) => err.into(),
            other => {
                tracing::error!(error = %other, "Unhandled webhook error");
                ErrorType::InternalServerError.into()
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            format!("Invalid query string: {}", rejection.body_text()),
        )
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                ErrorType::ServiceUnavailable.into()
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400_with_field() {
        let api: ApiError = WebhookError::validation("target_url", "must be http or https").into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(&*api.code, "VALIDATION_FAILED");
        let details = api.details.expect("details");
        assert_eq!(details["target_url"], "must be http or https");
    }

    #[test]
    fn not_found_and_inactive_mapping() {
        let id = Uuid::new_v4();
        let api: ApiError = WebhookError::subscription_not_found(id).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert!(api.message.contains(&id.to_string()));

        let api: ApiError = WebhookError::SubscriptionInactive { id }.into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(&*api.code, "SUBSCRIPTION_INACTIVE");
    }

    #[test]
    fn transport_failures_become_transient_delivery_errors() {
        let err = WebhookError::from(crate::transport::TransportError::Timeout);
        assert!(matches!(err, WebhookError::TransientDelivery(_)));
        assert_eq!(err.to_string(), "Request timeout");

        let api: ApiError = err.into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn database_errors_hide_details() {
        let api: ApiError =
            WebhookError::Database(sea_orm::DbErr::Custom("secret table".into())).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!api.message.contains("secret table"));
    }

    #[test]
    fn from_anyhow() {
        let api_error: ApiError = anyhow::anyhow!("Something went wrong").into();
        assert_eq!(&*api_error.code, "INTERNAL_SERVER_ERROR");
        assert_eq!(&*api_error.message, "An internal error occurred");
    }

    #[test]
    fn problem_json_content_type() {
        let response = unauthorized(None).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn trace_id_falls_back_to_correlation_id() {
        let error = ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "X", "y");
        let trace_id = error.trace_id.expect("trace id");
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }
}
