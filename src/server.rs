//! # Server Configuration
//!
//! Router assembly, shared application state and the OpenAPI document for the
//! webhooks API.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::FromRef,
    middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::dispatcher::EventDispatcher;
use crate::handlers;
use crate::telemetry::trace_context_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub dispatcher: EventDispatcher,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, db: DatabaseConnection, clock: Arc<dyn Clock>) -> Self {
        Self {
            dispatcher: EventDispatcher::new(db.clone(), Arc::clone(&clock)),
            config,
            db,
            clock,
        }
    }
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/webhooks/subscriptions",
            post(handlers::subscriptions::create_subscription)
                .get(handlers::subscriptions::list_subscriptions),
        )
        .route(
            "/webhooks/subscriptions/{id}",
            get(handlers::subscriptions::get_subscription)
                .patch(handlers::subscriptions::update_subscription)
                .delete(handlers::subscriptions::delete_subscription),
        )
        .route(
            "/webhooks/subscriptions/{id}/rotate-secret",
            post(handlers::subscriptions::rotate_secret),
        )
        .route(
            "/webhooks/subscriptions/{id}/test",
            post(handlers::subscriptions::send_test),
        )
        .route(
            "/webhooks/subscriptions/{id}/deliveries",
            get(handlers::deliveries::delivery_history),
        )
        .route(
            "/webhooks/subscriptions/{id}/statistics",
            get(handlers::deliveries::delivery_statistics),
        )
        .route(
            "/webhooks/deliveries/{id}",
            get(handlers::deliveries::get_delivery),
        )
        .route("/webhooks/events", post(handlers::events::dispatch_event))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/webhooks/inbound/{source}",
            post(handlers::inbound::receive_inbound),
        )
        .nest("/api/v1", protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Serves the API until `shutdown` fires
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state
        .config
        .bind_addr()
        .with_context(|| format!("Invalid server address: {}", state.config.api_bind_addr))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(address = %addr, profile = %profile, "Webhooks API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server terminated unexpectedly")?;

    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::subscriptions::create_subscription,
        crate::handlers::subscriptions::list_subscriptions,
        crate::handlers::subscriptions::get_subscription,
        crate::handlers::subscriptions::update_subscription,
        crate::handlers::subscriptions::delete_subscription,
        crate::handlers::subscriptions::rotate_secret,
        crate::handlers::subscriptions::send_test,
        crate::handlers::deliveries::delivery_history,
        crate::handlers::deliveries::delivery_statistics,
        crate::handlers::deliveries::get_delivery,
        crate::handlers::events::dispatch_event,
        crate::handlers::inbound::receive_inbound,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::DeliveryStatus,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::subscriptions::CreateSubscriptionRequest,
            crate::handlers::subscriptions::UpdateSubscriptionRequest,
            crate::handlers::subscriptions::SubscriptionResponse,
            crate::handlers::subscriptions::CreateSubscriptionResponse,
            crate::handlers::subscriptions::RotateSecretResponse,
            crate::handlers::subscriptions::SubscriptionsResponse,
            crate::handlers::deliveries::DeliveryResponse,
            crate::handlers::deliveries::DeliveryHistoryResponse,
            crate::handlers::events::DispatchEventRequest,
            crate::handlers::inbound::InboundAcceptResponse,
            crate::dispatcher::DispatchResult,
            crate::dispatcher::DispatchedDelivery,
            crate::repositories::delivery::DeliveryStatistics,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "subscriptions", description = "Webhook subscription registry"),
        (name = "deliveries", description = "Delivery history and statistics"),
        (name = "events", description = "Event dispatch"),
        (name = "inbound", description = "Signed inbound callbacks"),
    ),
    info(
        title = "Webhooks API",
        description = "Tenant-scoped webhook subscriptions with signed, retried deliveries",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
