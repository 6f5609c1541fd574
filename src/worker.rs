//! # Delivery Worker
//!
//! Claims due deliveries, POSTs them to their subscription's endpoint and
//! records the outcome. [`DeliveryWorkerPool`] runs several workers as tokio
//! tasks that poll on a fixed interval until cancelled.
//!
//! Every worker shares one claim primitive in the delivery store, so any
//! number of workers (in one process or many) may poll the same table.

use std::sync::Arc;

use chrono::Duration;
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::error::WebhookError;
use crate::models::DeliveryStatus;
use crate::models::delivery::Model as DeliveryModel;
use crate::repositories::delivery::{DeliveryOutcome, DeliveryRepository};
use crate::repositories::subscription::SubscriptionRepository;
use crate::retry;
use crate::transport::{OutboundWebhook, TransportResponse, WebhookTransport, redacted_target};

pub const SUBSCRIPTION_INACTIVE_REASON: &str = "subscription inactive";

/// Counts for one `process_due` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub retrying: u64,
    pub failed: u64,
}

impl ProcessSummary {
    fn record(&mut self, status: DeliveryStatus) {
        self.processed += 1;
        match status {
            DeliveryStatus::Success => self.succeeded += 1,
            DeliveryStatus::Retrying => self.retrying += 1,
            DeliveryStatus::Failed => self.failed += 1,
            DeliveryStatus::Pending => {}
        }
    }
}

/// Single delivery worker. Cheap to clone; clones share the pool and transport.
#[derive(Clone)]
pub struct DeliveryWorker {
    deliveries: DeliveryRepository,
    subscriptions: SubscriptionRepository,
    transport: Arc<dyn WebhookTransport>,
    clock: Arc<dyn Clock>,
    max_attempts: i32,
    lease: Duration,
}

impl DeliveryWorker {
    pub fn new(
        db: DatabaseConnection,
        transport: Arc<dyn WebhookTransport>,
        clock: Arc<dyn Clock>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            deliveries: DeliveryRepository::new(db.clone()),
            subscriptions: SubscriptionRepository::new(db),
            transport,
            clock,
            max_attempts: config.max_attempts,
            lease: config.claim_lease(),
        }
    }

    /// Claim and process up to `batch_size` due deliveries.
    ///
    /// Only the claim itself can fail the call; per-delivery errors are logged
    /// and leave the row to be reclaimed once its lease expires.
    #[instrument(skip(self), target = "webhook_delivery")]
    pub async fn process_due(&self, batch_size: u64) -> Result<ProcessSummary, WebhookError> {
        let claimed = self
            .deliveries
            .claim_due(self.clock.now(), batch_size, self.lease)
            .await?;

        let mut summary = ProcessSummary::default();
        for delivery in claimed {
            let delivery_id = delivery.id;
            match self.process_one(delivery).await {
                Ok(Some(status)) => summary.record(status),
                Ok(None) => {}
                Err(err) => {
                    error!(
                        target: "webhook_delivery",
                        delivery_id = %delivery_id,
                        error = %err,
                        "Failed to process delivery"
                    );
                }
            }
        }

        if summary.processed > 0 {
            info!(
                target: "webhook_delivery",
                processed = summary.processed,
                succeeded = summary.succeeded,
                retrying = summary.retrying,
                failed = summary.failed,
                "Processed due webhook deliveries"
            );
        }

        Ok(summary)
    }

    /// Returns the status written, or `None` when the claim was lost.
    async fn process_one(
        &self,
        delivery: DeliveryModel,
    ) -> Result<Option<DeliveryStatus>, WebhookError> {
        let subscription = self
            .subscriptions
            .find_by_id(delivery.subscription_id)
            .await?;

        let subscription = match subscription {
            Some(subscription) if subscription.active || delivery.attempts > 0 => subscription,
            _ => {
                let outcome = DeliveryOutcome::Failed {
                    status_code: None,
                    error: SUBSCRIPTION_INACTIVE_REASON.to_string(),
                };
                return self
                    .finish(&delivery, delivery.attempts, outcome, "skipped")
                    .await;
            }
        };

        let attempt = delivery.attempts + 1;
        let webhook = OutboundWebhook {
            delivery_id: delivery.id,
            target_url: subscription.target_url.clone(),
            event_type: delivery.event_type.clone(),
            payload: delivery.payload.clone(),
            signature: delivery.signature.clone(),
        };

        debug!(
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            subscription_id = %subscription.id,
            target = %redacted_target(&subscription.target_url),
            attempt,
            "Sending webhook"
        );

        let started = Instant::now();
        let result = self.transport.send(&webhook).await;
        histogram!("webhook_delivery_latency_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let outcome = match result {
            Ok(response) if response.is_success() => DeliveryOutcome::Succeeded {
                status_code: response.status_code,
            },
            Ok(response) => {
                self.failure_outcome(attempt, Some(response.status_code), http_error(&response))
            }
            Err(err) => self.failure_outcome(attempt, None, err.into()),
        };

        let label = match &outcome {
            DeliveryOutcome::Succeeded { .. } => "success",
            DeliveryOutcome::Retry { .. } => "retry",
            DeliveryOutcome::Failed { .. } => "failed",
        };
        self.finish(&delivery, attempt, outcome, label).await
    }

    fn failure_outcome(
        &self,
        attempt: i32,
        status_code: Option<u16>,
        error: WebhookError,
    ) -> DeliveryOutcome {
        let error = error.to_string();
        if retry::is_exhausted(attempt, self.max_attempts) {
            DeliveryOutcome::Failed { status_code, error }
        } else {
            DeliveryOutcome::Retry {
                next_attempt_at: self.clock.now() + retry::next_delay(attempt),
                status_code,
                error,
            }
        }
    }

    async fn finish(
        &self,
        delivery: &DeliveryModel,
        attempts: i32,
        outcome: DeliveryOutcome,
        label: &'static str,
    ) -> Result<Option<DeliveryStatus>, WebhookError> {
        let status = outcome.status();
        let written = self
            .deliveries
            .finalize(delivery, attempts, &outcome, self.clock.now())
            .await?;
        if !written {
            return Ok(None);
        }

        counter!("webhook_delivery_attempts_total", "outcome" => label).increment(1);

        match &outcome {
            DeliveryOutcome::Succeeded { status_code } => info!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                attempts,
                status_code,
                "Webhook delivered"
            ),
            DeliveryOutcome::Retry {
                next_attempt_at,
                error,
                ..
            } => warn!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                attempts,
                next_attempt_at = %next_attempt_at,
                error = %error,
                "Webhook attempt failed; retry scheduled"
            ),
            DeliveryOutcome::Failed { error, .. } => warn!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                attempts,
                error = %error,
                "Webhook delivery failed permanently"
            ),
        }

        Ok(Some(status))
    }
}

fn http_error(response: &TransportResponse) -> WebhookError {
    WebhookError::TransientDelivery(if response.body_snippet.is_empty() {
        format!("HTTP {}", response.status_code)
    } else {
        format!("HTTP {}: {}", response.status_code, response.body_snippet)
    })
}

/// Fixed-size pool of polling workers.
pub struct DeliveryWorkerPool {
    worker: DeliveryWorker,
    config: DeliveryConfig,
}

impl DeliveryWorkerPool {
    pub fn new(worker: DeliveryWorker, config: DeliveryConfig) -> Self {
        Self { worker, config }
    }

    /// Spawn `config.workers` polling tasks; they exit once `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.config.workers,
            poll_interval_seconds = self.config.poll_interval_seconds,
            batch_size = self.config.batch_size,
            "Starting webhook delivery workers"
        );

        (0..self.config.workers)
            .map(|index| {
                let worker = self.worker.clone();
                let config = self.config.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { run_worker(index, worker, config, shutdown).await })
            })
            .collect()
    }
}

async fn run_worker(
    index: usize,
    worker: DeliveryWorker,
    config: DeliveryConfig,
    shutdown: CancellationToken,
) {
    let poll_interval = config.poll_interval();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(worker = index, "Delivery worker shutdown requested");
                break;
            }
            _ = sleep(poll_interval) => {
                let tick_started = Instant::now();
                if let Err(err) = worker.process_due(config.batch_size).await {
                    error!(worker = index, error = %err, "Delivery worker tick failed");
                }
                histogram!("webhook_worker_tick_duration_ms")
                    .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
            }
        }
    }

    info!(worker = index, "Delivery worker stopped");
}
