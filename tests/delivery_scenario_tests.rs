//! End-to-end delivery lifecycle tests against in-memory SQLite with a manual
//! clock and a scripted transport.

use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use webhooks::clock::Clock;
use webhooks::dispatcher::EventDispatcher;
use webhooks::models::DeliveryStatus;
use webhooks::repositories::delivery::{DeliveryOutcome, DeliveryRepository};
use webhooks::repositories::subscription::{SubscriptionPatch, SubscriptionRepository};
use webhooks::retry::{BACKOFF_SCHEDULE_SECONDS, next_delay};
use webhooks::signature;
use webhooks::transport::TransportError;
use webhooks::worker::SUBSCRIPTION_INACTIVE_REASON;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::*;

const EVENT: &str = "campaign.completed";

#[tokio::test]
async fn dispatch_skips_inactive_subscriptions() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();

    let (active, _) = create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
        .await
        .unwrap();
    let (inactive, _) = create_subscription(&db, tenant, "https://b.example.com/hook", &[EVENT])
        .await
        .unwrap();
    SubscriptionRepository::new(db.clone())
        .update(
            tenant,
            inactive.subscription.id,
            SubscriptionPatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let dispatcher = EventDispatcher::new(db.clone(), clock.clone());
    let result = dispatcher
        .dispatch(tenant, EVENT, &json!({"campaign_id": 42}))
        .await
        .unwrap();

    assert_eq!(result.triggered_count, 1);
    assert_eq!(result.deliveries.len(), 1);
    assert_eq!(result.deliveries[0].subscription_id, active.subscription.id);
    assert_eq!(result.deliveries[0].status, DeliveryStatus::Pending);

    let stored = deliveries_for(&db, active.subscription.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].attempts, 0);
    assert_eq!(stored[0].next_attempt_at, start_time().fixed_offset());
    assert!(
        deliveries_for(&db, inactive.subscription.id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn dispatch_is_scoped_to_tenant_and_event() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let other_tenant = Uuid::new_v4();

    create_subscription(&db, other_tenant, "https://a.example.com/hook", &[EVENT])
        .await
        .unwrap();
    create_subscription(&db, tenant, "https://b.example.com/hook", &["campaign.failed"])
        .await
        .unwrap();

    let dispatcher = EventDispatcher::new(db.clone(), clock.clone());
    let result = dispatcher.dispatch(tenant, EVENT, &json!({})).await.unwrap();
    assert_eq!(result.triggered_count, 0);
    assert!(result.deliveries.is_empty());
}

#[tokio::test]
async fn dispatch_rejects_malformed_event_type() {
    let db = setup_test_db().await.unwrap();
    let dispatcher = EventDispatcher::new(db.clone(), manual_clock());

    let err = dispatcher
        .dispatch(Uuid::new_v4(), "Campaign Completed", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        webhooks::error::WebhookError::Validation { .. }
    ));
}

#[tokio::test]
async fn delivered_request_carries_verifiable_signature() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, secret) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();

    let dispatcher = EventDispatcher::new(db.clone(), clock.clone());
    let dispatched = dispatcher
        .dispatch(tenant, EVENT, &json!({"campaign_id": 7}))
        .await
        .unwrap();

    let transport = ScriptedTransport::always(ok(204));
    let summary = worker(&db, transport.clone(), clock.clone())
        .process_due(10)
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.succeeded, 1);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let request = &sent[0];
    assert_eq!(request.delivery_id, dispatched.deliveries[0].delivery_id);
    assert_eq!(request.event_type, EVENT);
    assert_eq!(request.target_url, subscription.subscription.target_url);
    assert!(signature::verify(
        request.payload.as_bytes(),
        &request.signature,
        &secret.digest()
    ));

    let body: serde_json::Value = serde_json::from_str(&request.payload).unwrap();
    assert_eq!(body["event"], EVENT);
    assert_eq!(body["emittedAt"], "2026-01-01T00:00:00Z");
    assert_eq!(body["data"]["campaign_id"], 7);
}

#[tokio::test]
async fn exhausts_retries_following_backoff_schedule() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();

    EventDispatcher::new(db.clone(), clock.clone())
        .dispatch(tenant, EVENT, &json!({}))
        .await
        .unwrap();
    let delivery_id = deliveries_for(&db, subscription.subscription.id).await.unwrap()[0].id;

    let transport = ScriptedTransport::always(ok(503));
    let worker = worker(&db, transport.clone(), clock.clone());

    for attempt in 1..=5 {
        let attempted_at = clock.now();
        let summary = worker.process_due(10).await.unwrap();
        assert_eq!(summary.processed, 1, "attempt {attempt} should run");

        let delivery = reload(&db, delivery_id).await.unwrap();
        assert_eq!(delivery.attempts, attempt);
        assert_eq!(delivery.last_status_code, Some(503));
        assert!(delivery.claim_token.is_none());

        if attempt < 5 {
            let delay = next_delay(attempt);
            assert_eq!(
                delay.num_seconds(),
                BACKOFF_SCHEDULE_SECONDS[(attempt - 1) as usize]
            );
            assert_eq!(delivery.delivery_status(), DeliveryStatus::Retrying);
            assert_eq!(
                delivery.next_attempt_at,
                (attempted_at + delay).fixed_offset()
            );

            // One second early: nothing is due.
            clock.advance(delay - Duration::seconds(1));
            assert_eq!(worker.process_due(10).await.unwrap().processed, 0);
            clock.advance(Duration::seconds(1));
        } else {
            assert_eq!(delivery.delivery_status(), DeliveryStatus::Failed);
            assert!(delivery.failed_at.is_some());
            assert!(delivery.delivered_at.is_none());
        }
    }

    assert_eq!(transport.sent_count(), 5);

    clock.advance(Duration::days(1));
    assert_eq!(worker.process_due(10).await.unwrap().processed, 0);
    assert_eq!(transport.sent_count(), 5);
}

#[tokio::test]
async fn success_on_third_attempt_is_final() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();

    EventDispatcher::new(db.clone(), clock.clone())
        .dispatch(tenant, EVENT, &json!({}))
        .await
        .unwrap();
    let delivery_id = deliveries_for(&db, subscription.subscription.id).await.unwrap()[0].id;

    let transport = ScriptedTransport::scripted(
        vec![ok(500), Err(TransportError::Timeout), ok(200)],
        ok(200),
    );
    let worker = worker(&db, transport.clone(), clock.clone());

    for attempt in 1..=3 {
        let summary = worker.process_due(10).await.unwrap();
        assert_eq!(summary.processed, 1);
        if attempt < 3 {
            assert_eq!(summary.retrying, 1);
            clock.advance(next_delay(attempt));
        } else {
            assert_eq!(summary.succeeded, 1);
        }
    }

    let delivery = reload(&db, delivery_id).await.unwrap();
    assert_eq!(delivery.delivery_status(), DeliveryStatus::Success);
    assert_eq!(delivery.attempts, 3);
    assert_eq!(delivery.last_status_code, Some(200));
    assert!(delivery.last_error.is_none());
    assert_eq!(delivery.delivered_at, Some(clock.now().fixed_offset()));

    clock.advance(Duration::days(2));
    assert_eq!(worker.process_due(10).await.unwrap().processed, 0);
    assert_eq!(transport.sent_count(), 3);
}

#[tokio::test]
async fn transport_error_is_recorded_without_status_code() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();
    EventDispatcher::new(db.clone(), clock.clone())
        .dispatch(tenant, EVENT, &json!({}))
        .await
        .unwrap();

    let transport = ScriptedTransport::always(Err(TransportError::Connect(
        "connection refused".to_string(),
    )));
    worker(&db, transport, clock.clone())
        .process_due(10)
        .await
        .unwrap();

    let delivery = &deliveries_for(&db, subscription.subscription.id).await.unwrap()[0];
    assert_eq!(delivery.delivery_status(), DeliveryStatus::Retrying);
    assert_eq!(delivery.last_status_code, None);
    assert_eq!(
        delivery.last_error.as_deref(),
        Some("Connection failed: connection refused")
    );
}

#[tokio::test]
async fn deactivation_mid_retry_keeps_schedule_but_stops_new_dispatches() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();
    let subscription_id = subscription.subscription.id;

    let dispatcher = EventDispatcher::new(db.clone(), clock.clone());
    dispatcher.dispatch(tenant, EVENT, &json!({})).await.unwrap();

    let transport = ScriptedTransport::scripted(vec![ok(500)], ok(200));
    let worker = worker(&db, transport.clone(), clock.clone());
    assert_eq!(worker.process_due(10).await.unwrap().retrying, 1);

    SubscriptionRepository::new(db.clone())
        .update(
            tenant,
            subscription_id,
            SubscriptionPatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    clock.advance(next_delay(1));
    let summary = worker.process_due(10).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(transport.sent_count(), 2);

    let again = dispatcher.dispatch(tenant, EVENT, &json!({})).await.unwrap();
    assert_eq!(again.triggered_count, 0);
    assert_eq!(deliveries_for(&db, subscription_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unattempted_delivery_to_inactive_subscription_fails_without_sending() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();
    let subscription_id = subscription.subscription.id;

    EventDispatcher::new(db.clone(), clock.clone())
        .dispatch(tenant, EVENT, &json!({}))
        .await
        .unwrap();
    SubscriptionRepository::new(db.clone())
        .update(
            tenant,
            subscription_id,
            SubscriptionPatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let transport = ScriptedTransport::always(ok(200));
    let summary = worker(&db, transport.clone(), clock.clone())
        .process_due(10)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(transport.sent_count(), 0);
    let delivery = &deliveries_for(&db, subscription_id).await.unwrap()[0];
    assert_eq!(delivery.delivery_status(), DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 0);
    assert_eq!(
        delivery.last_error.as_deref(),
        Some(SUBSCRIPTION_INACTIVE_REASON)
    );
}

#[tokio::test]
async fn terminal_deliveries_cannot_be_finalized_again() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();
    EventDispatcher::new(db.clone(), clock.clone())
        .dispatch(tenant, EVENT, &json!({}))
        .await
        .unwrap();

    let repo = DeliveryRepository::new(db.clone());
    let claimed = repo
        .claim_due(clock.now(), 10, Duration::seconds(120))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let claimed = &claimed[0];

    assert!(
        repo.finalize(
            claimed,
            1,
            &DeliveryOutcome::Succeeded { status_code: 200 },
            clock.now()
        )
        .await
        .unwrap()
    );

    // A second finalize with the same claim is a no-op.
    let overwritten = repo
        .finalize(
            claimed,
            2,
            &DeliveryOutcome::Failed {
                status_code: Some(500),
                error: "late".to_string(),
            },
            clock.now(),
        )
        .await
        .unwrap();
    assert!(!overwritten);

    let delivery = &deliveries_for(&db, subscription.subscription.id).await.unwrap()[0];
    assert_eq!(delivery.delivery_status(), DeliveryStatus::Success);
    assert_eq!(delivery.attempts, 1);
}

#[tokio::test]
async fn statistics_with_no_deliveries_report_zero_rate() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();

    let stats = DeliveryRepository::new(db.clone())
        .statistics(tenant, subscription.subscription.id, 7, clock.now())
        .await
        .unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.success_rate_percent, 0.0);
}

#[tokio::test]
async fn statistics_and_history_reflect_outcomes() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();
    let subscription_id = subscription.subscription.id;
    let dispatcher = EventDispatcher::new(db.clone(), clock.clone());

    let mut dispatched = Vec::new();
    for _ in 0..3 {
        let result = dispatcher.dispatch(tenant, EVENT, &json!({})).await.unwrap();
        dispatched.push(result.deliveries[0].delivery_id);
        clock.advance(Duration::seconds(1));
    }

    let transport = ScriptedTransport::scripted(vec![ok(200), ok(500), ok(200)], ok(200));
    let summary = worker(&db, transport, clock.clone())
        .process_due(10)
        .await
        .unwrap();
    assert_eq!(summary.processed, 3);

    let repo = DeliveryRepository::new(db.clone());
    let stats = repo
        .statistics(tenant, subscription_id, 7, clock.now())
        .await
        .unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.retrying, 1);
    assert_eq!(stats.success_rate_percent, 66.67);

    let history = repo.history(tenant, subscription_id, 2).await.unwrap();
    assert_eq!(
        history.iter().map(|d| d.id).collect::<Vec<_>>(),
        vec![dispatched[2], dispatched[1]]
    );

    // Another tenant sees nothing.
    assert!(
        repo.history(Uuid::new_v4(), subscription_id, 50)
            .await
            .unwrap()
            .is_empty()
    );

    // Outside the window nothing is counted.
    clock.advance(Duration::days(8));
    let stale = repo
        .statistics(tenant, subscription_id, 7, clock.now())
        .await
        .unwrap();
    assert_eq!(stale.total, 0);
}

#[tokio::test]
async fn dispatch_test_targets_single_active_subscription() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();
    let subscription_id = subscription.subscription.id;
    let dispatcher = EventDispatcher::new(db.clone(), clock.clone());

    let delivery = dispatcher.dispatch_test(tenant, subscription_id).await.unwrap();
    assert_eq!(delivery.subscription_id, subscription_id);
    let stored = deliveries_for(&db, subscription_id).await.unwrap();
    assert_eq!(stored[0].event_type, webhooks::dispatcher::TEST_EVENT_TYPE);

    let err = dispatcher
        .dispatch_test(Uuid::new_v4(), subscription_id)
        .await
        .unwrap_err();
    assert!(matches!(err, webhooks::error::WebhookError::NotFound { .. }));

    SubscriptionRepository::new(db.clone())
        .update(
            tenant,
            subscription_id,
            SubscriptionPatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = dispatcher
        .dispatch_test(tenant, subscription_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        webhooks::error::WebhookError::SubscriptionInactive { .. }
    ));
}

#[tokio::test]
async fn deleting_a_subscription_removes_its_deliveries() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, _) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();
    let subscription_id = subscription.subscription.id;
    EventDispatcher::new(db.clone(), clock.clone())
        .dispatch(tenant, EVENT, &json!({}))
        .await
        .unwrap();

    let repo = SubscriptionRepository::new(db.clone());
    assert!(matches!(
        repo.delete(Uuid::new_v4(), subscription_id).await,
        Err(webhooks::error::WebhookError::NotFound { .. })
    ));
    repo.delete(tenant, subscription_id).await.unwrap();

    assert!(deliveries_for(&db, subscription_id).await.unwrap().is_empty());
    let transport = ScriptedTransport::always(ok(200));
    let summary = worker(&db, transport.clone(), clock.clone())
        .process_due(10)
        .await
        .unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(transport.sent_count(), 0);
}

#[tokio::test]
async fn queued_delivery_keeps_signature_after_secret_rotation() {
    let db = setup_test_db().await.unwrap();
    let clock = manual_clock();
    let tenant = Uuid::new_v4();
    let (subscription, old_secret) =
        create_subscription(&db, tenant, "https://a.example.com/hook", &[EVENT])
            .await
            .unwrap();

    EventDispatcher::new(db.clone(), clock.clone())
        .dispatch(tenant, EVENT, &json!({ "campaign_id": 9 }))
        .await
        .unwrap();
    let new_secret = SubscriptionRepository::new(db.clone())
        .rotate_secret(tenant, subscription.subscription.id)
        .await
        .unwrap();

    let transport = ScriptedTransport::always(ok(200));
    worker(&db, transport.clone(), clock.clone())
        .process_due(10)
        .await
        .unwrap();

    let request = &transport.sent()[0];
    let payload = request.payload.as_bytes();
    assert!(signature::verify(payload, &request.signature, &old_secret.digest()));
    assert!(!signature::verify(payload, &request.signature, &new_secret.digest()));
}
