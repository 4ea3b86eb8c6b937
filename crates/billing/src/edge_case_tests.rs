// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case and scenario tests for the billing lifecycle
//!
//! Exercises the full subscription state machine against the in-memory
//! store and the mock gateway:
//! - trial cancellation never bills
//! - idempotency under concurrent scheduler/webhook delivery
//! - trial conversion, renewal, decline-to-expiry
//! - immediate and end-of-period cancellation, reactivation
//! - crash recovery from persisted attempt claims

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use tably_shared::{Capability, LimitName, LimitValue, PlanId, RegionTier, TenantId};

use crate::config::BillingConfig;
use crate::gateway::{GatewayRegistry, MockGateway, PaymentGateway, RawPaymentData};
use crate::lifecycle::{PaymentDetails, SignupRequest};
use crate::store::AttemptOutcome;
use crate::subscription::{ConsentRecord, SubscriptionStatus, BILLING_CYCLE_DAYS};
use crate::webhooks::GatewayEvent;
use crate::BillingService;

fn at(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap()
}

// 2100-01-01. Scenario clocks are injected, but entitlement reads use the
// wall clock, so test windows must sit in the future to read as current.
const T0: i64 = 4_102_444_800;

fn consent() -> ConsentRecord {
    ConsentRecord {
        timestamp: at(T0),
        source_ip: "203.0.113.20".to_string(),
        terms_version: "2025-06".to_string(),
    }
}

fn card() -> RawPaymentData {
    RawPaymentData::Card {
        number: "4242424242424242".to_string(),
        exp_month: 12,
        exp_year: 2030,
        cvc: "123".to_string(),
        holder_name: "Sam Patron".to_string(),
    }
}

fn payment() -> Option<PaymentDetails> {
    Some(PaymentDetails {
        provider: None,
        raw: card(),
    })
}

fn signup_request(tenant: TenantId, plan: &str) -> SignupRequest {
    SignupRequest {
        tenant_id: tenant,
        plan_id: PlanId::from(plan),
        region: RegionTier::Tier1,
        consent: consent(),
        payment: payment(),
    }
}

fn service_with_mock() -> (BillingService, Arc<MockGateway>) {
    let mock = Arc::new(MockGateway::new());
    let registry = GatewayRegistry::new(vec![mock.clone() as Arc<dyn PaymentGateway>]);
    let service = BillingService::in_memory(BillingConfig::default(), registry);
    (service, mock)
}

fn charge_event(id: &str, event_type: &str, sub_id: uuid::Uuid, boundary: i64) -> GatewayEvent {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "type": event_type,
        "created": boundary,
        "data": {
            "subscription_id": sub_id,
            "boundary": boundary,
        }
    }))
    .unwrap()
}

// =============================================================================
// Trial cancellation never bills
// =============================================================================

#[tokio::test]
async fn test_canceled_trial_is_never_charged() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Trialing);

    // Cancel mid-trial, then let the scheduler run well past the trial end.
    service
        .lifecycle
        .request_cancellation(tenant, true, at(T0) + Duration::days(3))
        .await
        .unwrap();

    for days in [14, 15, 44, 100] {
        service
            .scheduler
            .tick(at(T0) + Duration::days(days))
            .await
            .unwrap();
    }

    let attempts = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap();
    let charged: i64 = attempts
        .iter()
        .filter(|a| a.outcome == AttemptOutcome::Succeeded)
        .map(|a| a.amount_cents)
        .sum();
    assert_eq!(charged, 0, "a canceled trial must never be charged");
    assert!(mock.calls().await.is_empty(), "gateway never called");

    let summary = service
        .invariants
        .run_all_checks(at(T0) + Duration::days(100))
        .await
        .unwrap();
    assert!(summary.healthy, "violations: {:?}", summary.violations);
}

#[tokio::test]
async fn test_trial_canceled_at_period_end_flips_at_boundary_without_charge() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    let trial_end = sub.trial_end.unwrap();

    service
        .lifecycle
        .request_cancellation(tenant, false, at(T0) + Duration::days(1))
        .await
        .unwrap();

    // Still trialing (and entitled) until the boundary.
    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Trialing);
    assert!(current.cancel_at_period_end);

    let summary = service.scheduler.tick(trial_end).await.unwrap();
    assert_eq!(summary.canceled_at_boundary, 1);

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Canceled);
    assert!(mock.calls().await.is_empty());
}

// =============================================================================
// Trial conversion
// =============================================================================

#[tokio::test]
async fn test_trial_converts_to_active_with_exactly_one_charge() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    let trial_end = sub.trial_end.unwrap();

    let summary = service.scheduler.tick(trial_end).await.unwrap();
    assert_eq!(summary.charged, 1);

    let converted = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(converted.status, SubscriptionStatus::Active);
    assert_eq!(
        converted.current_period_end,
        trial_end + Duration::days(BILLING_CYCLE_DAYS)
    );

    let attempts = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Succeeded);
    // Starter, Tier1 pricing.
    assert_eq!(attempts[0].amount_cents, 2_900);
    assert_eq!(mock.settled_charge_count().await, 1);
}

#[tokio::test]
async fn test_trial_without_stored_payment_method_goes_past_due_at_conversion() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    let mut request = signup_request(tenant, "starter");
    request.payment = None;
    let sub = service.lifecycle.signup(request, at(T0)).await.unwrap();
    assert!(sub.payment_method_token.is_none());

    let trial_end = sub.trial_end.unwrap();
    let summary = service.scheduler.tick(trial_end).await.unwrap();
    assert_eq!(summary.moved_past_due, 1);

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::PastDue);
}

// =============================================================================
// Idempotency: concurrent scheduler and webhook
// =============================================================================

#[tokio::test]
async fn test_concurrent_tick_and_webhook_produce_one_attempt() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    let trial_end = sub.trial_end.unwrap();

    // The provider's asynchronous confirmation and the scheduler's
    // synchronous pass race on the same boundary.
    let event = charge_event(
        "evt_conc",
        "charge.succeeded",
        sub.id.0,
        trial_end.unix_timestamp(),
    );
    let (tick_result, webhook_result) = tokio::join!(
        service.scheduler.tick(trial_end),
        service.webhooks.process_event(event, trial_end),
    );
    tick_result.unwrap();
    webhook_result.unwrap();

    let attempts = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap();
    let key = sub.boundary_idempotency_key(trial_end);
    let for_key: Vec<_> = attempts
        .iter()
        .filter(|a| a.idempotency_key == key)
        .collect();
    assert_eq!(for_key.len(), 1, "exactly one attempt per idempotency key");
    assert_eq!(for_key[0].outcome, AttemptOutcome::Succeeded);

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    // The period rolled exactly once.
    assert_eq!(
        current.current_period_end,
        trial_end + Duration::days(BILLING_CYCLE_DAYS)
    );
}

#[tokio::test]
async fn test_overlapping_ticks_cannot_double_charge() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    let trial_end = sub.trial_end.unwrap();

    let (a, b) = tokio::join!(
        service.scheduler.tick(trial_end),
        service.scheduler.tick(trial_end),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.charged + b.charged, 1, "only one tick performs the charge");
    assert_eq!(mock.settled_charge_count().await, 1);

    let attempts = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
}

#[tokio::test]
async fn test_duplicate_webhook_for_settled_key_is_noop() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    let trial_end = sub.trial_end.unwrap();
    service.scheduler.tick(trial_end).await.unwrap();

    let rolled_end = trial_end + Duration::days(BILLING_CYCLE_DAYS);

    // Late provider confirmation for the already-settled conversion charge.
    let event = charge_event(
        "evt_late",
        "charge.succeeded",
        sub.id.0,
        trial_end.unix_timestamp(),
    );
    service
        .webhooks
        .process_event(event, trial_end + Duration::minutes(5))
        .await
        .unwrap();

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert_eq!(
        current.current_period_end, rolled_end,
        "no double transition from the duplicate confirmation"
    );

    let attempts = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1, "no duplicate attempt record");
}

#[tokio::test]
async fn test_webhook_arriving_before_scheduler_settles_the_boundary() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    // Paid signup; the provider's own recurring schedule charges at the
    // boundary and its webhook beats the scheduler.
    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "premium"), at(T0))
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    let boundary = sub.current_period_end;
    let settled_before = mock.settled_charge_count().await;

    let event = charge_event(
        "evt_early",
        "charge.succeeded",
        sub.id.0,
        boundary.unix_timestamp(),
    );
    service.webhooks.process_event(event, boundary).await.unwrap();

    let summary = service.scheduler.tick(boundary).await.unwrap();
    assert_eq!(summary.charged, 0, "scheduler finds the boundary settled");
    assert_eq!(summary.due_found, 0, "the period already rolled forward");

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(
        current.current_period_end,
        boundary + Duration::days(BILLING_CYCLE_DAYS)
    );
    // The webhook path never charges through the gateway itself.
    assert_eq!(mock.settled_charge_count().await, settled_before);
}

// =============================================================================
// Payment failure, retries, expiry
// =============================================================================

#[tokio::test]
async fn test_decline_then_retries_then_expiry_revokes_capabilities() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "premium"), at(T0))
        .await
        .unwrap();
    let boundary = sub.current_period_end;

    // Renewal declined.
    mock.enqueue_decline("insufficient_funds").await;
    let summary = service.scheduler.tick(boundary).await.unwrap();
    assert_eq!(summary.moved_past_due, 1);
    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::PastDue);

    // Still entitled inside the grace window.
    assert!(service
        .entitlements
        .has_capability(tenant, Capability::KitchenDisplay)
        .await
        .unwrap());

    // Three retries on the backoff schedule, all declined.
    for days in [1, 2, 4] {
        mock.enqueue_decline("insufficient_funds").await;
        let summary = service
            .scheduler
            .tick(boundary + Duration::days(days))
            .await
            .unwrap();
        assert_eq!(summary.retries_attempted, 1, "retry on day {}", days);
    }

    // Retries exhausted; the next pass expires the subscription.
    let summary = service
        .scheduler
        .tick(boundary + Duration::days(4) + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(summary.expired, 1);

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Expired);

    // Every capability is revoked even though the plan defines them.
    for cap in Capability::ALL {
        assert!(!service.entitlements.has_capability(tenant, cap).await.unwrap());
    }
    assert_eq!(
        service
            .entitlements
            .limit_for(tenant, LimitName::MaxTables)
            .await
            .unwrap(),
        LimitValue::ZERO
    );
}

#[tokio::test]
async fn test_retry_success_recovers_to_active() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "growth"), at(T0))
        .await
        .unwrap();
    let boundary = sub.current_period_end;

    mock.enqueue_decline("do_not_honor").await;
    service.scheduler.tick(boundary).await.unwrap();

    // First retry succeeds (script empty, mock defaults to success).
    let retry_at = boundary + Duration::days(1);
    let summary = service.scheduler.tick(retry_at).await.unwrap();
    assert_eq!(summary.recovered, 1);

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert_eq!(current.retry_count, 0);
    assert!(current.past_due_since.is_none());
    assert_eq!(
        current.current_period_end,
        retry_at + Duration::days(BILLING_CYCLE_DAYS)
    );
}

#[tokio::test]
async fn test_transient_outage_retries_same_key_without_double_charge() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    let trial_end = sub.trial_end.unwrap();

    // Exhaust the in-call retries (1 initial + 2 retries), leaving the
    // attempt pending with its claim held.
    for _ in 0..3 {
        mock.enqueue_unavailable().await;
    }
    let summary = service.scheduler.tick(trial_end).await.unwrap();
    assert_eq!(summary.transient_failures, 1);
    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Trialing, "no state change");

    // Within the stale window the claim is respected.
    let summary = service
        .scheduler
        .tick(trial_end + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(summary.skipped_in_flight, 1);

    // Past the stale window the same key is re-driven and succeeds.
    let resumed = trial_end + Duration::minutes(31);
    let summary = service.scheduler.tick(resumed).await.unwrap();
    assert_eq!(summary.charged, 1);

    let attempts = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1, "one attempt row across the outage");
    assert_eq!(mock.settled_charge_count().await, 1, "one settled charge");

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
}

// =============================================================================
// Cancellation and reactivation
// =============================================================================

#[tokio::test]
async fn test_immediate_cancel_stops_all_future_charges() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "premium"), at(T0))
        .await
        .unwrap();
    let external_ref = sub.gateway_subscription_ref.clone().unwrap();

    let canceled = service
        .lifecycle
        .request_cancellation(tenant, true, at(T0) + Duration::days(10))
        .await
        .unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert!(mock.canceled_refs().await.contains(&external_ref));

    let attempts_before = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap()
        .len();

    for days in [30, 60, 120] {
        service
            .scheduler
            .tick(at(T0) + Duration::days(days))
            .await
            .unwrap();
    }

    let attempts_after = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap()
        .len();
    assert_eq!(
        attempts_before, attempts_after,
        "no further billing attempts after immediate cancellation"
    );
}

#[tokio::test]
async fn test_cancel_fails_closed_when_gateway_cancel_fails() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "premium"), at(T0))
        .await
        .unwrap();

    // The recurring schedule cannot be canceled at the provider, so the
    // local subscription must not report canceled either.
    mock.set_fail_cancel(true);
    let err = service
        .lifecycle
        .request_cancellation(tenant, true, at(T0) + Duration::days(1))
        .await
        .unwrap_err();
    assert!(err.is_retriable());

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);

    // Retry once the provider recovers.
    mock.set_fail_cancel(false);
    let canceled = service
        .lifecycle
        .request_cancellation(tenant, true, at(T0) + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn test_end_of_period_cancel_and_undo() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "growth"), at(T0))
        .await
        .unwrap();

    service
        .lifecycle
        .request_cancellation(tenant, false, at(T0) + Duration::days(5))
        .await
        .unwrap();
    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert!(current.cancel_at_period_end);

    // Undo before the boundary.
    let reactivated = service
        .lifecycle
        .reactivate(tenant, at(T0) + Duration::days(6))
        .await
        .unwrap();
    assert!(!reactivated.cancel_at_period_end);
    assert_eq!(reactivated.status, SubscriptionStatus::Active);

    // The boundary then renews normally instead of canceling.
    let summary = service.scheduler.tick(sub.current_period_end).await.unwrap();
    assert_eq!(summary.charged, 1);
    assert_eq!(summary.canceled_at_boundary, 0);
}

#[tokio::test]
async fn test_reactivation_of_fully_canceled_mints_new_cycle() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "growth"), at(T0))
        .await
        .unwrap();
    service
        .lifecycle
        .request_cancellation(tenant, true, at(T0) + Duration::days(3))
        .await
        .unwrap();

    let reactivate_at = at(T0) + Duration::days(9);
    let reactivated = service
        .lifecycle
        .reactivate(tenant, reactivate_at)
        .await
        .unwrap();
    assert_eq!(reactivated.status, SubscriptionStatus::Active);
    assert_eq!(reactivated.current_period_start, reactivate_at);
    assert_eq!(
        reactivated.current_period_end,
        reactivate_at + Duration::days(BILLING_CYCLE_DAYS)
    );

    // The reactivation charge is the subscription's first attempt: the
    // trial signup never billed.
    let attempts = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Succeeded);
}

#[tokio::test]
async fn test_reactivating_expired_subscription_is_a_state_conflict() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "premium"), at(T0))
        .await
        .unwrap();
    let boundary = sub.current_period_end;

    // Decline everything until expiry.
    for _ in 0..4 {
        mock.enqueue_decline("card_expired").await;
    }
    service.scheduler.tick(boundary).await.unwrap();
    for days in [1, 2, 4] {
        service
            .scheduler
            .tick(boundary + Duration::days(days))
            .await
            .unwrap();
    }
    service
        .scheduler
        .tick(boundary + Duration::days(5))
        .await
        .unwrap();

    let err = service
        .lifecycle
        .reactivate(tenant, boundary + Duration::days(6))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::BillingError::StateConflict(_)));
}

// =============================================================================
// Signup edge cases
// =============================================================================

#[tokio::test]
async fn test_failed_initial_charge_creates_no_subscription() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    mock.enqueue_decline("insufficient_funds").await;
    let err = service
        .lifecycle
        .signup(signup_request(tenant, "premium"), at(T0))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::BillingError::PaymentDeclined { .. }));

    assert!(service
        .store()
        .subscriptions
        .current_for_tenant(tenant)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_trial_grant_is_consumed_once_per_tenant() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let first = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    assert_eq!(first.status, SubscriptionStatus::Trialing);
    service
        .lifecycle
        .request_cancellation(tenant, true, at(T0) + Duration::days(1))
        .await
        .unwrap();

    // Second signup on a trial-bearing plan bills immediately: the one-time
    // trial grant is already spent.
    let second = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0) + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(second.status, SubscriptionStatus::Active);
    assert_eq!(mock.settled_charge_count().await, 1);
}

#[tokio::test]
async fn test_live_subscription_blocks_second_signup() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    let err = service
        .lifecycle
        .signup(signup_request(tenant, "growth"), at(T0) + Duration::days(1))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::BillingError::StateConflict(_)));
}

#[tokio::test]
async fn test_checkout_with_no_gateway_offers_no_payment_methods() {
    let service = BillingService::in_memory(BillingConfig::default(), GatewayRegistry::empty());
    let tenant = TenantId::new();

    let preview = service
        .lifecycle
        .checkout(tenant, &PlanId::from("starter"), RegionTier::Tier1)
        .await
        .unwrap();
    assert!(preview.payment_methods.is_empty());
    // Trial is withheld too: trial-without-gateway is an explicit opt-in.
    assert!(!preview.trial_available);

    let mut request = signup_request(tenant, "starter");
    request.payment = None;
    let err = service.lifecycle.signup(request, at(T0)).await.unwrap_err();
    assert!(matches!(err, crate::BillingError::Configuration(_)));
}

#[tokio::test]
async fn test_trial_without_gateway_allowed_when_opted_in() {
    let config = BillingConfig {
        trial_without_gateway: true,
        ..BillingConfig::default()
    };
    let service = BillingService::in_memory(config, GatewayRegistry::empty());
    let tenant = TenantId::new();

    let preview = service
        .lifecycle
        .checkout(tenant, &PlanId::from("starter"), RegionTier::Tier1)
        .await
        .unwrap();
    assert!(preview.trial_available);

    let mut request = signup_request(tenant, "starter");
    request.payment = None;
    let sub = service.lifecycle.signup(request, at(T0)).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Trialing);
}

// =============================================================================
// Plan changes
// =============================================================================

#[tokio::test]
async fn test_plan_change_is_immediate_without_touching_status_or_period() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    assert!(!service
        .entitlements
        .has_capability(tenant, Capability::KitchenDisplay)
        .await
        .unwrap());

    let changed = service
        .lifecycle
        .change_plan(tenant, &PlanId::from("growth"), at(T0) + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(changed.plan_id, PlanId::from("growth"));
    assert_eq!(changed.status, sub.status);
    assert_eq!(changed.current_period_end, sub.current_period_end);

    // Entitlements follow the new plan immediately.
    assert!(service
        .entitlements
        .has_capability(tenant, Capability::KitchenDisplay)
        .await
        .unwrap());

    // No charge or refund for the switch: proration is out of scope.
    let attempts = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap();
    assert!(attempts.is_empty());
}

#[tokio::test]
async fn test_plan_change_to_retired_plan_is_rejected() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    let err = service
        .lifecycle
        .change_plan(tenant, &PlanId::from("classic"), at(T0))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::BillingError::StateConflict(_)));
}

// =============================================================================
// Webhook-driven failures and provider events
// =============================================================================

#[tokio::test]
async fn test_webhook_charge_failed_moves_subscription_past_due() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "premium"), at(T0))
        .await
        .unwrap();
    let boundary = sub.current_period_end;

    let event: GatewayEvent = serde_json::from_value(serde_json::json!({
        "id": "evt_fail",
        "type": "charge.failed",
        "created": boundary.unix_timestamp(),
        "data": {
            "subscription_id": sub.id.0,
            "boundary": boundary.unix_timestamp(),
            "failure_reason": "insufficient_funds",
        }
    }))
    .unwrap();
    service.webhooks.process_event(event, boundary).await.unwrap();

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::PastDue);
    assert_eq!(current.retry_count, 1);
}

#[tokio::test]
async fn test_provider_recurring_cancel_schedules_end_of_period() {
    let (service, _mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "premium"), at(T0))
        .await
        .unwrap();
    let external_ref = sub.gateway_subscription_ref.clone().unwrap();

    let event: GatewayEvent = serde_json::from_value(serde_json::json!({
        "id": "evt_rc",
        "type": "recurring.canceled",
        "created": at(T0).unix_timestamp(),
        "data": { "external_ref": external_ref }
    }))
    .unwrap();
    service
        .webhooks
        .process_event(event, at(T0) + Duration::days(1))
        .await
        .unwrap();

    let current = service.store().subscriptions.get(sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert!(current.cancel_at_period_end);

    // At the boundary the cancellation takes effect without a charge.
    let summary = service.scheduler.tick(sub.current_period_end).await.unwrap();
    assert_eq!(summary.canceled_at_boundary, 1);
}

// =============================================================================
// Crash recovery
// =============================================================================

#[tokio::test]
async fn test_scheduler_resumes_from_persisted_claims_after_crash() {
    let (service, mock) = service_with_mock();
    let tenant = TenantId::new();

    let sub = service
        .lifecycle
        .signup(signup_request(tenant, "starter"), at(T0))
        .await
        .unwrap();
    let trial_end = sub.trial_end.unwrap();

    // Simulate a worker that claimed the boundary attempt and died before
    // charging: the pending claim is persisted, nothing else happened.
    let key = sub.boundary_idempotency_key(trial_end);
    let attempt = crate::store::BillingAttempt::pending(
        sub.id,
        key.clone(),
        2_900,
        "USD".to_string(),
        trial_end,
    );
    service
        .store()
        .attempts
        .claim(&attempt, service.config.attempt_stale_after, trial_end)
        .await
        .unwrap();

    // A fresh tick inside the stale window respects the dead worker's claim.
    let summary = service
        .scheduler
        .tick(trial_end + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(summary.skipped_in_flight, 1);

    // Past the stale window the claim is recovered and the charge completes,
    // still under the original idempotency key.
    let summary = service
        .scheduler
        .tick(trial_end + Duration::minutes(31))
        .await
        .unwrap();
    assert_eq!(summary.charged, 1);
    assert_eq!(mock.settled_charge_count().await, 1);

    let attempts = service
        .store()
        .attempts
        .list_for_subscription(sub.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].idempotency_key, key);
}
