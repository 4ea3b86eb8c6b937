//! Subscription lifecycle manager
//!
//! Owns the subscription state machine: signup (trial or atomic first
//! charge), trial conversion, renewal, payment failure handling,
//! cancellation, reactivation and plan changes. The store is the source of
//! truth; the gateway is for payment processing only.
//!
//! Concurrency contract: the billing scheduler and the webhook processor
//! both deliver charge outcomes here, and [`LifecycleManager::apply_charge_outcome`]
//! is the single serialized entry point for both. Charges run in three
//! phases so the long network call never holds the per-subscription lock:
//! claim the billing attempt (short, locked), perform the gateway charge
//! (long, unlocked), apply the outcome (short, locked). The idempotency key
//! reconciles whichever phase ordering the two triggers land in.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use tably_shared::{PlanId, RegionTier, SubscriptionId, TenantId};

use crate::catalog::{PlanCatalog, PlanPrice};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::{
    ChargeStatus, GatewayError, GatewayRegistry, PaymentGateway, PaymentMethodDescriptor,
    PaymentMethodToken, RawPaymentData, RecurringTerms,
};
use crate::store::{AttemptClaim, AttemptOutcome, BillingAttempt, Store};
use crate::subscription::{ConsentRecord, Subscription, SubscriptionStatus, BILLING_CYCLE_DAYS};

/// Per-subscription async lock registry.
///
/// Serializes scheduler-driven and webhook-driven transitions on the same
/// subscription; operations on different subscriptions are independent.
#[derive(Default)]
pub struct SubscriptionLocks {
    inner: Mutex<HashMap<SubscriptionId, Arc<Mutex<()>>>>,
}

impl SubscriptionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: SubscriptionId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// What checkout can offer a tenant for a plan.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutPreview {
    pub plan_id: PlanId,
    pub price: PlanPrice,
    pub trial_available: bool,
    /// Empty means no payment gateway is configured; that is a valid
    /// response, not an error.
    pub payment_methods: Vec<PaymentMethodDescriptor>,
}

/// Payment details collected at signup.
#[derive(Debug, Clone)]
pub struct PaymentDetails {
    /// Provider preference; the registry's primary gateway when absent.
    pub provider: Option<String>,
    pub raw: RawPaymentData,
}

#[derive(Debug, Clone)]
pub struct SignupRequest {
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub region: RegionTier,
    pub consent: ConsentRecord,
    pub payment: Option<PaymentDetails>,
}

/// Result of driving one charge decision for a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeDriveResult {
    /// Nothing was owed (not due, or status changed underneath us).
    NotDue,
    /// An end-of-period cancellation took effect at the boundary; no charge.
    CanceledAtBoundary,
    /// The charge succeeded and the transition was applied.
    Charged,
    /// The provider accepted the charge but has not settled it; the webhook
    /// will deliver the final outcome.
    PendingSettlement,
    /// Another worker holds the claim on this boundary's attempt.
    InFlight,
    /// The attempt already has a terminal outcome; nothing to do.
    AlreadySettled,
    /// The charge failed terminally and the subscription moved toward
    /// past_due.
    MovedPastDue { reason: String },
    /// Transient gateway failure; the pending claim stays and a later tick
    /// retries with the same idempotency key.
    TransientFailure { reason: String },
    /// No gateway configured; the subscription stays due.
    SkippedNoGateway,
}

/// Charge outcome delivered by the scheduler or the webhook processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcomeReport {
    Succeeded,
    Failed { reason: String },
}

impl ChargeOutcomeReport {
    fn as_attempt_outcome(&self) -> AttemptOutcome {
        match self {
            ChargeOutcomeReport::Succeeded => AttemptOutcome::Succeeded,
            ChargeOutcomeReport::Failed { .. } => AttemptOutcome::Failed,
        }
    }
}

/// How an outcome delivery was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedOutcome {
    /// The outcome was recorded and the transition applied.
    Applied,
    /// The same outcome was already recorded; no-op.
    AlreadyApplied,
    /// A different outcome was recorded locally; the provider's version won
    /// and the correction was applied.
    Corrected,
}

pub struct LifecycleManager {
    store: Store,
    catalog: Arc<PlanCatalog>,
    gateways: GatewayRegistry,
    events: BillingEventLogger,
    locks: SubscriptionLocks,
    config: BillingConfig,
}

impl LifecycleManager {
    pub fn new(
        store: Store,
        catalog: Arc<PlanCatalog>,
        gateways: GatewayRegistry,
        config: BillingConfig,
    ) -> Self {
        let events = BillingEventLogger::new(store.events.clone());
        Self {
            store,
            catalog,
            gateways,
            events,
            locks: SubscriptionLocks::new(),
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<PlanCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    async fn log_event(&self, builder: BillingEventBuilder) {
        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(error = %e, "failed to log billing event");
        }
    }

    fn select_gateway(
        &self,
        provider: Option<&str>,
    ) -> BillingResult<Arc<dyn PaymentGateway>> {
        let gateway = match provider {
            Some(slug) => self.gateways.get(slug),
            None => self.gateways.primary(),
        };
        gateway.ok_or_else(|| {
            BillingError::Configuration("no payment gateway configured".to_string())
        })
    }

    /// Gateway charge with transparent in-call retries for transient
    /// failures, reusing the same idempotency key on every attempt.
    async fn gateway_charge(
        &self,
        gateway: &Arc<dyn PaymentGateway>,
        token: &PaymentMethodToken,
        amount_cents: i64,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<crate::gateway::GatewayCharge, GatewayError> {
        let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(2);
        RetryIf::spawn(
            strategy,
            || gateway.charge(token, amount_cents, currency, idempotency_key),
            |e: &GatewayError| e.is_retriable(),
        )
        .await
    }

    // =========================================================================
    // Checkout and signup
    // =========================================================================

    /// Checkout initiation: what can this tenant buy, and how can they pay.
    pub async fn checkout(
        &self,
        tenant_id: TenantId,
        plan_id: &PlanId,
        region: RegionTier,
    ) -> BillingResult<CheckoutPreview> {
        let plan = self
            .catalog
            .get_plan(plan_id)
            .ok_or_else(|| BillingError::NotFound(format!("plan '{}'", plan_id)))?;
        if !plan.is_active {
            return Err(BillingError::StateConflict(format!(
                "plan '{}' is no longer offered",
                plan_id
            )));
        }

        let trial_used = self.store.subscriptions.trial_used(tenant_id).await?;
        let gateway_present = !self.gateways.is_empty();
        let trial_available = plan.offers_trial()
            && !trial_used
            && (gateway_present || self.config.trial_without_gateway);

        Ok(CheckoutPreview {
            plan_id: plan_id.clone(),
            price: plan.price_for(region),
            trial_available,
            payment_methods: self.gateways.available_methods(),
        })
    }

    /// Create a subscription for a tenant.
    ///
    /// Trial eligibility is a one-time grant; with it unused and a plan that
    /// offers a trial, the subscription starts `trialing` with no charge.
    /// Otherwise creation is atomic with a successful first charge: a failed
    /// charge leaves no subscription behind.
    pub async fn signup(
        &self,
        request: SignupRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        if let Some(existing) = self
            .store
            .subscriptions
            .current_for_tenant(request.tenant_id)
            .await?
        {
            if existing.status.is_live() {
                return Err(BillingError::StateConflict(format!(
                    "tenant already has a {} subscription",
                    existing.status
                )));
            }
        }

        let plan = self
            .catalog
            .get_plan(&request.plan_id)
            .ok_or_else(|| BillingError::NotFound(format!("plan '{}'", request.plan_id)))?
            .clone();
        if !plan.is_active {
            return Err(BillingError::StateConflict(format!(
                "plan '{}' is no longer offered",
                request.plan_id
            )));
        }

        let trial_used = self
            .store
            .subscriptions
            .trial_used(request.tenant_id)
            .await?;
        if plan.offers_trial() && !trial_used {
            self.signup_trial(request, plan.trial_days, now).await
        } else {
            self.signup_paid(request, now).await
        }
    }

    async fn signup_trial(
        &self,
        request: SignupRequest,
        trial_days: u32,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        // Tokenize up front when payment details were given, so conversion
        // can charge without another collection step.
        let token = match (&request.payment, self.gateways.is_empty()) {
            (Some(details), false) => {
                let gateway = self.select_gateway(details.provider.as_deref())?;
                Some(gateway.tokenize(details.raw.clone()).await?.0)
            }
            (_, true) if !self.config.trial_without_gateway => {
                return Err(BillingError::Configuration(
                    "no payment gateway configured and trial without gateway is disabled"
                        .to_string(),
                ));
            }
            _ => None,
        };

        let sub = Subscription::new_trial(
            request.tenant_id,
            request.plan_id,
            request.region,
            trial_days,
            &request.consent,
            token,
            now,
        );
        self.store.subscriptions.insert(&sub).await?;
        self.store
            .subscriptions
            .mark_trial_used(request.tenant_id)
            .await?;

        tracing::info!(
            tenant_id = %sub.tenant_id,
            subscription_id = %sub.id,
            plan_id = %sub.plan_id,
            trial_end = ?sub.trial_end,
            "trial started"
        );
        self.log_event(
            BillingEventBuilder::new(sub.tenant_id, BillingEventType::TrialStarted)
                .data(serde_json::json!({
                    "subscription_id": sub.id,
                    "plan_id": sub.plan_id,
                    "trial_end": sub.trial_end.map(|t| t.to_string()),
                }))
                .actor_type(ActorType::Tenant),
        )
        .await;

        Ok(sub)
    }

    async fn signup_paid(
        &self,
        request: SignupRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let details = request.payment.as_ref().ok_or_else(|| {
            BillingError::InvalidInput("a payment method is required for this plan".to_string())
        })?;
        let gateway = self.select_gateway(details.provider.as_deref())?;
        let token = gateway.tokenize(details.raw.clone()).await?;

        let price = self
            .catalog
            .price_for(&request.plan_id, request.region)?;
        let mut sub = Subscription::new_paid(
            request.tenant_id,
            request.plan_id,
            request.region,
            &request.consent,
            token.0.clone(),
            now,
        );

        // First charge, keyed to the opening period boundary. The
        // subscription is only persisted once this succeeds.
        let key = sub.boundary_idempotency_key(sub.current_period_start);
        let attempt = BillingAttempt::pending(
            sub.id,
            key.clone(),
            price.amount_cents,
            price.currency.to_string(),
            now,
        );
        match self
            .store
            .attempts
            .claim(&attempt, self.config.attempt_stale_after, now)
            .await?
        {
            AttemptClaim::Claimed(_) => {}
            AttemptClaim::InFlight(_) | AttemptClaim::Settled(_) => {
                return Err(BillingError::StateConflict(
                    "signup already in progress for this subscription".to_string(),
                ));
            }
        }

        let charge = match self
            .gateway_charge(&gateway, &token, price.amount_cents, price.currency, &key)
            .await
        {
            Ok(charge) => charge,
            Err(e) => {
                self.store
                    .attempts
                    .record_outcome(&key, AttemptOutcome::Failed, Some(&e.to_string()))
                    .await?;
                tracing::warn!(
                    tenant_id = %sub.tenant_id,
                    plan_id = %sub.plan_id,
                    error = %e,
                    "initial charge failed; subscription not created"
                );
                return Err(e.into());
            }
        };

        if charge.status != ChargeStatus::Succeeded {
            // Creation is atomic with a settled first charge; an async
            // settlement cannot open an entitled subscription.
            return Err(BillingError::TransientGateway(
                "initial charge is awaiting settlement; please retry".to_string(),
            ));
        }

        // The provider-side recurring schedule is a backstop; losing it is
        // recoverable, so failure only logs.
        let terms = RecurringTerms {
            plan_id: sub.plan_id.clone(),
            amount_cents: price.amount_cents,
            currency: price.currency.to_string(),
            interval_days: BILLING_CYCLE_DAYS as u32,
        };
        match gateway
            .create_recurring(&token, &terms, &format!("{}-recurring", key))
            .await
        {
            Ok(external_ref) => sub.gateway_subscription_ref = Some(external_ref),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    error = %e,
                    "failed to create recurring schedule; scheduler will drive renewals"
                );
            }
        }

        self.store.subscriptions.insert(&sub).await?;
        self.store
            .attempts
            .record_outcome(&key, AttemptOutcome::Succeeded, None)
            .await?;

        tracing::info!(
            tenant_id = %sub.tenant_id,
            subscription_id = %sub.id,
            plan_id = %sub.plan_id,
            amount_cents = price.amount_cents,
            "subscription created after successful initial charge"
        );
        self.log_event(
            BillingEventBuilder::new(sub.tenant_id, BillingEventType::SubscriptionCreated)
                .data(serde_json::json!({
                    "subscription_id": sub.id,
                    "plan_id": sub.plan_id,
                    "amount_cents": price.amount_cents,
                    "provider": gateway.provider(),
                }))
                .actor_type(ActorType::Tenant),
        )
        .await;

        Ok(sub)
    }

    // =========================================================================
    // Scheduler-driven charging
    // =========================================================================

    /// Drive the charge owed at a trial-end or renewal boundary.
    pub async fn drive_boundary_charge(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<ChargeDriveResult> {
        // Phase 1 (locked): validate dueness and claim the attempt.
        let claim = {
            let _guard = self.locks.acquire(subscription_id).await;
            let sub = self.require_sub(subscription_id).await?;

            if !matches!(
                sub.status,
                SubscriptionStatus::Trialing | SubscriptionStatus::Active
            ) {
                return Ok(ChargeDriveResult::NotDue);
            }
            let Some(boundary) = sub.next_boundary() else {
                return Ok(ChargeDriveResult::NotDue);
            };
            if boundary > now {
                return Ok(ChargeDriveResult::NotDue);
            }

            // A scheduled cancellation takes effect at the boundary with no
            // further charge.
            if sub.cancel_at_period_end {
                self.finalize_scheduled_cancel(sub, now).await?;
                return Ok(ChargeDriveResult::CanceledAtBoundary);
            }

            let price = self.price_for_sub(&sub)?;
            let key = sub.boundary_idempotency_key(boundary);
            match self.claim_attempt(&sub, &key, &price, now).await? {
                AttemptClaim::Claimed(_) => (sub, key, price),
                AttemptClaim::InFlight(_) => return Ok(ChargeDriveResult::InFlight),
                AttemptClaim::Settled(_) => return Ok(ChargeDriveResult::AlreadySettled),
            }
        };
        let (sub, key, price) = claim;

        self.charge_and_apply(&sub, &key, &price, now).await
    }

    /// Drive the next past-due retry if its backoff delay has elapsed.
    pub async fn drive_retry_charge(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<ChargeDriveResult> {
        let claim = {
            let _guard = self.locks.acquire(subscription_id).await;
            let sub = self.require_sub(subscription_id).await?;

            if sub.status != SubscriptionStatus::PastDue {
                return Ok(ChargeDriveResult::NotDue);
            }
            if sub.retry_count > self.config.max_retries {
                return Ok(ChargeDriveResult::NotDue);
            }
            let Some(since) = sub.past_due_since else {
                return Ok(ChargeDriveResult::NotDue);
            };
            if now < since + self.config.retry_delay(sub.retry_count) {
                return Ok(ChargeDriveResult::NotDue);
            }

            let price = self.price_for_sub(&sub)?;
            // Each retry after a terminal decline is a distinct attempt.
            let key = sub.retry_idempotency_key(sub.current_period_end, sub.retry_count);
            match self.claim_attempt(&sub, &key, &price, now).await? {
                AttemptClaim::Claimed(_) => (sub, key, price),
                AttemptClaim::InFlight(_) => return Ok(ChargeDriveResult::InFlight),
                AttemptClaim::Settled(_) => return Ok(ChargeDriveResult::AlreadySettled),
            }
        };
        let (sub, key, price) = claim;

        self.charge_and_apply(&sub, &key, &price, now).await
    }

    async fn claim_attempt(
        &self,
        sub: &Subscription,
        key: &str,
        price: &PlanPrice,
        now: OffsetDateTime,
    ) -> BillingResult<AttemptClaim> {
        let attempt = BillingAttempt::pending(
            sub.id,
            key.to_string(),
            price.amount_cents,
            price.currency.to_string(),
            now,
        );
        self.store
            .attempts
            .claim(&attempt, self.config.attempt_stale_after, now)
            .await
    }

    /// Phases 2 and 3: the unlocked network charge, then the locked outcome
    /// application.
    async fn charge_and_apply(
        &self,
        sub: &Subscription,
        key: &str,
        price: &PlanPrice,
        now: OffsetDateTime,
    ) -> BillingResult<ChargeDriveResult> {
        let Some(token) = sub.payment_method_token.clone().map(PaymentMethodToken) else {
            // Nothing to charge with; fail the attempt so the retry/expiry
            // machinery takes over and the tenant is asked for a method.
            self.apply_charge_outcome(
                sub.id,
                key,
                ChargeOutcomeReport::Failed {
                    reason: "no payment method on file".to_string(),
                },
                ActorType::System,
                None,
                now,
            )
            .await?;
            return Ok(ChargeDriveResult::MovedPastDue {
                reason: "no payment method on file".to_string(),
            });
        };

        let Some(gateway) = self.gateways.primary() else {
            tracing::warn!(
                subscription_id = %sub.id,
                "charge due but no gateway configured; leaving subscription due"
            );
            return Ok(ChargeDriveResult::SkippedNoGateway);
        };

        match self
            .gateway_charge(&gateway, &token, price.amount_cents, price.currency, key)
            .await
        {
            Ok(charge) if charge.status == ChargeStatus::Succeeded => {
                self.apply_charge_outcome(
                    sub.id,
                    key,
                    ChargeOutcomeReport::Succeeded,
                    ActorType::System,
                    None,
                    now,
                )
                .await?;
                self.ensure_recurring(sub.id, now).await;
                Ok(ChargeDriveResult::Charged)
            }
            Ok(_) => {
                // Pending settlement: the attempt stays pending and the
                // provider webhook delivers the terminal outcome.
                tracing::info!(
                    subscription_id = %sub.id,
                    idempotency_key = %key,
                    "charge accepted, awaiting settlement webhook"
                );
                Ok(ChargeDriveResult::PendingSettlement)
            }
            Err(e) if e.is_retriable() => {
                // The pending claim stays; a later tick re-drives the same
                // idempotency key, so a transient outage cannot double
                // charge once connectivity returns.
                tracing::warn!(
                    subscription_id = %sub.id,
                    idempotency_key = %key,
                    error = %e,
                    "transient gateway failure; will retry with same key"
                );
                Ok(ChargeDriveResult::TransientFailure {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.apply_charge_outcome(
                    sub.id,
                    key,
                    ChargeOutcomeReport::Failed {
                        reason: reason.clone(),
                    },
                    ActorType::System,
                    None,
                    now,
                )
                .await?;
                Ok(ChargeDriveResult::MovedPastDue { reason })
            }
        }
    }

    // =========================================================================
    // The single apply-outcome entry point
    // =========================================================================

    /// Apply a charge outcome to a subscription.
    ///
    /// Both the scheduler (synchronous charge result) and the webhook
    /// processor (asynchronous provider confirmation) deliver outcomes
    /// through this function, serialized per subscription. A key that
    /// already carries the same terminal outcome is a no-op; a conflicting
    /// outcome reported by the gateway wins over the local record and is
    /// audit-logged as a correction.
    pub async fn apply_charge_outcome(
        &self,
        subscription_id: SubscriptionId,
        idempotency_key: &str,
        report: ChargeOutcomeReport,
        actor: ActorType,
        gateway_event_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<AppliedOutcome> {
        let _guard = self.locks.acquire(subscription_id).await;
        let sub = self.require_sub(subscription_id).await?;

        let attempt = self
            .store
            .attempts
            .get_by_key(idempotency_key)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("billing attempt '{}'", idempotency_key))
            })?;

        let reported = report.as_attempt_outcome();
        let correction = if attempt.outcome.is_terminal() {
            if attempt.outcome == reported {
                return Ok(AppliedOutcome::AlreadyApplied);
            }
            if actor != ActorType::Gateway {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    idempotency_key = %idempotency_key,
                    recorded = ?attempt.outcome,
                    reported = ?reported,
                    "conflicting non-gateway outcome ignored; keeping recorded outcome"
                );
                return Ok(AppliedOutcome::AlreadyApplied);
            }
            true
        } else {
            false
        };

        let failure_reason = match &report {
            ChargeOutcomeReport::Failed { reason } => Some(reason.clone()),
            ChargeOutcomeReport::Succeeded => None,
        };
        self.store
            .attempts
            .record_outcome(idempotency_key, reported, failure_reason.as_deref())
            .await?;

        if correction {
            tracing::warn!(
                subscription_id = %subscription_id,
                idempotency_key = %idempotency_key,
                reported = ?reported,
                "provider reported a conflicting outcome; provider wins"
            );
            self.log_event(
                BillingEventBuilder::new(
                    sub.tenant_id,
                    BillingEventType::OutcomeCorrectedByProvider,
                )
                .data(serde_json::json!({
                    "subscription_id": subscription_id,
                    "idempotency_key": idempotency_key,
                    "outcome": reported,
                }))
                .actor_type(ActorType::Gateway),
            )
            .await;
        }

        match report {
            ChargeOutcomeReport::Succeeded => {
                self.transition_on_success(sub, actor, gateway_event_id, now)
                    .await?
            }
            ChargeOutcomeReport::Failed { reason } => {
                self.transition_on_failure(sub, &reason, actor, gateway_event_id, now)
                    .await?
            }
        }

        Ok(if correction {
            AppliedOutcome::Corrected
        } else {
            AppliedOutcome::Applied
        })
    }

    async fn transition_on_success(
        &self,
        mut sub: Subscription,
        actor: ActorType,
        gateway_event_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let (event_type, data) = match sub.status {
            SubscriptionStatus::Trialing => {
                let (start, end) = Subscription::next_period(now);
                sub.status = SubscriptionStatus::Active;
                sub.current_period_start = start;
                sub.current_period_end = end;
                sub.past_due_since = None;
                sub.retry_count = 0;
                (
                    BillingEventType::TrialConverted,
                    serde_json::json!({
                        "subscription_id": sub.id,
                        "period_end": end.to_string(),
                    }),
                )
            }
            SubscriptionStatus::Active => {
                // Renewal rolls the period forward from the old boundary so
                // cycles stay contiguous.
                let (start, end) = Subscription::next_period(sub.current_period_end);
                sub.current_period_start = start;
                sub.current_period_end = end;
                (
                    BillingEventType::RenewalSucceeded,
                    serde_json::json!({
                        "subscription_id": sub.id,
                        "period_end": end.to_string(),
                    }),
                )
            }
            SubscriptionStatus::PastDue => {
                let (start, end) = Subscription::next_period(now);
                sub.status = SubscriptionStatus::Active;
                sub.current_period_start = start;
                sub.current_period_end = end;
                sub.past_due_since = None;
                sub.retry_count = 0;
                (
                    BillingEventType::RenewalSucceeded,
                    serde_json::json!({
                        "subscription_id": sub.id,
                        "recovered": true,
                        "period_end": end.to_string(),
                    }),
                )
            }
            SubscriptionStatus::Canceled => {
                // Reactivation by fresh charge: a new billing cycle, not a
                // resurrection of the old one.
                let (start, end) = Subscription::next_period(now);
                sub.status = SubscriptionStatus::Active;
                sub.current_period_start = start;
                sub.current_period_end = end;
                sub.cancel_at_period_end = false;
                sub.canceled_at = None;
                sub.past_due_since = None;
                sub.retry_count = 0;
                (
                    BillingEventType::SubscriptionReactivated,
                    serde_json::json!({
                        "subscription_id": sub.id,
                        "period_end": end.to_string(),
                    }),
                )
            }
            SubscriptionStatus::Expired => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    "successful charge reported for expired subscription; not reviving"
                );
                return Ok(());
            }
        };

        self.persist(&mut sub, now).await?;
        let mut builder = BillingEventBuilder::new(sub.tenant_id, event_type)
            .data(data)
            .actor_type(actor);
        if let Some(event_id) = gateway_event_id {
            builder = builder.gateway_event(event_id);
        }
        self.log_event(builder).await;
        Ok(())
    }

    async fn transition_on_failure(
        &self,
        mut sub: Subscription,
        reason: &str,
        actor: ActorType,
        gateway_event_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        match sub.status {
            SubscriptionStatus::Trialing | SubscriptionStatus::Active => {
                sub.status = SubscriptionStatus::PastDue;
                sub.past_due_since = Some(now);
                sub.retry_count = 1;
                self.persist(&mut sub, now).await?;
                tracing::warn!(
                    subscription_id = %sub.id,
                    reason = %reason,
                    "charge failed; subscription past due"
                );
                let mut builder =
                    BillingEventBuilder::new(sub.tenant_id, BillingEventType::SubscriptionPastDue)
                        .data(serde_json::json!({
                            "subscription_id": sub.id,
                            "reason": reason,
                            "action_required": "update payment method",
                        }))
                        .actor_type(actor);
                if let Some(event_id) = gateway_event_id {
                    builder = builder.gateway_event(event_id);
                }
                self.log_event(builder).await;
            }
            SubscriptionStatus::PastDue => {
                sub.retry_count += 1;
                self.persist(&mut sub, now).await?;
                tracing::warn!(
                    subscription_id = %sub.id,
                    retry_count = sub.retry_count,
                    reason = %reason,
                    "retry charge failed"
                );
                self.log_event(
                    BillingEventBuilder::new(sub.tenant_id, BillingEventType::PaymentFailed)
                        .data(serde_json::json!({
                            "subscription_id": sub.id,
                            "retry_count": sub.retry_count,
                            "reason": reason,
                        }))
                        .actor_type(actor),
                )
                .await;
            }
            _ => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    status = %sub.status,
                    "failure outcome for non-chargeable status; no transition"
                );
            }
        }
        Ok(())
    }

    /// Expire a past-due subscription whose retries or grace window are
    /// exhausted. Returns true if the subscription expired.
    pub async fn expire_if_exhausted(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let expired = {
            let _guard = self.locks.acquire(subscription_id).await;
            let mut sub = self.require_sub(subscription_id).await?;
            if sub.status != SubscriptionStatus::PastDue {
                return Ok(false);
            }
            let retries_exhausted = sub.retry_count > self.config.max_retries;
            let grace_exhausted = sub
                .past_due_since
                .is_some_and(|since| since + self.config.grace <= now);
            if !retries_exhausted && !grace_exhausted {
                return Ok(false);
            }

            sub.status = SubscriptionStatus::Expired;
            self.persist(&mut sub, now).await?;
            tracing::warn!(
                subscription_id = %sub.id,
                tenant_id = %sub.tenant_id,
                retry_count = sub.retry_count,
                "subscription expired; entitlements revoked"
            );
            self.log_event(
                BillingEventBuilder::new(sub.tenant_id, BillingEventType::SubscriptionExpired)
                    .data(serde_json::json!({
                        "subscription_id": sub.id,
                        "retry_count": sub.retry_count,
                    })),
            )
            .await;
            sub
        };

        // Outside the lock: stop any provider-side recurring schedule so the
        // tenant is not charged for a dead subscription.
        if let Some(external_ref) = expired.gateway_subscription_ref {
            if let Some(gateway) = self.gateways.primary() {
                if let Err(e) = gateway.cancel_recurring(&external_ref).await {
                    tracing::warn!(
                        subscription_id = %expired.id,
                        error = %e,
                        "failed to cancel recurring schedule for expired subscription"
                    );
                }
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Tenant-driven operations
    // =========================================================================

    /// Cancel the tenant's subscription, immediately or at period end.
    ///
    /// The provider-side recurring schedule is canceled first, before any
    /// local state changes; if that call fails the whole operation fails and
    /// the caller retries, so no orphaned recurring charge can survive a
    /// "successful" cancellation.
    pub async fn request_cancellation(
        &self,
        tenant_id: TenantId,
        immediate: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let sub = self.require_current(tenant_id).await?;
        if !sub.status.is_live() {
            return Err(BillingError::StateConflict(format!(
                "cannot cancel a {} subscription",
                sub.status
            )));
        }

        // Long network call happens before taking the subscription lock.
        if let Some(external_ref) = &sub.gateway_subscription_ref {
            let gateway = self.select_gateway(None)?;
            gateway.cancel_recurring(external_ref).await?;
        }

        let _guard = self.locks.acquire(sub.id).await;
        let mut sub = self.require_sub(sub.id).await?;
        if !sub.status.is_live() {
            return Err(BillingError::StateConflict(format!(
                "cannot cancel a {} subscription",
                sub.status
            )));
        }

        sub.gateway_subscription_ref = None;
        if immediate {
            sub.status = SubscriptionStatus::Canceled;
            sub.canceled_at = Some(now);
            sub.cancel_at_period_end = false;
        } else {
            sub.cancel_at_period_end = true;
        }
        self.persist(&mut sub, now).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %sub.id,
            immediate = immediate,
            "cancellation requested"
        );
        let event_type = if immediate {
            BillingEventType::SubscriptionCanceled
        } else {
            BillingEventType::CancellationScheduled
        };
        self.log_event(
            BillingEventBuilder::new(tenant_id, event_type)
                .data(serde_json::json!({
                    "subscription_id": sub.id,
                    "immediate": immediate,
                    "effective_at": if immediate {
                        now.to_string()
                    } else {
                        sub.current_period_end.to_string()
                    },
                }))
                .actor_type(ActorType::Tenant),
        )
        .await;

        Ok(sub)
    }

    /// Reactivate a subscription: undo a not-yet-effective end-of-period
    /// cancellation, or open a fresh billing cycle on a fully canceled one
    /// via a new charge.
    pub async fn reactivate(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let sub = self.require_current(tenant_id).await?;

        if sub.status.is_live() && sub.cancel_at_period_end {
            // Undo path: the cancellation has not taken effect yet.
            let updated = {
                let _guard = self.locks.acquire(sub.id).await;
                let mut sub = self.require_sub(sub.id).await?;
                sub.cancel_at_period_end = false;
                self.persist(&mut sub, now).await?;
                sub
            };
            self.log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::SubscriptionReactivated)
                    .data(serde_json::json!({
                        "subscription_id": updated.id,
                        "undo": true,
                    }))
                    .actor_type(ActorType::Tenant),
            )
            .await;
            self.ensure_recurring(updated.id, now).await;
            return self.require_sub(updated.id).await;
        }

        match sub.status {
            SubscriptionStatus::Canceled => {
                let token = sub
                    .payment_method_token
                    .clone()
                    .map(PaymentMethodToken)
                    .ok_or(BillingError::InvalidPaymentMethod)?;
                let gateway = self.select_gateway(None)?;
                let price = self.price_for_sub(&sub)?;

                // Fresh cycle keyed to "now", distinct from any boundary of
                // the canceled cycle.
                let key = sub.boundary_idempotency_key(now);
                match self.claim_attempt(&sub, &key, &price, now).await? {
                    AttemptClaim::Claimed(_) => {}
                    AttemptClaim::InFlight(_) | AttemptClaim::Settled(_) => {
                        return Err(BillingError::StateConflict(
                            "reactivation already in progress".to_string(),
                        ));
                    }
                }

                match self
                    .gateway_charge(&gateway, &token, price.amount_cents, price.currency, &key)
                    .await
                {
                    Ok(charge) if charge.status == ChargeStatus::Succeeded => {
                        self.apply_charge_outcome(
                            sub.id,
                            &key,
                            ChargeOutcomeReport::Succeeded,
                            ActorType::Tenant,
                            None,
                            now,
                        )
                        .await?;
                        self.ensure_recurring(sub.id, now).await;
                        self.require_sub(sub.id).await
                    }
                    Ok(_) => Err(BillingError::TransientGateway(
                        "reactivation charge is awaiting settlement".to_string(),
                    )),
                    Err(e) => {
                        self.store
                            .attempts
                            .record_outcome(&key, AttemptOutcome::Failed, Some(&e.to_string()))
                            .await?;
                        Err(e.into())
                    }
                }
            }
            SubscriptionStatus::Expired => Err(BillingError::StateConflict(
                "subscription expired past the reactivation window; start a new signup".to_string(),
            )),
            _ => Err(BillingError::StateConflict(
                "subscription has no pending or effective cancellation to undo".to_string(),
            )),
        }
    }

    /// Change the plan on the current subscription.
    ///
    /// Replaces the plan reference in place: status and period are
    /// untouched, nothing is charged or refunded (proration is out of
    /// scope), and entitlements follow the new plan immediately.
    pub async fn change_plan(
        &self,
        tenant_id: TenantId,
        new_plan_id: &PlanId,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let new_plan = self
            .catalog
            .get_plan(new_plan_id)
            .ok_or_else(|| BillingError::NotFound(format!("plan '{}'", new_plan_id)))?;
        if !new_plan.is_active {
            return Err(BillingError::StateConflict(format!(
                "plan '{}' is no longer offered",
                new_plan_id
            )));
        }

        let sub = self.require_current(tenant_id).await?;
        if !sub.status.is_live() {
            return Err(BillingError::StateConflict(format!(
                "cannot change plan on a {} subscription",
                sub.status
            )));
        }
        if &sub.plan_id == new_plan_id {
            return Err(BillingError::InvalidInput(format!(
                "subscription is already on plan '{}'",
                new_plan_id
            )));
        }

        let updated = {
            let _guard = self.locks.acquire(sub.id).await;
            let mut sub = self.require_sub(sub.id).await?;
            let from_plan = sub.plan_id.clone();
            sub.plan_id = new_plan_id.clone();
            self.persist(&mut sub, now).await?;

            tracing::info!(
                tenant_id = %tenant_id,
                subscription_id = %sub.id,
                from_plan = %from_plan,
                to_plan = %new_plan_id,
                "plan changed"
            );
            self.log_event(
                BillingEventBuilder::new(tenant_id, BillingEventType::PlanChanged)
                    .data(serde_json::json!({
                        "subscription_id": sub.id,
                        "from_plan": from_plan,
                        "to_plan": new_plan_id,
                    }))
                    .actor_type(ActorType::Tenant),
            )
            .await;
            sub
        };

        // Re-point the provider recurring schedule at the new amount.
        self.refresh_recurring(updated.id, now).await;
        self.require_sub(updated.id).await
    }

    /// Administrative re-sync: push the current catalog price for the
    /// subscription's plan back to the provider-side recurring schedule.
    pub async fn resync_plan(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let sub = self.require_current(tenant_id).await?;
        self.refresh_recurring(sub.id, now).await;
        self.log_event(
            BillingEventBuilder::new(tenant_id, BillingEventType::PlanResynced)
                .data(serde_json::json!({ "subscription_id": sub.id }))
                .actor_type(ActorType::Admin),
        )
        .await;
        Ok(())
    }

    // =========================================================================
    // Provider-initiated transitions (webhook processor)
    // =========================================================================

    /// The provider canceled the recurring schedule on its side. Access runs
    /// to the end of the paid period, then the boundary pass finalizes the
    /// cancellation with no further charge.
    pub async fn handle_provider_recurring_canceled(
        &self,
        subscription_id: SubscriptionId,
        gateway_event_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let _guard = self.locks.acquire(subscription_id).await;
        let mut sub = self.require_sub(subscription_id).await?;
        if !sub.status.is_live() {
            return Ok(());
        }

        sub.cancel_at_period_end = true;
        sub.gateway_subscription_ref = None;
        self.persist(&mut sub, now).await?;

        tracing::warn!(
            subscription_id = %sub.id,
            tenant_id = %sub.tenant_id,
            "recurring schedule canceled by provider"
        );
        self.log_event(
            BillingEventBuilder::new(
                sub.tenant_id,
                BillingEventType::RecurringCanceledByProvider,
            )
            .data(serde_json::json!({
                "subscription_id": sub.id,
                "effective_at": sub.current_period_end.to_string(),
            }))
            .actor_type(ActorType::Gateway)
            .gateway_event(gateway_event_id),
        )
        .await;
        Ok(())
    }

    /// A dispute was opened on a settled charge. The provider pulls the
    /// funds, so the subscription is treated like a failed payment.
    pub async fn handle_dispute_opened(
        &self,
        subscription_id: SubscriptionId,
        gateway_event_id: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let _guard = self.locks.acquire(subscription_id).await;
        let mut sub = self.require_sub(subscription_id).await?;

        self.log_event(
            BillingEventBuilder::new(sub.tenant_id, BillingEventType::ChargeDisputed)
                .data(serde_json::json!({
                    "subscription_id": sub.id,
                    "reason": reason,
                }))
                .actor_type(ActorType::Gateway)
                .gateway_event(gateway_event_id),
        )
        .await;

        if matches!(
            sub.status,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active
        ) {
            sub.status = SubscriptionStatus::PastDue;
            sub.past_due_since = Some(now);
            sub.retry_count = 1;
            self.persist(&mut sub, now).await?;
            tracing::warn!(
                subscription_id = %sub.id,
                reason = %reason,
                "dispute opened; subscription past due"
            );
        }
        Ok(())
    }

    // =========================================================================
    // Provider recurring schedule upkeep (best-effort)
    // =========================================================================

    /// Make sure an active subscription with a stored token has a
    /// provider-side recurring schedule. Best-effort: the scheduler covers
    /// renewals regardless.
    async fn ensure_recurring(&self, subscription_id: SubscriptionId, now: OffsetDateTime) {
        if let Err(e) = self.try_refresh_recurring(subscription_id, false, now).await {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %e,
                "failed to ensure recurring schedule"
            );
        }
    }

    async fn refresh_recurring(&self, subscription_id: SubscriptionId, now: OffsetDateTime) {
        if let Err(e) = self.try_refresh_recurring(subscription_id, true, now).await {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %e,
                "failed to refresh recurring schedule"
            );
        }
    }

    async fn try_refresh_recurring(
        &self,
        subscription_id: SubscriptionId,
        replace_existing: bool,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let sub = self.require_sub(subscription_id).await?;
        if sub.status != SubscriptionStatus::Active || sub.cancel_at_period_end {
            return Ok(());
        }
        let Some(token) = sub.payment_method_token.clone().map(PaymentMethodToken) else {
            return Ok(());
        };
        let Some(gateway) = self.gateways.primary() else {
            return Ok(());
        };
        if sub.gateway_subscription_ref.is_some() && !replace_existing {
            return Ok(());
        }

        if let Some(old_ref) = &sub.gateway_subscription_ref {
            gateway.cancel_recurring(old_ref).await?;
        }

        let price = self.price_for_sub(&sub)?;
        let terms = RecurringTerms {
            plan_id: sub.plan_id.clone(),
            amount_cents: price.amount_cents,
            currency: price.currency.to_string(),
            interval_days: BILLING_CYCLE_DAYS as u32,
        };
        let key = format!(
            "sub-{}-recurring-{}",
            sub.id,
            sub.current_period_start.unix_timestamp()
        );
        let external_ref = gateway.create_recurring(&token, &terms, &key).await?;

        let _guard = self.locks.acquire(subscription_id).await;
        let mut sub = self.require_sub(subscription_id).await?;
        sub.gateway_subscription_ref = Some(external_ref);
        self.persist(&mut sub, now).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn require_sub(&self, id: SubscriptionId) -> BillingResult<Subscription> {
        self.store
            .subscriptions
            .get(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))
    }

    async fn require_current(&self, tenant_id: TenantId) -> BillingResult<Subscription> {
        self.store
            .subscriptions
            .current_for_tenant(tenant_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("no subscription for tenant {}", tenant_id))
            })
    }

    fn price_for_sub(&self, sub: &Subscription) -> BillingResult<PlanPrice> {
        self.catalog.price_for(&sub.plan_id, sub.region_tier)
    }

    /// Optimistic write with version bump. Callers hold the subscription
    /// lock, so a conflict here means an out-of-band writer and is an error.
    async fn persist(&self, sub: &mut Subscription, now: OffsetDateTime) -> BillingResult<()> {
        let expected = sub.version;
        sub.version += 1;
        sub.updated_at = now;
        self.store.subscriptions.update(sub, expected).await
    }

    /// Finalize an end-of-period cancellation at its boundary. Called with
    /// the subscription lock held.
    async fn finalize_scheduled_cancel(
        &self,
        mut sub: Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        sub.status = SubscriptionStatus::Canceled;
        sub.canceled_at = Some(now);
        self.persist(&mut sub, now).await?;
        tracing::info!(
            subscription_id = %sub.id,
            tenant_id = %sub.tenant_id,
            "end-of-period cancellation took effect"
        );
        self.log_event(
            BillingEventBuilder::new(sub.tenant_id, BillingEventType::SubscriptionCanceled)
                .data(serde_json::json!({
                    "subscription_id": sub.id,
                    "immediate": false,
                })),
        )
        .await;
        Ok(())
    }
}
