//! Subscription record and state machine
//!
//! The status graph and its pure helpers live here so the transition rules
//! are unit-testable without storage or a gateway. All mutation goes through
//! the lifecycle manager.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tably_shared::{PlanId, RegionTier, SubscriptionId, TenantId};

/// Length of one paid billing cycle.
pub const BILLING_CYCLE_DAYS: i64 = 30;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// States in which the subscription may still grant entitlements.
    /// `PastDue` additionally requires being inside the grace window, which
    /// the resolver checks against `past_due_since`.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }

    /// Whether the state machine permits a direct transition.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, next) {
            (Trialing, Active) | (Trialing, Canceled) | (Trialing, PastDue) => true,
            // Renewal keeps the status and rolls the period.
            (Active, Active) | (Active, PastDue) | (Active, Canceled) => true,
            (PastDue, Active) | (PastDue, Expired) | (PastDue, Canceled) => true,
            // Reactivation: undo of a pending cancel, or a fresh cycle.
            (Canceled, Active) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(format!("unknown subscription status '{}'", other)),
        }
    }
}

/// Signup consent captured at checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub timestamp: OffsetDateTime,
    pub source_ip: String,
    pub terms_version: String,
}

/// A tenant's subscription. Exactly one is current per tenant; plan changes
/// replace `plan_id` in place rather than creating a parallel row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    /// Price bracket locked in at signup; renewals charge this bracket.
    pub region_tier: RegionTier,
    pub status: SubscriptionStatus,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    /// Opaque gateway token; never raw payment credentials.
    pub payment_method_token: Option<String>,
    /// Opaque reference to the provider-side recurring schedule.
    pub gateway_subscription_ref: Option<String>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub past_due_since: Option<OffsetDateTime>,
    pub retry_count: i32,
    pub consent_timestamp: OffsetDateTime,
    pub consent_source_ip: String,
    pub terms_version: String,
    /// Optimistic lock version; bumped on every write.
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// A trialing subscription. The trial window doubles as the initial
    /// billing period; conversion mints a fresh paid cycle.
    pub fn new_trial(
        tenant_id: TenantId,
        plan_id: PlanId,
        region_tier: RegionTier,
        trial_days: u32,
        consent: &ConsentRecord,
        payment_method_token: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        let trial_end = now + Duration::days(i64::from(trial_days));
        Self {
            id: SubscriptionId::new(),
            tenant_id,
            plan_id,
            region_tier,
            status: SubscriptionStatus::Trialing,
            trial_start: Some(now),
            trial_end: Some(trial_end),
            current_period_start: now,
            current_period_end: trial_end,
            payment_method_token,
            gateway_subscription_ref: None,
            cancel_at_period_end: false,
            canceled_at: None,
            past_due_since: None,
            retry_count: 0,
            consent_timestamp: consent.timestamp,
            consent_source_ip: consent.source_ip.clone(),
            terms_version: consent.terms_version.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// A paid subscription. Callers only persist this after the initial
    /// charge succeeded; creation is atomic with the first charge.
    pub fn new_paid(
        tenant_id: TenantId,
        plan_id: PlanId,
        region_tier: RegionTier,
        consent: &ConsentRecord,
        payment_method_token: String,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            tenant_id,
            plan_id,
            region_tier,
            status: SubscriptionStatus::Active,
            trial_start: None,
            trial_end: None,
            current_period_start: now,
            current_period_end: now + Duration::days(BILLING_CYCLE_DAYS),
            payment_method_token: Some(payment_method_token),
            gateway_subscription_ref: None,
            cancel_at_period_end: false,
            canceled_at: None,
            past_due_since: None,
            retry_count: 0,
            consent_timestamp: consent.timestamp,
            consent_source_ip: consent.source_ip.clone(),
            terms_version: consent.terms_version.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// The next boundary at which the scheduler owes this subscription a
    /// charge decision: trial end while trialing, period end while active.
    pub fn next_boundary(&self) -> Option<OffsetDateTime> {
        match self.status {
            SubscriptionStatus::Trialing => self.trial_end.or(Some(self.current_period_end)),
            SubscriptionStatus::Active => Some(self.current_period_end),
            _ => None,
        }
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.next_boundary().is_some_and(|b| b <= now)
    }

    /// Whether the trial ever converted into a paid cycle.
    pub fn converted_to_paid(&self) -> bool {
        match self.trial_end {
            Some(trial_end) => self.current_period_end > trial_end,
            None => true,
        }
    }

    /// Idempotency key for the charge owed at a billing-cycle boundary.
    /// Stable across scheduler re-runs and webhook redelivery, so both
    /// triggers converge on at most one billing attempt.
    pub fn boundary_idempotency_key(&self, boundary: OffsetDateTime) -> String {
        format!("sub-{}-{}", self.id, boundary.unix_timestamp())
    }

    /// Idempotency key for the Nth past-due retry of a boundary charge.
    /// A decline terminates its attempt, so each retry is a distinct key;
    /// transient gateway failures reuse the original key instead.
    pub fn retry_idempotency_key(&self, boundary: OffsetDateTime, retry: i32) -> String {
        format!("sub-{}-{}-r{}", self.id, boundary.unix_timestamp(), retry)
    }

    /// Roll the billing period forward one cycle starting at `from`.
    pub fn next_period(from: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
        (from, from + Duration::days(BILLING_CYCLE_DAYS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consent() -> ConsentRecord {
        ConsentRecord {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            source_ip: "203.0.113.9".to_string(),
            terms_version: "2025-06".to_string(),
        }
    }

    #[test]
    fn test_transition_matrix() {
        use SubscriptionStatus::*;
        assert!(Trialing.can_transition_to(Active));
        assert!(Trialing.can_transition_to(Canceled));
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Expired));
        assert!(Canceled.can_transition_to(Active));

        assert!(!Expired.can_transition_to(Active));
        assert!(!Canceled.can_transition_to(Trialing));
        assert!(!Trialing.can_transition_to(Expired));
    }

    #[test]
    fn test_live_states() {
        assert!(SubscriptionStatus::Trialing.is_live());
        assert!(SubscriptionStatus::Active.is_live());
        assert!(SubscriptionStatus::PastDue.is_live());
        assert!(!SubscriptionStatus::Canceled.is_live());
        assert!(!SubscriptionStatus::Expired.is_live());
    }

    #[test]
    fn test_trial_boundary_and_conversion_flag() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let sub = Subscription::new_trial(
            TenantId::new(),
            PlanId::from("starter"),
            RegionTier::Tier1,
            14,
            &consent(),
            None,
            now,
        );
        assert_eq!(sub.next_boundary(), Some(now + Duration::days(14)));
        assert!(!sub.converted_to_paid());
        assert!(!sub.is_due(now));
        assert!(sub.is_due(now + Duration::days(14)));
    }

    #[test]
    fn test_boundary_key_is_stable() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let sub = Subscription::new_paid(
            TenantId::new(),
            PlanId::from("growth"),
            RegionTier::Tier1,
            &consent(),
            "tok_123".to_string(),
            now,
        );
        let boundary = sub.current_period_end;
        assert_eq!(
            sub.boundary_idempotency_key(boundary),
            sub.boundary_idempotency_key(boundary)
        );
        assert_ne!(
            sub.boundary_idempotency_key(boundary),
            sub.retry_idempotency_key(boundary, 1)
        );
    }
}
