//! Entitlement resolver
//!
//! Answers "can this tenant use capability X" and "what is limit Y" from the
//! tenant's current subscription and its plan snapshot. This sits on the hot
//! path of every gated request: one store read, no locks, no network, and a
//! pure decision function so the rules are testable in isolation.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use tably_shared::{Capability, LimitName, LimitValue, PlanId, TenantId};

use crate::catalog::{PlanCatalog, PricingPlan};
use crate::error::BillingResult;
use crate::store::SubscriptionStore;
use crate::subscription::{Subscription, SubscriptionStatus};

/// Unified entitlement state, answering "why is access granted or not".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    /// Trial period active
    Trialing,
    /// Subscription active and in good standing
    Active,
    /// Payment past due but inside the grace window
    PastDueGrace,
    /// Payment past due and grace window exhausted
    PastDueLocked,
    /// Subscription canceled, access revoked
    Canceled,
    /// Subscription expired after failed retries
    Expired,
    /// Tenant has no subscription at all
    NoSubscription,
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntitlementState::Trialing => "trialing",
            EntitlementState::Active => "active",
            EntitlementState::PastDueGrace => "past_due_grace",
            EntitlementState::PastDueLocked => "past_due_locked",
            EntitlementState::Canceled => "canceled",
            EntitlementState::Expired => "expired",
            EntitlementState::NoSubscription => "no_subscription",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of what a tenant can do right now.
///
/// Carries the plan snapshot as of the lookup, so capability answers stay
/// consistent even if the catalog is edited mid-request.
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub state: EntitlementState,
    pub plan_id: Option<PlanId>,
    plan: Option<PricingPlan>,
    /// Whether any capability can be granted at all.
    pub entitled: bool,
    /// When the current entitlement lapses, if a lapse is already scheduled.
    pub expires_at: Option<OffsetDateTime>,
    pub computed_at: OffsetDateTime,
    /// Human-readable reason when access is blocked.
    pub blocked_reason: Option<String>,
}

impl Entitlement {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.entitled
            && self
                .plan
                .as_ref()
                .is_some_and(|plan| plan.has_capability(cap))
    }

    pub fn limit_for(&self, limit: LimitName) -> LimitValue {
        if !self.entitled {
            return LimitValue::ZERO;
        }
        self.plan
            .as_ref()
            .map(|plan| plan.limit_for(limit))
            .unwrap_or(LimitValue::ZERO)
    }
}

#[derive(Clone)]
pub struct EntitlementResolver {
    subscriptions: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
    grace: Duration,
}

impl EntitlementResolver {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        catalog: Arc<PlanCatalog>,
        grace: Duration,
    ) -> Self {
        Self {
            subscriptions,
            catalog,
            grace,
        }
    }

    /// Full entitlement view for a tenant.
    pub async fn entitlement(&self, tenant: TenantId) -> BillingResult<Entitlement> {
        let sub = self.subscriptions.current_for_tenant(tenant).await?;
        Ok(Self::compute_from_raw(
            sub.as_ref(),
            &self.catalog,
            self.grace,
            OffsetDateTime::now_utc(),
        ))
    }

    pub async fn has_capability(&self, tenant: TenantId, cap: Capability) -> BillingResult<bool> {
        Ok(self.entitlement(tenant).await?.has_capability(cap))
    }

    pub async fn limit_for(&self, tenant: TenantId, limit: LimitName) -> BillingResult<LimitValue> {
        Ok(self.entitlement(tenant).await?.limit_for(limit))
    }

    /// Pure decision function. Same inputs always produce the same output,
    /// and the unentitled states return false/zero regardless of what the
    /// plan itself defines.
    pub fn compute_from_raw(
        sub: Option<&Subscription>,
        catalog: &PlanCatalog,
        grace: Duration,
        now: OffsetDateTime,
    ) -> Entitlement {
        let Some(sub) = sub else {
            return Entitlement {
                state: EntitlementState::NoSubscription,
                plan_id: None,
                plan: None,
                entitled: false,
                expires_at: None,
                computed_at: now,
                blocked_reason: Some("no subscription".to_string()),
            };
        };

        let plan = catalog.get_plan(&sub.plan_id).cloned();
        let (state, entitled, expires_at, blocked_reason) = match sub.status {
            SubscriptionStatus::Trialing => {
                (EntitlementState::Trialing, true, sub.trial_end, None)
            }
            SubscriptionStatus::Active => {
                let expires = sub
                    .cancel_at_period_end
                    .then_some(sub.current_period_end);
                (EntitlementState::Active, true, expires, None)
            }
            SubscriptionStatus::PastDue => {
                // Entitled only while the grace window is open.
                let grace_end = sub.past_due_since.map(|since| since + grace);
                match grace_end {
                    Some(end) if end > now => (
                        EntitlementState::PastDueGrace,
                        true,
                        Some(end),
                        Some("payment past due, please update your payment method".to_string()),
                    ),
                    _ => (
                        EntitlementState::PastDueLocked,
                        false,
                        None,
                        Some("payment past due and grace period over".to_string()),
                    ),
                }
            }
            SubscriptionStatus::Canceled => (
                EntitlementState::Canceled,
                false,
                None,
                Some("subscription canceled".to_string()),
            ),
            SubscriptionStatus::Expired => (
                EntitlementState::Expired,
                false,
                None,
                Some("subscription expired after failed payment".to_string()),
            ),
        };

        Entitlement {
            state,
            plan_id: Some(sub.plan_id.clone()),
            plan,
            entitled,
            expires_at,
            computed_at: now,
            blocked_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::ConsentRecord;
    use tably_shared::PlanId;

    fn consent() -> ConsentRecord {
        ConsentRecord {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            source_ip: "192.0.2.1".to_string(),
            terms_version: "2025-06".to_string(),
        }
    }

    fn paid_sub(now: OffsetDateTime) -> Subscription {
        Subscription::new_paid(
            TenantId::new(),
            PlanId::from("growth"),
            tably_shared::RegionTier::Tier1,
            &consent(),
            "tok_1".to_string(),
            now,
        )
    }

    #[test]
    fn test_active_subscription_grants_plan_capabilities() {
        let catalog = PlanCatalog::standard();
        let now = OffsetDateTime::UNIX_EPOCH;
        let sub = paid_sub(now);

        let ent =
            EntitlementResolver::compute_from_raw(Some(&sub), &catalog, Duration::days(7), now);
        assert_eq!(ent.state, EntitlementState::Active);
        assert!(ent.has_capability(Capability::KitchenDisplay));
        // Growth does not include custom branding.
        assert!(!ent.has_capability(Capability::CustomBranding));
        assert_eq!(
            ent.limit_for(LimitName::MaxTables),
            LimitValue::Count(60)
        );
    }

    #[test]
    fn test_expired_subscription_grants_nothing() {
        let catalog = PlanCatalog::standard();
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut sub = paid_sub(now);
        sub.status = SubscriptionStatus::Expired;

        let ent =
            EntitlementResolver::compute_from_raw(Some(&sub), &catalog, Duration::days(7), now);
        assert_eq!(ent.state, EntitlementState::Expired);
        // The plan still defines these capabilities; the state overrides.
        for cap in Capability::ALL {
            assert!(!ent.has_capability(cap));
        }
        for limit in LimitName::ALL {
            assert_eq!(ent.limit_for(limit), LimitValue::ZERO);
        }
    }

    #[test]
    fn test_past_due_entitled_only_within_grace() {
        let catalog = PlanCatalog::standard();
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut sub = paid_sub(now);
        sub.status = SubscriptionStatus::PastDue;
        sub.past_due_since = Some(now);

        let grace = Duration::days(7);
        let inside =
            EntitlementResolver::compute_from_raw(Some(&sub), &catalog, grace, now + Duration::days(3));
        assert_eq!(inside.state, EntitlementState::PastDueGrace);
        assert!(inside.has_capability(Capability::QrMenus));

        let outside =
            EntitlementResolver::compute_from_raw(Some(&sub), &catalog, grace, now + Duration::days(8));
        assert_eq!(outside.state, EntitlementState::PastDueLocked);
        assert!(!outside.has_capability(Capability::QrMenus));
    }

    #[test]
    fn test_no_subscription() {
        let catalog = PlanCatalog::standard();
        let now = OffsetDateTime::UNIX_EPOCH;
        let ent = EntitlementResolver::compute_from_raw(None, &catalog, Duration::days(7), now);
        assert_eq!(ent.state, EntitlementState::NoSubscription);
        assert!(!ent.has_capability(Capability::QrMenus));
    }

    #[test]
    fn test_trialing_entitled_with_expiry() {
        let catalog = PlanCatalog::standard();
        let now = OffsetDateTime::UNIX_EPOCH;
        let sub = Subscription::new_trial(
            TenantId::new(),
            PlanId::from("starter"),
            tably_shared::RegionTier::Tier1,
            14,
            &consent(),
            None,
            now,
        );
        let ent =
            EntitlementResolver::compute_from_raw(Some(&sub), &catalog, Duration::days(7), now);
        assert_eq!(ent.state, EntitlementState::Trialing);
        assert!(ent.has_capability(Capability::OnlineOrdering));
        assert_eq!(ent.expires_at, sub.trial_end);
    }
}
