//! Billing invariants
//!
//! Runnable consistency checks for the billing system, intended to be run
//! after mutations, webhook replays, or on a schedule from the worker.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real query over the stores
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use tably_shared::TenantId;

use crate::error::BillingResult;
use crate::store::{AttemptOutcome, Store};
use crate::subscription::SubscriptionStatus;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: &'static str,
    /// Tenant(s) affected
    pub tenant_ids: Vec<TenantId>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Critical - the system may be charging incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Store,
}

impl InvariantChecker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self, now: OffsetDateTime) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_single_live_subscription().await?);
        violations.extend(self.check_status_fields_consistent().await?);
        violations.extend(self.check_trial_cancel_never_charged().await?);
        violations.extend(self.check_no_stuck_pending_attempts(now).await?);

        let checks_run = 4;
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one live subscription per tenant.
    ///
    /// Two live subscriptions would double-bill and confuse entitlements.
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let subs = self.store.subscriptions.list_all().await?;
        let mut live_counts: std::collections::HashMap<TenantId, usize> =
            std::collections::HashMap::new();
        for sub in &subs {
            if sub.status.is_live() {
                *live_counts.entry(sub.tenant_id).or_insert(0) += 1;
            }
        }

        Ok(live_counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(tenant_id, count)| InvariantViolation {
                invariant: "single_live_subscription",
                tenant_ids: vec![tenant_id],
                description: format!("tenant has {} live subscriptions (expected 1)", count),
                context: serde_json::json!({ "live_count": count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: status and its companion fields are mutually consistent.
    ///
    /// Canceled implies canceled_at or a pending period-end cancel took
    /// effect; past_due implies past_due_since; trialing implies trial_end.
    async fn check_status_fields_consistent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let subs = self.store.subscriptions.list_all().await?;
        let mut violations = Vec::new();

        for sub in subs {
            let problem = match sub.status {
                SubscriptionStatus::Trialing if sub.trial_end.is_none() => {
                    Some("trialing subscription has no trial_end")
                }
                SubscriptionStatus::PastDue if sub.past_due_since.is_none() => {
                    Some("past_due subscription has no past_due_since")
                }
                SubscriptionStatus::Canceled if sub.canceled_at.is_none() => {
                    Some("canceled subscription has no canceled_at")
                }
                _ => None,
            };
            if let Some(problem) = problem {
                violations.push(InvariantViolation {
                    invariant: "status_fields_consistent",
                    tenant_ids: vec![sub.tenant_id],
                    description: problem.to_string(),
                    context: serde_json::json!({
                        "subscription_id": sub.id,
                        "status": sub.status,
                    }),
                    severity: ViolationSeverity::High,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 3: a subscription canceled during its trial has zero
    /// charged amount. This is the hard "trial cancel never bills" rule.
    async fn check_trial_cancel_never_charged(&self) -> BillingResult<Vec<InvariantViolation>> {
        let subs = self.store.subscriptions.list_all().await?;
        let mut violations = Vec::new();

        for sub in subs {
            if sub.status != SubscriptionStatus::Canceled || sub.converted_to_paid() {
                continue;
            }
            let attempts = self.store.attempts.list_for_subscription(sub.id).await?;
            let charged: i64 = attempts
                .iter()
                .filter(|a| a.outcome == AttemptOutcome::Succeeded)
                .map(|a| a.amount_cents)
                .sum();
            if charged > 0 {
                violations.push(InvariantViolation {
                    invariant: "trial_cancel_never_charged",
                    tenant_ids: vec![sub.tenant_id],
                    description: format!(
                        "subscription canceled during trial was charged {} cents",
                        charged
                    ),
                    context: serde_json::json!({
                        "subscription_id": sub.id,
                        "charged_cents": charged,
                    }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 4: no billing attempt sits pending for more than a day.
    ///
    /// Long-pending attempts mean a worker died and nothing reclaimed the
    /// key, or a settlement webhook never arrived.
    async fn check_no_stuck_pending_attempts(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let subs = self.store.subscriptions.list_all().await?;
        let mut violations = Vec::new();

        for sub in subs {
            let attempts = self.store.attempts.list_for_subscription(sub.id).await?;
            for attempt in attempts {
                if attempt.outcome == AttemptOutcome::Pending
                    && attempt.attempted_at + Duration::days(1) <= now
                {
                    violations.push(InvariantViolation {
                        invariant: "no_stuck_pending_attempts",
                        tenant_ids: vec![sub.tenant_id],
                        description: format!(
                            "attempt '{}' pending since {}",
                            attempt.idempotency_key, attempt.attempted_at
                        ),
                        context: serde_json::json!({
                            "subscription_id": sub.id,
                            "idempotency_key": attempt.idempotency_key,
                        }),
                        severity: ViolationSeverity::Medium,
                    });
                }
            }
        }
        Ok(violations)
    }

    /// Run a single invariant check by name.
    pub async fn run_check(
        &self,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_live_subscription" => self.check_single_live_subscription().await,
            "status_fields_consistent" => self.check_status_fields_consistent().await,
            "trial_cancel_never_charged" => self.check_trial_cancel_never_charged().await,
            "no_stuck_pending_attempts" => self.check_no_stuck_pending_attempts(now).await,
            _ => Ok(vec![]),
        }
    }

    /// Names of all available invariant checks.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_live_subscription",
            "status_fields_consistent",
            "trial_cancel_never_charged",
            "no_stuck_pending_attempts",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{ConsentRecord, Subscription};
    use tably_shared::{PlanId, RegionTier};

    fn consent() -> ConsentRecord {
        ConsentRecord {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            source_ip: "192.0.2.7".to_string(),
            terms_version: "2025-06".to_string(),
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"single_live_subscription"));
        assert!(checks.contains(&"trial_cancel_never_charged"));
    }

    #[tokio::test]
    async fn test_healthy_store_passes() {
        let store = Store::in_memory();
        let now = OffsetDateTime::UNIX_EPOCH;
        let sub = Subscription::new_trial(
            tably_shared::TenantId::new(),
            PlanId::from("starter"),
            RegionTier::Tier1,
            14,
            &consent(),
            None,
            now,
        );
        store.subscriptions.insert(&sub).await.unwrap();

        let checker = InvariantChecker::new(store);
        let summary = checker.run_all_checks(now).await.unwrap();
        assert!(summary.healthy, "violations: {:?}", summary.violations);
        assert_eq!(summary.checks_run, 4);
    }

    #[tokio::test]
    async fn test_detects_inconsistent_status_fields() {
        let store = Store::in_memory();
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut sub = Subscription::new_paid(
            tably_shared::TenantId::new(),
            PlanId::from("growth"),
            RegionTier::Tier1,
            &consent(),
            "tok_1".to_string(),
            now,
        );
        sub.status = crate::subscription::SubscriptionStatus::PastDue;
        // past_due_since deliberately left unset
        store.subscriptions.insert(&sub).await.unwrap();

        let checker = InvariantChecker::new(store);
        let summary = checker.run_all_checks(now).await.unwrap();
        assert!(!summary.healthy);
        assert!(summary
            .violations
            .iter()
            .any(|v| v.invariant == "status_fields_consistent"));
    }
}
