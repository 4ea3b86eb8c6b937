//! Billing scheduler
//!
//! The time-driven half of the lifecycle: finds subscriptions whose trial or
//! billing period has ended and drives the lifecycle manager's
//! charge-and-transition operation exactly once per due boundary, then walks
//! past-due subscriptions through their retry schedule and expires the
//! exhausted ones.
//!
//! Every decision is derived from persisted state and idempotency keys, so a
//! tick is safe to re-run, to overlap with a slow previous tick, and to
//! resume after a crash mid-cycle.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::lifecycle::{ChargeDriveResult, LifecycleManager};

/// Counters for one scheduler tick.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TickSummary {
    pub due_found: usize,
    pub charged: usize,
    pub canceled_at_boundary: usize,
    pub moved_past_due: usize,
    pub pending_settlement: usize,
    pub transient_failures: usize,
    pub skipped_in_flight: usize,
    pub skipped_no_gateway: usize,
    pub retries_attempted: usize,
    pub recovered: usize,
    pub expired: usize,
    pub errors: usize,
}

pub struct BillingScheduler {
    lifecycle: Arc<LifecycleManager>,
}

impl BillingScheduler {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    /// One scheduler pass at time `now`.
    pub async fn tick(&self, now: OffsetDateTime) -> BillingResult<TickSummary> {
        let mut summary = TickSummary::default();

        // Due trial-end and renewal boundaries.
        let due = self.lifecycle.store().subscriptions.list_due(now).await?;
        summary.due_found = due.len();
        for sub in due {
            match self.lifecycle.drive_boundary_charge(sub.id, now).await {
                Ok(result) => Self::count_drive(&mut summary, &result, false),
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        subscription_id = %sub.id,
                        error = %e,
                        "boundary charge failed"
                    );
                }
            }
        }

        // Past-due retry schedule and expiry.
        let past_due = self.lifecycle.store().subscriptions.list_past_due().await?;
        for sub in past_due {
            match self.lifecycle.expire_if_exhausted(sub.id, now).await {
                Ok(true) => {
                    summary.expired += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(subscription_id = %sub.id, error = %e, "expiry check failed");
                    continue;
                }
            }

            match self.lifecycle.drive_retry_charge(sub.id, now).await {
                Ok(ChargeDriveResult::NotDue) => {}
                Ok(result) => {
                    summary.retries_attempted += 1;
                    Self::count_drive(&mut summary, &result, true);
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(subscription_id = %sub.id, error = %e, "retry charge failed");
                }
            }
        }

        tracing::info!(
            due_found = summary.due_found,
            charged = summary.charged,
            canceled_at_boundary = summary.canceled_at_boundary,
            moved_past_due = summary.moved_past_due,
            retries_attempted = summary.retries_attempted,
            recovered = summary.recovered,
            expired = summary.expired,
            errors = summary.errors,
            "billing tick complete"
        );
        Ok(summary)
    }

    fn count_drive(summary: &mut TickSummary, result: &ChargeDriveResult, is_retry: bool) {
        match result {
            ChargeDriveResult::Charged => {
                if is_retry {
                    summary.recovered += 1;
                } else {
                    summary.charged += 1;
                }
            }
            ChargeDriveResult::CanceledAtBoundary => summary.canceled_at_boundary += 1,
            ChargeDriveResult::MovedPastDue { .. } => summary.moved_past_due += 1,
            ChargeDriveResult::PendingSettlement => summary.pending_settlement += 1,
            ChargeDriveResult::TransientFailure { .. } => summary.transient_failures += 1,
            ChargeDriveResult::InFlight | ChargeDriveResult::AlreadySettled => {
                summary.skipped_in_flight += 1
            }
            ChargeDriveResult::SkippedNoGateway => summary.skipped_no_gateway += 1,
            ChargeDriveResult::NotDue => {}
        }
    }
}
