//! Postgres store implementation
//!
//! Runtime sqlx queries throughout. The attempt and webhook-event claims use
//! INSERT .. ON CONFLICT .. RETURNING so exactly one concurrent worker gets
//! processing rights, with a stale-claim takeover window for crashed workers.

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use tably_shared::{SubscriptionId, TenantId};

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::subscription::Subscription;

use super::{
    AttemptClaim, AttemptOutcome, AttemptStore, BillingAttempt, EventStore, SubscriptionStore,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Apply the billing schema migrations.
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn insert(&self, sub: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, tenant_id, plan_id, region_tier, status,
                trial_start, trial_end, current_period_start, current_period_end,
                payment_method_token, gateway_subscription_ref,
                cancel_at_period_end, canceled_at, past_due_since, retry_count,
                consent_timestamp, consent_source_ip, terms_version,
                version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(sub.id)
        .bind(sub.tenant_id)
        .bind(&sub.plan_id)
        .bind(sub.region_tier)
        .bind(sub.status)
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(&sub.payment_method_token)
        .bind(&sub.gateway_subscription_ref)
        .bind(sub.cancel_at_period_end)
        .bind(sub.canceled_at)
        .bind(sub.past_due_since)
        .bind(sub.retry_count)
        .bind(sub.consent_timestamp)
        .bind(&sub.consent_source_ip)
        .bind(&sub.terms_version)
        .bind(sub.version)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn current_for_tenant(&self, tenant: TenantId) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn get_by_gateway_ref(&self, external_ref: &str) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE gateway_subscription_ref = $1",
        )
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn update(&self, sub: &Subscription, expected_version: i64) -> BillingResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_id = $1,
                status = $2,
                trial_start = $3,
                trial_end = $4,
                current_period_start = $5,
                current_period_end = $6,
                payment_method_token = $7,
                gateway_subscription_ref = $8,
                cancel_at_period_end = $9,
                canceled_at = $10,
                past_due_since = $11,
                retry_count = $12,
                version = $13,
                updated_at = $14
            WHERE id = $15 AND version = $16
            "#,
        )
        .bind(&sub.plan_id)
        .bind(sub.status)
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(&sub.payment_method_token)
        .bind(&sub.gateway_subscription_ref)
        .bind(sub.cancel_at_period_end)
        .bind(sub.canceled_at)
        .bind(sub.past_due_since)
        .bind(sub.retry_count)
        .bind(sub.version)
        .bind(sub.updated_at)
        .bind(sub.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM subscriptions WHERE id = $1")
                    .bind(sub.id)
                    .fetch_optional(&self.pool)
                    .await?;
            return match exists {
                Some((found,)) => Err(BillingError::ConcurrentModification(format!(
                    "subscription {} moved from version {} to {}",
                    sub.id, expected_version, found
                ))),
                None => Err(BillingError::NotFound(format!("subscription {}", sub.id))),
            };
        }
        Ok(())
    }

    async fn list_due(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE (status = 'trialing' AND COALESCE(trial_end, current_period_end) <= $1)
               OR (status = 'active' AND current_period_end <= $1)
            ORDER BY current_period_end
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn list_past_due(&self) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE status = 'past_due' ORDER BY past_due_since",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn list_all(&self) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions")
            .fetch_all(&self.pool)
            .await?;
        Ok(subs)
    }

    async fn trial_used(&self, tenant: TenantId) -> BillingResult<bool> {
        let used: Option<(TenantId,)> =
            sqlx::query_as("SELECT tenant_id FROM trial_grants WHERE tenant_id = $1")
                .bind(tenant)
                .fetch_optional(&self.pool)
                .await?;
        Ok(used.is_some())
    }

    async fn mark_trial_used(&self, tenant: TenantId) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO trial_grants (tenant_id, used_at) VALUES ($1, NOW()) ON CONFLICT DO NOTHING",
        )
        .bind(tenant)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn claim(
        &self,
        attempt: &BillingAttempt,
        stale_after: Duration,
        now: OffsetDateTime,
    ) -> BillingResult<AttemptClaim> {
        let stale_cutoff = now - stale_after;

        // Atomic claim: the insert wins for a fresh key; the conditional
        // update wins only for a pending claim past the stale window.
        let claimed: Option<(uuid::Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_attempts
                (id, subscription_id, idempotency_key, amount_cents, currency,
                 outcome, failure_reason, attempted_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', NULL, $6)
            ON CONFLICT (idempotency_key) DO UPDATE SET attempted_at = $6
            WHERE billing_attempts.outcome = 'pending'
              AND billing_attempts.attempted_at <= $7
            RETURNING id
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.subscription_id)
        .bind(&attempt.idempotency_key)
        .bind(attempt.amount_cents)
        .bind(&attempt.currency)
        .bind(now)
        .bind(stale_cutoff)
        .fetch_optional(&self.pool)
        .await?;

        let stored = self
            .get_by_key(&attempt.idempotency_key)
            .await?
            .ok_or_else(|| {
                BillingError::Database(format!(
                    "attempt '{}' vanished after claim",
                    attempt.idempotency_key
                ))
            })?;

        if claimed.is_some() {
            return Ok(AttemptClaim::Claimed(stored));
        }
        if stored.outcome.is_terminal() {
            Ok(AttemptClaim::Settled(stored))
        } else {
            Ok(AttemptClaim::InFlight(stored))
        }
    }

    async fn record_outcome(
        &self,
        idempotency_key: &str,
        outcome: AttemptOutcome,
        failure_reason: Option<&str>,
    ) -> BillingResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE billing_attempts
            SET outcome = $1, failure_reason = $2
            WHERE idempotency_key = $3
            "#,
        )
        .bind(outcome)
        .bind(failure_reason)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BillingError::NotFound(format!(
                "attempt '{}'",
                idempotency_key
            )));
        }
        Ok(())
    }

    async fn get_by_key(&self, idempotency_key: &str) -> BillingResult<Option<BillingAttempt>> {
        let attempt = sqlx::query_as::<_, BillingAttempt>(
            "SELECT * FROM billing_attempts WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempt)
    }

    async fn list_for_subscription(
        &self,
        id: SubscriptionId,
    ) -> BillingResult<Vec<BillingAttempt>> {
        let attempts = sqlx::query_as::<_, BillingAttempt>(
            "SELECT * FROM billing_attempts WHERE subscription_id = $1 ORDER BY attempted_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn append(&self, event: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (id, tenant_id, event_type, data, actor_type, gateway_event_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(event.event_type)
        .bind(&event.data)
        .bind(event.actor_type)
        .bind(&event.gateway_event_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_tenant(
        &self,
        tenant: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events = sqlx::query_as::<_, BillingEvent>(
            r#"
            SELECT * FROM billing_events
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        stale_after: Duration,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let stale_cutoff = now - stale_after;

        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', $4)
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = $4,
                error_message = 'recovered from stuck state'
            WHERE gateway_webhook_events.processing_result = 'processing'
              AND gateway_webhook_events.processing_started_at <= $5
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(now)
        .bind(stale_cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE gateway_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE event_id = $3
            "#,
        )
        .bind(result)
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let rows = sqlx::query("DELETE FROM gateway_webhook_events WHERE event_timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }
}
