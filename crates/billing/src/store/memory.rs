//! In-memory store implementation
//!
//! Backs tests and ephemeral single-node deployments. Claim operations take
//! a single lock over the relevant map, giving the same at-most-one-claimant
//! behavior the Postgres implementation gets from ON CONFLICT.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use tably_shared::{SubscriptionId, TenantId};

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::subscription::Subscription;

use super::{
    AttemptClaim, AttemptOutcome, AttemptStore, BillingAttempt, EventStore, SubscriptionStore,
    WebhookEventRecord,
};

#[derive(Default)]
pub struct MemoryStore {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    trial_grants: Mutex<HashSet<TenantId>>,
    attempts: Mutex<HashMap<String, BillingAttempt>>,
    events: Mutex<Vec<BillingEvent>>,
    webhook_events: Mutex<HashMap<String, WebhookEventRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn insert(&self, sub: &Subscription) -> BillingResult<()> {
        let mut subs = self.subscriptions.lock().await;
        if subs.contains_key(&sub.id) {
            return Err(BillingError::Database(format!(
                "subscription {} already exists",
                sub.id
            )));
        }
        subs.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn get(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        Ok(self.subscriptions.lock().await.get(&id).cloned())
    }

    async fn current_for_tenant(&self, tenant: TenantId) -> BillingResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .await
            .values()
            .filter(|s| s.tenant_id == tenant)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn get_by_gateway_ref(&self, external_ref: &str) -> BillingResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .await
            .values()
            .find(|s| s.gateway_subscription_ref.as_deref() == Some(external_ref))
            .cloned())
    }

    async fn update(&self, sub: &Subscription, expected_version: i64) -> BillingResult<()> {
        let mut subs = self.subscriptions.lock().await;
        let existing = subs
            .get(&sub.id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", sub.id)))?;
        if existing.version != expected_version {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} moved from version {} to {}",
                sub.id, expected_version, existing.version
            )));
        }
        subs.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn list_due(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .await
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    async fn list_past_due(&self) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .await
            .values()
            .filter(|s| s.status == crate::subscription::SubscriptionStatus::PastDue)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> BillingResult<Vec<Subscription>> {
        Ok(self.subscriptions.lock().await.values().cloned().collect())
    }

    async fn trial_used(&self, tenant: TenantId) -> BillingResult<bool> {
        Ok(self.trial_grants.lock().await.contains(&tenant))
    }

    async fn mark_trial_used(&self, tenant: TenantId) -> BillingResult<()> {
        self.trial_grants.lock().await.insert(tenant);
        Ok(())
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn claim(
        &self,
        attempt: &BillingAttempt,
        stale_after: Duration,
        now: OffsetDateTime,
    ) -> BillingResult<AttemptClaim> {
        let mut attempts = self.attempts.lock().await;
        match attempts.get_mut(&attempt.idempotency_key) {
            None => {
                attempts.insert(attempt.idempotency_key.clone(), attempt.clone());
                Ok(AttemptClaim::Claimed(attempt.clone()))
            }
            Some(existing) if existing.outcome.is_terminal() => {
                Ok(AttemptClaim::Settled(existing.clone()))
            }
            Some(existing) if existing.attempted_at + stale_after <= now => {
                // Stuck pending claim from a crashed worker; take it over.
                existing.attempted_at = now;
                Ok(AttemptClaim::Claimed(existing.clone()))
            }
            Some(existing) => Ok(AttemptClaim::InFlight(existing.clone())),
        }
    }

    async fn record_outcome(
        &self,
        idempotency_key: &str,
        outcome: AttemptOutcome,
        failure_reason: Option<&str>,
    ) -> BillingResult<()> {
        let mut attempts = self.attempts.lock().await;
        let attempt = attempts
            .get_mut(idempotency_key)
            .ok_or_else(|| BillingError::NotFound(format!("attempt '{}'", idempotency_key)))?;
        attempt.outcome = outcome;
        attempt.failure_reason = failure_reason.map(str::to_string);
        Ok(())
    }

    async fn get_by_key(&self, idempotency_key: &str) -> BillingResult<Option<BillingAttempt>> {
        Ok(self.attempts.lock().await.get(idempotency_key).cloned())
    }

    async fn list_for_subscription(
        &self,
        id: SubscriptionId,
    ) -> BillingResult<Vec<BillingAttempt>> {
        let mut attempts: Vec<BillingAttempt> = self
            .attempts
            .lock()
            .await
            .values()
            .filter(|a| a.subscription_id == id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempted_at);
        Ok(attempts)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: &BillingEvent) -> BillingResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    async fn list_for_tenant(
        &self,
        tenant: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events = self.events.lock().await;
        let mut matching: Vec<BillingEvent> = events
            .iter()
            .filter(|e| e.tenant_id == tenant)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        stale_after: Duration,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut events = self.webhook_events.lock().await;
        match events.get_mut(event_id) {
            None => {
                events.insert(
                    event_id.to_string(),
                    WebhookEventRecord {
                        event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        event_timestamp,
                        processing_result: "processing".to_string(),
                        processing_started_at: now,
                        error_message: None,
                    },
                );
                Ok(true)
            }
            Some(existing)
                if existing.processing_result == "processing"
                    && existing.processing_started_at + stale_after <= now =>
            {
                existing.processing_started_at = now;
                existing.error_message = Some("recovered from stuck state".to_string());
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let mut events = self.webhook_events.lock().await;
        let record = events
            .get_mut(event_id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook event '{}'", event_id)))?;
        record.processing_result = result.to_string();
        record.error_message = error.map(str::to_string);
        Ok(())
    }

    async fn purge_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let mut events = self.webhook_events.lock().await;
        let before = events.len();
        events.retain(|_, r| r.event_timestamp >= cutoff);
        Ok((before - events.len()) as u64)
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
            source_ip: "198.51.100.4".to_string(),
            terms_version: "2025-06".to_string(),
        }
    }

    #[tokio::test]
    async fn test_optimistic_update_rejects_stale_version() {
        let store = MemoryStore::new();
        let mut sub = Subscription::new_trial(
            TenantId::new(),
            PlanId::from("starter"),
            tably_shared::RegionTier::Tier1,
            14,
            &consent(),
            None,
            OffsetDateTime::UNIX_EPOCH,
        );
        store.insert(&sub).await.unwrap();

        sub.version = 2;
        store.update(&sub, 1).await.unwrap();

        // Writing again with the stale expected version fails.
        sub.version = 3;
        let err = store.update(&sub, 1).await.unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_stale() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::UNIX_EPOCH;
        let attempt = BillingAttempt::pending(
            SubscriptionId::new(),
            "key-1".to_string(),
            2_900,
            "USD".to_string(),
            now,
        );

        let first = store.claim(&attempt, Duration::minutes(30), now).await.unwrap();
        assert!(matches!(first, AttemptClaim::Claimed(_)));

        let second = store.claim(&attempt, Duration::minutes(30), now).await.unwrap();
        assert!(matches!(second, AttemptClaim::InFlight(_)));

        // Past the stale window the claim is recoverable.
        let later = now + Duration::minutes(31);
        let third = store.claim(&attempt, Duration::minutes(30), later).await.unwrap();
        assert!(matches!(third, AttemptClaim::Claimed(_)));
    }

    #[tokio::test]
    async fn test_settled_attempt_stays_settled() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::UNIX_EPOCH;
        let attempt = BillingAttempt::pending(
            SubscriptionId::new(),
            "key-2".to_string(),
            900,
            "USD".to_string(),
            now,
        );
        store.claim(&attempt, Duration::minutes(30), now).await.unwrap();
        store
            .record_outcome("key-2", AttemptOutcome::Succeeded, None)
            .await
            .unwrap();

        let result = store.claim(&attempt, Duration::minutes(30), now).await.unwrap();
        match result {
            AttemptClaim::Settled(a) => assert_eq!(a.outcome, AttemptOutcome::Succeeded),
            other => panic!("expected Settled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_webhook_event_claim_dedupes() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::UNIX_EPOCH;
        assert!(store
            .claim_webhook_event("evt_1", "charge.succeeded", now, Duration::minutes(30), now)
            .await
            .unwrap());
        assert!(!store
            .claim_webhook_event("evt_1", "charge.succeeded", now, Duration::minutes(30), now)
            .await
            .unwrap());
    }
}
