//! Gateway webhook processing
//!
//! Inbound provider notifications: charge settled/failed, recurring schedule
//! canceled by the provider, dispute opened. Every payload is authenticated
//! against the provider's signing secret before anything else happens; a
//! forged "charge succeeded" can never unlock entitlements.
//!
//! Processing is at-most-once per provider event id (atomic claim with a
//! stuck-processing recovery window) and reconciles against local
//! BillingAttempt records by idempotency key, so a confirmation arriving
//! after the scheduler's synchronous call already moved state is a no-op.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tably_shared::SubscriptionId;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::ActorType;
use crate::lifecycle::{AppliedOutcome, ChargeOutcomeReport, LifecycleManager};
use crate::store::{AttemptClaim, BillingAttempt, Store};
use crate::subscription::Subscription;

type HmacSha256 = Hmac<Sha256>;

/// How long a webhook event may sit in "processing" before another worker
/// can reclaim it.
const EVENT_STALE_AFTER: Duration = Duration::minutes(30);

/// A verified gateway event.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider-side creation time (unix seconds).
    pub created: i64,
    #[serde(default)]
    pub data: GatewayEventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayEventData {
    /// Our subscription id, echoed back from charge metadata.
    pub subscription_id: Option<Uuid>,
    /// Provider-side recurring schedule reference.
    pub external_ref: Option<String>,
    /// The idempotency key we sent with the charge, when the provider
    /// echoes it.
    pub idempotency_key: Option<String>,
    /// Billing-cycle boundary the charge was for (unix seconds).
    pub boundary: Option<i64>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub failure_reason: Option<String>,
}

impl GatewayEvent {
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

pub struct WebhookProcessor {
    store: Store,
    lifecycle: Arc<LifecycleManager>,
    config: BillingConfig,
}

impl WebhookProcessor {
    pub fn new(store: Store, lifecycle: Arc<LifecycleManager>, config: BillingConfig) -> Self {
        Self {
            store,
            lifecycle,
            config,
        }
    }

    /// Verify and process one provider notification.
    pub async fn handle(
        &self,
        provider: &str,
        payload: &str,
        signature: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let event = self.verify_event(provider, payload, signature, now)?;
        self.process_event(event, now).await
    }

    /// Verify the authenticity of a webhook payload.
    ///
    /// Signature header format: `t=<unix ts>,v1=<hex hmac>`, where the HMAC
    /// is SHA-256 over `"<t>.<payload>"` with the provider's signing secret.
    /// Invalid signatures are logged and dropped, never acted upon.
    pub fn verify_event(
        &self,
        provider: &str,
        payload: &str,
        signature: &str,
        now: OffsetDateTime,
    ) -> BillingResult<GatewayEvent> {
        let secret = self.config.webhook_secrets.get(provider).ok_or_else(|| {
            tracing::error!(provider = provider, "no webhook secret configured");
            BillingError::Authenticity
        })?;

        // Parse the signature header: t=timestamp,v1=signature
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;
        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!(provider = provider, "missing timestamp in signature header");
            BillingError::Authenticity
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!(provider = provider, "missing v1 signature in signature header");
            BillingError::Authenticity
        })?;

        // Reject replays outside the tolerance window.
        let skew = (now.unix_timestamp() - timestamp).abs();
        if skew > self.config.webhook_tolerance.whole_seconds() {
            tracing::error!(
                provider = provider,
                skew_seconds = skew,
                "webhook timestamp outside tolerance"
            );
            return Err(BillingError::Authenticity);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
            tracing::error!(provider = provider, "invalid webhook secret");
            BillingError::Authenticity
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!(provider = provider, "webhook signature mismatch");
            return Err(BillingError::Authenticity);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(provider = provider, error = %e, "failed to parse webhook payload");
            BillingError::InvalidInput(format!("malformed webhook payload: {}", e))
        })
    }

    /// Process a verified event, at most once per event id.
    pub async fn process_event(
        &self,
        event: GatewayEvent,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let claimed = self
            .store
            .events
            .claim_webhook_event(
                &event.id,
                &event.event_type,
                event.created_at(),
                EVENT_STALE_AFTER,
                now,
            )
            .await?;
        if !claimed {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "duplicate webhook event; already claimed or processed"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "processing gateway webhook event"
        );

        let result = self.dispatch(&event, now).await;
        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = self
            .store
            .events
            .finish_webhook_event(&event.id, processing_result, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "failed to record webhook processing result"
            );
        }
        result
    }

    async fn dispatch(&self, event: &GatewayEvent, now: OffsetDateTime) -> BillingResult<()> {
        match event.event_type.as_str() {
            "charge.succeeded" => {
                self.reconcile_charge(event, ChargeOutcomeReport::Succeeded, now)
                    .await
            }
            "charge.failed" => {
                let reason = event
                    .data
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "charge failed".to_string());
                self.reconcile_charge(event, ChargeOutcomeReport::Failed { reason }, now)
                    .await
            }
            "recurring.canceled" => {
                let sub = self.resolve_subscription(event).await?;
                self.lifecycle
                    .handle_provider_recurring_canceled(sub.id, &event.id, now)
                    .await
            }
            "dispute.opened" => {
                let sub = self.resolve_subscription(event).await?;
                let reason = event
                    .data
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "dispute".to_string());
                self.lifecycle
                    .handle_dispute_opened(sub.id, &event.id, &reason, now)
                    .await
            }
            other => {
                // Tracked so new provider event types surface in the logs.
                tracing::info!(
                    event_id = %event.id,
                    event_type = other,
                    "unhandled gateway event type"
                );
                Ok(())
            }
        }
    }

    /// Reconcile a charge outcome against local BillingAttempt records and
    /// apply the lifecycle transition through the shared entry point.
    async fn reconcile_charge(
        &self,
        event: &GatewayEvent,
        report: ChargeOutcomeReport,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let sub = self.resolve_subscription(event).await?;
        let key = self.idempotency_key_for(event, &sub);

        // Make sure an attempt record exists for the key; a provider-side
        // recurring charge can reach us before any scheduler attempt.
        let (amount_cents, currency) = match (&event.data.amount_cents, &event.data.currency) {
            (Some(amount), Some(currency)) => (*amount, currency.clone()),
            _ => {
                let price = self
                    .lifecycle
                    .catalog()
                    .price_for(&sub.plan_id, sub.region_tier)?;
                (price.amount_cents, price.currency.to_string())
            }
        };
        let attempt = BillingAttempt::pending(sub.id, key.clone(), amount_cents, currency, now);
        let claim = self
            .store
            .attempts
            .claim(&attempt, EVENT_STALE_AFTER, now)
            .await?;
        if let AttemptClaim::InFlight(_) = claim {
            // A worker is mid-charge on this key; the apply call below still
            // serializes on the subscription lock and reconciles correctly.
            tracing::info!(
                event_id = %event.id,
                idempotency_key = %key,
                "webhook outcome racing an in-flight attempt"
            );
        }

        let applied = self
            .lifecycle
            .apply_charge_outcome(sub.id, &key, report, ActorType::Gateway, Some(&event.id), now)
            .await?;
        match applied {
            AppliedOutcome::Applied => {
                tracing::info!(
                    event_id = %event.id,
                    subscription_id = %sub.id,
                    "webhook outcome applied"
                );
            }
            AppliedOutcome::AlreadyApplied => {
                tracing::info!(
                    event_id = %event.id,
                    subscription_id = %sub.id,
                    "webhook outcome already recorded; no-op"
                );
            }
            AppliedOutcome::Corrected => {
                tracing::warn!(
                    event_id = %event.id,
                    subscription_id = %sub.id,
                    "webhook outcome corrected local record"
                );
            }
        }
        Ok(())
    }

    async fn resolve_subscription(&self, event: &GatewayEvent) -> BillingResult<Subscription> {
        if let Some(id) = event.data.subscription_id {
            if let Some(sub) = self.store.subscriptions.get(SubscriptionId(id)).await? {
                return Ok(sub);
            }
        }
        if let Some(external_ref) = &event.data.external_ref {
            if let Some(sub) = self
                .store
                .subscriptions
                .get_by_gateway_ref(external_ref)
                .await?
            {
                return Ok(sub);
            }
        }
        Err(BillingError::NotFound(format!(
            "webhook event {} references no known subscription",
            event.id
        )))
    }

    /// The idempotency key this event settles: the provider's echo when
    /// present, otherwise derived from the referenced boundary the same way
    /// the scheduler derives it.
    fn idempotency_key_for(&self, event: &GatewayEvent, sub: &Subscription) -> String {
        if let Some(key) = &event.data.idempotency_key {
            return key.clone();
        }
        let boundary = event
            .data
            .boundary
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or(sub.current_period_end);
        sub.boundary_idempotency_key(boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanCatalog;
    use crate::gateway::GatewayRegistry;

    fn processor_with_secret(secret: &str) -> WebhookProcessor {
        let store = Store::in_memory();
        let mut config = BillingConfig::default();
        config
            .webhook_secrets
            .insert("cardwire".to_string(), secret.to_string());
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            Arc::new(PlanCatalog::standard()),
            GatewayRegistry::empty(),
            config.clone(),
        ));
        WebhookProcessor::new(store, lifecycle, config)
    }

    fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    fn payload(event_id: &str) -> String {
        format!(
            r#"{{"id":"{}","type":"charge.succeeded","created":1700000000,"data":{{}}}}"#,
            event_id
        )
    }

    #[test]
    fn test_valid_signature_verifies() {
        let processor = processor_with_secret("whsec_test");
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let body = payload("evt_1");
        let sig = sign("whsec_test", now.unix_timestamp(), &body);

        let event = processor.verify_event("cardwire", &body, &sig, now).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "charge.succeeded");
    }

    #[test]
    fn test_forged_signature_is_dropped() {
        let processor = processor_with_secret("whsec_test");
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let body = payload("evt_forged");
        let sig = sign("whsec_wrong", now.unix_timestamp(), &body);

        let err = processor
            .verify_event("cardwire", &body, &sig, now)
            .unwrap_err();
        assert!(matches!(err, BillingError::Authenticity));
    }

    #[test]
    fn test_stale_timestamp_is_dropped() {
        let processor = processor_with_secret("whsec_test");
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let body = payload("evt_old");
        // Signed ten minutes in the past, outside the five-minute tolerance.
        let sig = sign("whsec_test", now.unix_timestamp() - 600, &body);

        let err = processor
            .verify_event("cardwire", &body, &sig, now)
            .unwrap_err();
        assert!(matches!(err, BillingError::Authenticity));
    }

    #[test]
    fn test_unknown_provider_is_dropped() {
        let processor = processor_with_secret("whsec_test");
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let body = payload("evt_x");
        let sig = sign("whsec_test", now.unix_timestamp(), &body);

        let err = processor
            .verify_event("payvault", &body, &sig, now)
            .unwrap_err();
        assert!(matches!(err, BillingError::Authenticity));
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_noop() {
        let processor = processor_with_secret("whsec_test");
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let event: GatewayEvent = serde_json::from_str(&payload("evt_dup")).unwrap();

        // First delivery fails on dispatch (no subscription referenced),
        // but claims the event id.
        assert!(processor.process_event(event.clone(), now).await.is_err());
        // Redelivery of the same event id is a clean no-op.
        assert!(processor.process_event(event, now).await.is_ok());
    }
}
