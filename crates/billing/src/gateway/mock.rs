//! In-memory mock gateway for lifecycle and scheduler tests.
//!
//! Outcomes are scripted per call; with an empty script every charge
//! succeeds. Charges are deduplicated by idempotency key the way a real
//! provider would be, so transparent retries can be asserted against the
//! call log without producing duplicate effects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ChargeStatus, GatewayCharge, GatewayError, PaymentGateway, PaymentMethodKind,
    PaymentMethodToken, RawPaymentData, RecurringTerms,
};

/// One observed charge call, including retried invocations.
#[derive(Debug, Clone)]
pub struct RecordedCharge {
    pub token: String,
    pub amount_cents: i64,
    pub currency: String,
    pub idempotency_key: String,
}

#[derive(Default)]
pub struct MockGateway {
    /// Scripted outcomes consumed in order; empty means "succeed".
    script: Mutex<VecDeque<Result<ChargeStatus, GatewayError>>>,
    /// Every charge invocation, including deduplicated retries.
    calls: Mutex<Vec<RecordedCharge>>,
    /// Settled effects keyed by idempotency key.
    effects: Mutex<HashMap<String, GatewayCharge>>,
    revoked_tokens: Mutex<HashSet<String>>,
    canceled_refs: Mutex<Vec<String>>,
    fail_cancel: AtomicBool,
    counter: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, outcome: Result<ChargeStatus, GatewayError>) {
        self.script.lock().await.push_back(outcome);
    }

    pub async fn enqueue_decline(&self, reason: &str) {
        self.enqueue(Err(GatewayError::Declined {
            reason: reason.to_string(),
        }))
        .await;
    }

    pub async fn enqueue_unavailable(&self) {
        self.enqueue(Err(GatewayError::Unavailable(
            "connection reset".to_string(),
        )))
        .await;
    }

    pub async fn revoke_token(&self, token: &PaymentMethodToken) {
        self.revoked_tokens
            .lock()
            .await
            .insert(token.as_str().to_string());
    }

    pub fn set_fail_cancel(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    /// All charge invocations observed, including retries.
    pub async fn calls(&self) -> Vec<RecordedCharge> {
        self.calls.lock().await.clone()
    }

    /// Distinct settled charges (one per idempotency key).
    pub async fn settled_charge_count(&self) -> usize {
        self.effects.lock().await.len()
    }

    pub async fn canceled_refs(&self) -> Vec<String> {
        self.canceled_refs.lock().await.clone()
    }

    fn next_ref(&self, prefix: &str) -> String {
        format!(
            "{}_mock_{}",
            prefix,
            self.counter.fetch_add(1, Ordering::SeqCst)
        )
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn provider(&self) -> &'static str {
        "mock"
    }

    fn method_kind(&self) -> PaymentMethodKind {
        PaymentMethodKind::Card
    }

    async fn tokenize(&self, _raw: RawPaymentData) -> Result<PaymentMethodToken, GatewayError> {
        Ok(PaymentMethodToken(self.next_ref("tok")))
    }

    async fn charge(
        &self,
        token: &PaymentMethodToken,
        amount_cents: i64,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<GatewayCharge, GatewayError> {
        self.calls.lock().await.push(RecordedCharge {
            token: token.as_str().to_string(),
            amount_cents,
            currency: currency.to_string(),
            idempotency_key: idempotency_key.to_string(),
        });

        if self.revoked_tokens.lock().await.contains(token.as_str()) {
            return Err(GatewayError::InvalidToken);
        }

        // Idempotent replay: a key that already settled returns the same
        // charge without consuming the script.
        if let Some(existing) = self.effects.lock().await.get(idempotency_key) {
            return Ok(existing.clone());
        }

        let status = match self.script.lock().await.pop_front() {
            Some(Ok(status)) => status,
            Some(Err(e)) => return Err(e),
            None => ChargeStatus::Succeeded,
        };

        let charge = GatewayCharge {
            provider_ref: self.next_ref("ch"),
            status,
        };
        self.effects
            .lock()
            .await
            .insert(idempotency_key.to_string(), charge.clone());
        Ok(charge)
    }

    async fn create_recurring(
        &self,
        _token: &PaymentMethodToken,
        _terms: &RecurringTerms,
        _idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        Ok(self.next_ref("autopay"))
    }

    async fn cancel_recurring(&self, external_ref: &str) -> Result<(), GatewayError> {
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("cancel failed".to_string()));
        }
        self.canceled_refs
            .lock()
            .await
            .push(external_ref.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idempotent_replay_returns_same_charge() {
        let gw = MockGateway::new();
        let token = gw
            .tokenize(RawPaymentData::Card {
                number: "4111111111111111".to_string(),
                exp_month: 1,
                exp_year: 2031,
                cvc: "000".to_string(),
                holder_name: "T".to_string(),
            })
            .await
            .unwrap();

        let first = gw.charge(&token, 2_900, "USD", "key-1").await.unwrap();
        let replay = gw.charge(&token, 2_900, "USD", "key-1").await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(gw.settled_charge_count().await, 1);
        assert_eq!(gw.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_decline_then_success() {
        let gw = MockGateway::new();
        gw.enqueue_decline("insufficient_funds").await;
        let token = PaymentMethodToken("tok_x".to_string());

        let declined = gw.charge(&token, 100, "USD", "k1").await;
        assert!(matches!(declined, Err(GatewayError::Declined { .. })));

        let ok = gw.charge(&token, 100, "USD", "k2").await.unwrap();
        assert_eq!(ok.status, ChargeStatus::Succeeded);
    }
}
