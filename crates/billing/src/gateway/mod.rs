//! Payment gateway adapter
//!
//! A uniform port over external payment providers. Concrete adapters exist
//! once per provider (card-network style and wallet style) and hide the
//! provider protocol behind a small operation set: tokenize, charge,
//! create-recurring, cancel-recurring.
//!
//! Every mutating call forwards an idempotency key so network retries or
//! duplicate invocations never produce duplicate charges. "No gateway
//! configured" is not an error here: the registry simply exposes an empty
//! payment-method list and callers treat that as "no payment methods
//! available".

pub mod cardwire;
pub mod mock;
pub mod payvault;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tably_shared::PlanId;

pub use cardwire::CardwireGateway;
pub use mock::MockGateway;
pub use payvault::PayvaultGateway;

/// Opaque payment method reference minted by a gateway. The core persists
/// only this token, never raw payment credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentMethodToken(pub String);

impl PaymentMethodToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PaymentMethodToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payment method family a provider handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    Card,
    Wallet,
}

/// Raw payment credentials collected at checkout. Passed straight to the
/// gateway for tokenization and never persisted.
#[derive(Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawPaymentData {
    Card {
        number: String,
        exp_month: u8,
        exp_year: u16,
        cvc: String,
        holder_name: String,
    },
    Wallet {
        wallet_provider: String,
        account_ref: String,
    },
}

// Redacted by hand so card numbers can never leak into logs.
impl std::fmt::Debug for RawPaymentData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawPaymentData::Card { holder_name, .. } => f
                .debug_struct("Card")
                .field("number", &"[redacted]")
                .field("holder_name", holder_name)
                .finish_non_exhaustive(),
            RawPaymentData::Wallet {
                wallet_provider, ..
            } => f
                .debug_struct("Wallet")
                .field("wallet_provider", wallet_provider)
                .finish_non_exhaustive(),
        }
    }
}

/// Result of a charge call against a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCharge {
    /// Provider-side charge reference.
    pub provider_ref: String,
    pub status: ChargeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Succeeded,
    /// Accepted by the provider but not yet settled; the final outcome
    /// arrives via webhook.
    Pending,
}

/// Terms for a provider-managed recurring schedule.
#[derive(Debug, Clone, Serialize)]
pub struct RecurringTerms {
    pub plan_id: PlanId,
    pub amount_cents: i64,
    pub currency: String,
    pub interval_days: u32,
}

/// Gateway failure taxonomy.
///
/// The distinction matters to the lifecycle manager: declines and invalid
/// tokens move a subscription toward `past_due`, while unavailability is
/// retried transparently with the same idempotency key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The card/account was rejected. Not retriable automatically.
    #[error("declined: {reason}")]
    Declined { reason: String },

    /// Transient provider outage. Safe to retry with backoff.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    /// The token is expired or revoked; a new payment method is required.
    #[error("payment method token invalid or revoked")]
    InvalidToken,

    /// Unexpected provider response.
    #[error("provider error: {0}")]
    Provider(String),
}

impl GatewayError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Port implemented once per payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Stable provider slug, e.g. "cardwire".
    fn provider(&self) -> &'static str;

    fn method_kind(&self) -> PaymentMethodKind;

    /// Exchange raw payment credentials for an opaque token.
    async fn tokenize(&self, raw: RawPaymentData) -> Result<PaymentMethodToken, GatewayError>;

    /// Charge a tokenized payment method. `idempotency_key` must make
    /// repeated invocations produce at most one charge.
    async fn charge(
        &self,
        token: &PaymentMethodToken,
        amount_cents: i64,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<GatewayCharge, GatewayError>;

    /// Create a provider-managed recurring schedule; returns the external
    /// subscription reference.
    async fn create_recurring(
        &self,
        token: &PaymentMethodToken,
        terms: &RecurringTerms,
        idempotency_key: &str,
    ) -> Result<String, GatewayError>;

    /// Cancel a provider-managed recurring schedule. Must complete (or be
    /// retried) before the local subscription is considered fully canceled.
    async fn cancel_recurring(&self, external_ref: &str) -> Result<(), GatewayError>;
}

/// A payment method available at checkout.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentMethodDescriptor {
    pub provider: &'static str,
    pub kind: PaymentMethodKind,
}

/// Configured gateways. May be empty; that is a normal deployment state
/// (e.g. a fresh self-hosted install), not an error.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: Vec<Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new(gateways: Vec<Arc<dyn PaymentGateway>>) -> Self {
        Self { gateways }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from environment. Providers with no configuration are simply
    /// absent from the registry.
    pub fn from_env() -> Self {
        let mut gateways: Vec<Arc<dyn PaymentGateway>> = Vec::new();
        if let Some(gw) = CardwireGateway::from_env() {
            tracing::info!(provider = gw.provider(), "payment gateway configured");
            gateways.push(Arc::new(gw));
        }
        if let Some(gw) = PayvaultGateway::from_env() {
            tracing::info!(provider = gw.provider(), "payment gateway configured");
            gateways.push(Arc::new(gw));
        }
        if gateways.is_empty() {
            tracing::warn!("no payment gateway configured; checkout will offer no payment methods");
        }
        Self { gateways }
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    pub fn available_methods(&self) -> Vec<PaymentMethodDescriptor> {
        self.gateways
            .iter()
            .map(|g| PaymentMethodDescriptor {
                provider: g.provider(),
                kind: g.method_kind(),
            })
            .collect()
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways
            .iter()
            .find(|g| g.provider() == provider)
            .cloned()
    }

    /// The first configured gateway, used when the caller expresses no
    /// provider preference.
    pub fn primary(&self) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways.first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_a_normal_state() {
        let registry = GatewayRegistry::empty();
        assert!(registry.is_empty());
        assert!(registry.available_methods().is_empty());
        assert!(registry.primary().is_none());
    }

    #[test]
    fn test_raw_payment_data_debug_redacts_card_number() {
        let raw = RawPaymentData::Card {
            number: "4242424242424242".to_string(),
            exp_month: 12,
            exp_year: 2030,
            cvc: "123".to_string(),
            holder_name: "A Diner".to_string(),
        };
        let rendered = format!("{:?}", raw);
        assert!(!rendered.contains("4242"));
        assert!(rendered.contains("[redacted]"));
    }

    #[test]
    fn test_retriability() {
        assert!(GatewayError::Unavailable("503".to_string()).is_retriable());
        assert!(!GatewayError::Declined {
            reason: "do_not_honor".to_string()
        }
        .is_retriable());
        assert!(!GatewayError::InvalidToken.is_retriable());
    }
}
