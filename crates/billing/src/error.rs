//! Billing error taxonomy
//!
//! Every user-visible failure mode maps to one variant so the route layer can
//! drive specific UI messaging. Transient gateway failures are retried inside
//! the lifecycle/scheduler and only surface once retries exhaust.

use crate::gateway::GatewayError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// No payment gateway is configured. Non-fatal: checkout shows an empty
    /// payment-method list and the caller decides what to offer.
    #[error("billing not configured: {0}")]
    Configuration(String),

    /// The payment method was rejected by the provider. User-actionable.
    #[error("payment declined: {reason}")]
    PaymentDeclined { reason: String },

    /// The provider is temporarily unreachable. Retried automatically with
    /// the same idempotency key.
    #[error("payment gateway unavailable: {0}")]
    TransientGateway(String),

    /// The stored payment method token is expired or revoked; the tenant must
    /// collect a new payment method.
    #[error("payment method invalid or expired")]
    InvalidPaymentMethod,

    /// Webhook signature verification failed. Logged and dropped, never
    /// acted upon.
    #[error("webhook signature invalid")]
    Authenticity,

    /// The requested operation is not permitted in the subscription's
    /// current state.
    #[error("operation not permitted: {0}")]
    StateConflict(String),

    /// Optimistic lock failure: another process modified the row.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<GatewayError> for BillingError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Declined { reason } => BillingError::PaymentDeclined { reason },
            GatewayError::Unavailable(msg) => BillingError::TransientGateway(msg),
            GatewayError::InvalidToken => BillingError::InvalidPaymentMethod,
            GatewayError::Provider(msg) => BillingError::TransientGateway(msg),
        }
    }
}

impl BillingError {
    /// Whether the scheduler may transparently retry the failed operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BillingError::TransientGateway(_))
    }
}
