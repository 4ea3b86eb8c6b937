//! API error responses
//!
//! Maps billing errors onto HTTP statuses with enough detail to drive
//! specific UI messaging: declines ask for a new payment method, state
//! conflicts explain what is not permitted, configuration gaps read as
//! "try later" rather than hard failures.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use tably_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("missing or invalid tenant identity")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Payment was declined or the stored method is invalid; the tenant
    /// must provide a new payment method.
    #[error("{0}")]
    PaymentRequired(String),

    /// Billing is unavailable right now (no gateway configured, or the
    /// provider is down). Worth retrying; not a caller mistake.
    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::PaymentRequired(_) => "payment_required",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!(detail = %detail, "internal error");
        }
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::Configuration(msg) => ApiError::ServiceUnavailable(msg),
            BillingError::PaymentDeclined { reason } => {
                ApiError::PaymentRequired(format!("payment declined: {}", reason))
            }
            BillingError::InvalidPaymentMethod => ApiError::PaymentRequired(
                "payment method invalid or expired; please add a new one".to_string(),
            ),
            BillingError::TransientGateway(msg) => {
                ApiError::ServiceUnavailable(format!("payment provider unavailable: {}", msg))
            }
            BillingError::Authenticity => {
                ApiError::BadRequest("invalid webhook signature".to_string())
            }
            BillingError::StateConflict(msg) | BillingError::ConcurrentModification(msg) => {
                ApiError::Conflict(msg)
            }
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::Database(msg) => ApiError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_error_mapping() {
        let e: ApiError = BillingError::PaymentDeclined {
            reason: "do_not_honor".to_string(),
        }
        .into();
        assert_eq!(e.status(), StatusCode::PAYMENT_REQUIRED);

        let e: ApiError = BillingError::Configuration("no gateway".to_string()).into();
        assert_eq!(e.status(), StatusCode::SERVICE_UNAVAILABLE);

        let e: ApiError = BillingError::StateConflict("already canceled".to_string()).into();
        assert_eq!(e.status(), StatusCode::CONFLICT);

        let e: ApiError = BillingError::Authenticity.into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
    }
}
