//! Cardwire adapter (card-network style provider)
//!
//! Plain REST client over the Cardwire API. Idempotency keys are forwarded
//! in the `Idempotency-Key` header, which Cardwire uses to dedupe retried
//! charges on its side.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{
    ChargeStatus, GatewayCharge, GatewayError, PaymentGateway, PaymentMethodKind,
    PaymentMethodToken, RawPaymentData, RecurringTerms,
};

const DEFAULT_BASE_URL: &str = "https://api.cardwire.io";

#[derive(Debug, Clone)]
pub struct CardwireConfig {
    pub api_key: String,
    pub base_url: String,
}

impl CardwireConfig {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("CARDWIRE_API_KEY").ok()?;
        if api_key.is_empty() {
            return None;
        }
        let base_url =
            std::env::var("CARDWIRE_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Some(Self { api_key, base_url })
    }
}

pub struct CardwireGateway {
    http: reqwest::Client,
    config: CardwireConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl CardwireGateway {
    pub fn new(config: CardwireConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Option<Self> {
        CardwireConfig::from_env().map(Self::new)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn transport_error(e: reqwest::Error) -> GatewayError {
        if e.is_timeout() || e.is_connect() {
            GatewayError::Unavailable(e.to_string())
        } else {
            GatewayError::Provider(e.to_string())
        }
    }

    /// Map a non-success HTTP response onto the gateway error taxonomy.
    async fn map_failure(response: reqwest::Response) -> GatewayError {
        let status = response.status();
        let body: ErrorBody = response.json().await.unwrap_or(ErrorBody {
            code: String::new(),
            message: String::new(),
        });
        match status {
            StatusCode::PAYMENT_REQUIRED => GatewayError::Declined {
                reason: if body.code.is_empty() {
                    "card_declined".to_string()
                } else {
                    body.code
                },
            },
            StatusCode::NOT_FOUND | StatusCode::GONE => GatewayError::InvalidToken,
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                GatewayError::Unavailable(format!("cardwire returned {}", s))
            }
            s => GatewayError::Provider(format!("cardwire returned {}: {}", s, body.message)),
        }
    }
}

#[async_trait]
impl PaymentGateway for CardwireGateway {
    fn provider(&self) -> &'static str {
        "cardwire"
    }

    fn method_kind(&self) -> PaymentMethodKind {
        PaymentMethodKind::Card
    }

    async fn tokenize(&self, raw: RawPaymentData) -> Result<PaymentMethodToken, GatewayError> {
        let body = match raw {
            RawPaymentData::Card {
                number,
                exp_month,
                exp_year,
                cvc,
                holder_name,
            } => serde_json::json!({
                "card": {
                    "number": number,
                    "exp_month": exp_month,
                    "exp_year": exp_year,
                    "cvc": cvc,
                    "holder_name": holder_name,
                }
            }),
            RawPaymentData::Wallet { .. } => {
                return Err(GatewayError::Provider(
                    "cardwire does not accept wallet credentials".to_string(),
                ))
            }
        };

        let response = self
            .http
            .post(self.url("/v1/tokens"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_failure(response).await);
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Provider(e.to_string()))?;
        Ok(PaymentMethodToken(parsed.token))
    }

    async fn charge(
        &self,
        token: &PaymentMethodToken,
        amount_cents: i64,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<GatewayCharge, GatewayError> {
        let response = self
            .http
            .post(self.url("/v1/charges"))
            .bearer_auth(&self.config.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "token": token.as_str(),
                "amount_cents": amount_cents,
                "currency": currency,
            }))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_failure(response).await);
        }
        let parsed: ChargeResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Provider(e.to_string()))?;

        let status = match parsed.status.as_str() {
            "succeeded" => ChargeStatus::Succeeded,
            "pending" => ChargeStatus::Pending,
            other => {
                return Err(GatewayError::Provider(format!(
                    "unexpected charge status '{}'",
                    other
                )))
            }
        };
        Ok(GatewayCharge {
            provider_ref: parsed.id,
            status,
        })
    }

    async fn create_recurring(
        &self,
        token: &PaymentMethodToken,
        terms: &RecurringTerms,
        idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        let response = self
            .http
            .post(self.url("/v1/schedules"))
            .bearer_auth(&self.config.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "token": token.as_str(),
                "amount_cents": terms.amount_cents,
                "currency": terms.currency,
                "interval_days": terms.interval_days,
                "metadata": { "plan_id": terms.plan_id.as_str() },
            }))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_failure(response).await);
        }
        let parsed: ScheduleResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Provider(e.to_string()))?;
        Ok(parsed.id)
    }

    async fn cancel_recurring(&self, external_ref: &str) -> Result<(), GatewayError> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/schedules/{}", external_ref)))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(Self::transport_error)?;

        // Cancelling an already-cancelled schedule is a no-op, not a failure.
        if response.status() == StatusCode::GONE {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::map_failure(response).await);
        }
        Ok(())
    }
}
