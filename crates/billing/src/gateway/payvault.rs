//! Payvault adapter (wallet-style provider)
//!
//! Payvault charges a linked wallet account rather than a card. Its API
//! reports failures in-band with a 200 status and a `result` field, so the
//! mapping differs from the card-network adapter.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{
    ChargeStatus, GatewayCharge, GatewayError, PaymentGateway, PaymentMethodKind,
    PaymentMethodToken, RawPaymentData, RecurringTerms,
};

const DEFAULT_BASE_URL: &str = "https://gateway.payvault.dev";

#[derive(Debug, Clone)]
pub struct PayvaultConfig {
    pub merchant_id: String,
    pub api_secret: String,
    pub base_url: String,
}

impl PayvaultConfig {
    pub fn from_env() -> Option<Self> {
        let merchant_id = std::env::var("PAYVAULT_MERCHANT_ID").ok()?;
        let api_secret = std::env::var("PAYVAULT_API_SECRET").ok()?;
        if merchant_id.is_empty() || api_secret.is_empty() {
            return None;
        }
        let base_url =
            std::env::var("PAYVAULT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Some(Self {
            merchant_id,
            api_secret,
            base_url,
        })
    }
}

pub struct PayvaultGateway {
    http: reqwest::Client,
    config: PayvaultConfig,
}

/// Envelope Payvault wraps every response in.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: String,
    #[serde(default)]
    reason: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WalletToken {
    wallet_token: String,
}

#[derive(Debug, Deserialize)]
struct WalletCharge {
    charge_id: String,
    settled: bool,
}

#[derive(Debug, Deserialize)]
struct AutopayRef {
    autopay_id: String,
}

impl PayvaultGateway {
    pub fn new(config: PayvaultConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Option<Self> {
        PayvaultConfig::from_env().map(Self::new)
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

    async fn unwrap_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Unavailable(format!(
                "payvault returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Provider(format!(
                "payvault returned {}",
                status
            )));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::Provider(e.to_string()))?;

        match envelope.result.as_str() {
            "ok" => envelope
                .data
                .ok_or_else(|| GatewayError::Provider("payvault envelope missing data".to_string())),
            "declined" => Err(GatewayError::Declined {
                reason: envelope
                    .reason
                    .unwrap_or_else(|| "wallet_declined".to_string()),
            }),
            "token_revoked" | "token_expired" => Err(GatewayError::InvalidToken),
            other => Err(GatewayError::Provider(format!(
                "payvault result '{}': {}",
                other,
                envelope.reason.unwrap_or_default()
            ))),
        }
    }
}

#[async_trait]
impl PaymentGateway for PayvaultGateway {
    fn provider(&self) -> &'static str {
        "payvault"
    }

    fn method_kind(&self) -> PaymentMethodKind {
        PaymentMethodKind::Wallet
    }

    async fn tokenize(&self, raw: RawPaymentData) -> Result<PaymentMethodToken, GatewayError> {
        let (wallet_provider, account_ref) = match raw {
            RawPaymentData::Wallet {
                wallet_provider,
                account_ref,
            } => (wallet_provider, account_ref),
            RawPaymentData::Card { .. } => {
                return Err(GatewayError::Provider(
                    "payvault does not accept card credentials".to_string(),
                ))
            }
        };

        let response = self
            .http
            .post(self.url("/wallet/link"))
            .basic_auth(&self.config.merchant_id, Some(&self.config.api_secret))
            .json(&serde_json::json!({
                "wallet_provider": wallet_provider,
                "account_ref": account_ref,
            }))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let token: WalletToken = Self::unwrap_envelope(response).await?;
        Ok(PaymentMethodToken(token.wallet_token))
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
            .post(self.url("/wallet/charges"))
            .basic_auth(&self.config.merchant_id, Some(&self.config.api_secret))
            .json(&serde_json::json!({
                "wallet_token": token.as_str(),
                "amount_cents": amount_cents,
                "currency": currency,
                "dedupe_key": idempotency_key,
            }))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let charge: WalletCharge = Self::unwrap_envelope(response).await?;
        Ok(GatewayCharge {
            provider_ref: charge.charge_id,
            status: if charge.settled {
                ChargeStatus::Succeeded
            } else {
                ChargeStatus::Pending
            },
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
            .post(self.url("/wallet/autopay"))
            .basic_auth(&self.config.merchant_id, Some(&self.config.api_secret))
            .json(&serde_json::json!({
                "wallet_token": token.as_str(),
                "amount_cents": terms.amount_cents,
                "currency": terms.currency,
                "interval_days": terms.interval_days,
                "dedupe_key": idempotency_key,
                "reference": terms.plan_id.as_str(),
            }))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let autopay: AutopayRef = Self::unwrap_envelope(response).await?;
        Ok(autopay.autopay_id)
    }

    async fn cancel_recurring(&self, external_ref: &str) -> Result<(), GatewayError> {
        let response = self
            .http
            .post(self.url(&format!("/wallet/autopay/{}/cancel", external_ref)))
            .basic_auth(&self.config.merchant_id, Some(&self.config.api_secret))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Unavailable(format!(
                "payvault returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Provider(format!(
                "payvault returned {}",
                status
            )));
        }

        // Cancel responses carry no data; an autopay already cancelled on
        // the provider side still reports "ok".
        let envelope: Envelope<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| GatewayError::Provider(e.to_string()))?;
        match envelope.result.as_str() {
            "ok" => Ok(()),
            other => Err(GatewayError::Provider(format!(
                "payvault result '{}': {}",
                other,
                envelope.reason.unwrap_or_default()
            ))),
        }
    }
}
