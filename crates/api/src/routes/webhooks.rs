//! Gateway webhook endpoint

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;
use time::OffsetDateTime;

use tably_billing::BillingError;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Receive a provider notification.
///
/// The signature is verified before anything else; an invalid signature is
/// rejected without being acted upon. Events referencing no known
/// subscription are acknowledged so the provider stops redelivering them.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get("x-gateway-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing signature header".to_string()))?;

    match state
        .billing
        .webhooks
        .handle(&provider, &body, signature, OffsetDateTime::now_utc())
        .await
    {
        Ok(()) => Ok(Json(json!({ "received": true }))),
        Err(BillingError::NotFound(msg)) => {
            tracing::warn!(provider = %provider, detail = %msg, "webhook for unknown subscription");
            Ok(Json(json!({ "received": true, "ignored": true })))
        }
        Err(e) => Err(e.into()),
    }
}
