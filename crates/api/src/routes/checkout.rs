//! Checkout and signup routes

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use time::OffsetDateTime;

use tably_billing::{
    CheckoutPreview, ConsentRecord, PaymentDetails, RawPaymentData, SignupRequest,
};
use tably_shared::{PlanId, RegionTier};

use crate::error::ApiResult;
use crate::extract::{client_ip, AuthTenant};
use crate::routes::subscription::SubscriptionInfo;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    pub plan_id: String,
    pub country: String,
}

/// Checkout initiation: plan price for the caller's region, trial
/// availability, and the payment methods on offer. An empty method list is
/// a valid response meaning no gateway is configured.
pub async fn initiate_checkout(
    State(state): State<AppState>,
    AuthTenant(tenant): AuthTenant,
    Json(body): Json<CheckoutBody>,
) -> ApiResult<Json<CheckoutPreview>> {
    let preview = state
        .billing
        .lifecycle
        .checkout(
            tenant,
            &PlanId::new(body.plan_id),
            RegionTier::for_country(&body.country),
        )
        .await?;
    Ok(Json(preview))
}

#[derive(Debug, Deserialize)]
pub struct SignupBody {
    pub plan_id: String,
    pub country: String,
    /// Version of the terms the tenant accepted at checkout.
    pub terms_version: String,
    /// Provider preference when more than one gateway is configured.
    pub provider: Option<String>,
    /// Raw payment credentials, tokenized by the gateway and never stored.
    pub payment: Option<RawPaymentData>,
}

/// Create the tenant's subscription: a trial when the one-time grant and the
/// plan allow it, otherwise atomically with a successful first charge.
pub async fn signup(
    State(state): State<AppState>,
    AuthTenant(tenant): AuthTenant,
    headers: HeaderMap,
    Json(body): Json<SignupBody>,
) -> ApiResult<Json<SubscriptionInfo>> {
    let now = OffsetDateTime::now_utc();
    let request = SignupRequest {
        tenant_id: tenant,
        plan_id: PlanId::new(body.plan_id),
        region: RegionTier::for_country(&body.country),
        consent: ConsentRecord {
            timestamp: now,
            source_ip: client_ip(&headers),
            terms_version: body.terms_version,
        },
        payment: body.payment.map(|raw| PaymentDetails {
            provider: body.provider,
            raw,
        }),
    };

    let sub = state.billing.lifecycle.signup(request, now).await?;
    let entitlement = state.billing.entitlements.entitlement(tenant).await?;
    Ok(Json(SubscriptionInfo::from_parts(&sub, &entitlement)))
}
