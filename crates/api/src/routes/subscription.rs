//! Subscription management routes

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use tably_billing::{Entitlement, EntitlementState, Subscription};
use tably_shared::{PlanId, RegionTier};

use crate::error::{ApiError, ApiResult};
use crate::extract::AuthTenant;
use crate::state::AppState;

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub status: String,
    pub plan_id: String,
    pub region_tier: RegionTier,
    pub trial_end: Option<String>,
    pub current_period_start: String,
    pub current_period_end: String,
    pub cancel_at_period_end: bool,
    pub entitlement_state: EntitlementState,
    /// When the current entitlement lapses, if a lapse is scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl SubscriptionInfo {
    pub fn from_parts(sub: &Subscription, entitlement: &Entitlement) -> Self {
        Self {
            status: sub.status.to_string(),
            plan_id: sub.plan_id.to_string(),
            region_tier: sub.region_tier,
            trial_end: sub.trial_end.map(|t| t.to_string()),
            current_period_start: sub.current_period_start.to_string(),
            current_period_end: sub.current_period_end.to_string(),
            cancel_at_period_end: sub.cancel_at_period_end,
            entitlement_state: entitlement.state,
            expires_at: entitlement.expires_at.map(|t| t.to_string()),
            blocked_reason: entitlement.blocked_reason.clone(),
        }
    }
}

async fn info_for(state: &AppState, tenant: tably_shared::TenantId) -> ApiResult<SubscriptionInfo> {
    let sub = state
        .billing
        .store()
        .subscriptions
        .current_for_tenant(tenant)
        .await?
        .ok_or_else(|| ApiError::NotFound("no subscription".to_string()))?;
    let entitlement = state.billing.entitlements.entitlement(tenant).await?;
    Ok(SubscriptionInfo::from_parts(&sub, &entitlement))
}

/// Current subscription and entitlement state.
pub async fn subscription_info(
    State(state): State<AppState>,
    AuthTenant(tenant): AuthTenant,
) -> ApiResult<Json<SubscriptionInfo>> {
    Ok(Json(info_for(&state, tenant).await?))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanBody {
    pub new_plan_id: String,
}

/// Upgrade or downgrade the current subscription's plan. Takes effect
/// immediately for entitlements; no proration.
pub async fn change_plan(
    State(state): State<AppState>,
    AuthTenant(tenant): AuthTenant,
    Json(body): Json<ChangePlanBody>,
) -> ApiResult<Json<SubscriptionInfo>> {
    state
        .billing
        .lifecycle
        .change_plan(tenant, &PlanId::new(body.new_plan_id), OffsetDateTime::now_utc())
        .await?;
    Ok(Json(info_for(&state, tenant).await?))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    /// True cancels now; false cancels at the end of the paid period.
    #[serde(default)]
    pub immediate: bool,
}

pub async fn cancel(
    State(state): State<AppState>,
    AuthTenant(tenant): AuthTenant,
    Json(body): Json<CancelBody>,
) -> ApiResult<Json<SubscriptionInfo>> {
    state
        .billing
        .lifecycle
        .request_cancellation(tenant, body.immediate, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(info_for(&state, tenant).await?))
}

pub async fn reactivate(
    State(state): State<AppState>,
    AuthTenant(tenant): AuthTenant,
) -> ApiResult<Json<SubscriptionInfo>> {
    state
        .billing
        .lifecycle
        .reactivate(tenant, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(info_for(&state, tenant).await?))
}
