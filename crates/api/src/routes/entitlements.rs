//! Capability and limit checks
//!
//! The route layer's view of the entitlement resolver. Callers are expected
//! to redirect to the upgrade flow when a capability comes back disabled,
//! not to fail silently.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use tably_shared::{Capability, LimitName, LimitValue};

use crate::error::{ApiError, ApiResult};
use crate::extract::AuthTenant;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CapabilityResponse {
    pub capability: &'static str,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct LimitResponse {
    pub limit: &'static str,
    pub value: LimitValue,
}

/// Is the named capability enabled for this tenant right now.
pub async fn check_capability(
    State(state): State<AppState>,
    AuthTenant(tenant): AuthTenant,
    Path(name): Path<String>,
) -> ApiResult<Json<CapabilityResponse>> {
    let capability: Capability = name
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;
    let enabled = state
        .billing
        .entitlements
        .has_capability(tenant, capability)
        .await?;
    Ok(Json(CapabilityResponse {
        capability: capability.as_str(),
        enabled,
    }))
}

/// Resolve the named limit for this tenant.
pub async fn check_limit(
    State(state): State<AppState>,
    AuthTenant(tenant): AuthTenant,
    Path(name): Path<String>,
) -> ApiResult<Json<LimitResponse>> {
    let limit: LimitName = name
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;
    let value = state.billing.entitlements.limit_for(tenant, limit).await?;
    Ok(Json(LimitResponse {
        limit: limit.as_str(),
        value,
    }))
}
