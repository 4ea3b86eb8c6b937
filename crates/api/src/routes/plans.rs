//! Plan listing routes

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use tably_shared::{Capability, LimitName, LimitValue, RegionTier};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PlansQuery {
    /// ISO country code used to pick the price bracket. Unmapped or missing
    /// codes fall back to the lowest bracket so a price is always shown.
    pub country: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PlanInfo {
    pub id: String,
    pub display_name: String,
    pub price_cents: i64,
    pub currency: &'static str,
    pub trial_days: u32,
    pub capabilities: Vec<&'static str>,
    pub limits: Vec<LimitInfo>,
}

#[derive(Debug, Serialize)]
pub struct LimitInfo {
    pub name: &'static str,
    pub value: LimitValue,
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub region_tier: RegionTier,
    pub plans: Vec<PlanInfo>,
}

/// Plans currently offerable at checkout, priced for the caller's region.
pub async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<PlansQuery>,
) -> ApiResult<Json<PlansResponse>> {
    let region = query
        .country
        .as_deref()
        .map(RegionTier::for_country)
        .unwrap_or(RegionTier::LOWEST);

    let plans = state
        .billing
        .catalog
        .list_offerable(region)
        .into_iter()
        .map(|offer| PlanInfo {
            id: offer.plan.id.to_string(),
            display_name: offer.plan.display_name.clone(),
            price_cents: offer.price.amount_cents,
            currency: offer.price.currency,
            trial_days: offer.plan.trial_days,
            capabilities: Capability::ALL
                .iter()
                .filter(|cap| offer.plan.has_capability(**cap))
                .map(|cap| cap.as_str())
                .collect(),
            limits: LimitName::ALL
                .iter()
                .map(|name| LimitInfo {
                    name: name.as_str(),
                    value: offer.plan.limit_for(*name),
                })
                .collect(),
        })
        .collect();

    Ok(Json(PlansResponse {
        region_tier: region,
        plans,
    }))
}
