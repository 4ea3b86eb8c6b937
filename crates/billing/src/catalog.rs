//! Plan catalog
//!
//! Pricing plans, their regional price brackets, capability flags and
//! resource limits. Pure data plus lookup: nothing here mutates, and catalog
//! snapshots never retroactively change subscriptions already bound to a
//! plan (re-sync goes through the lifecycle manager).

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tably_shared::{Capability, LimitName, LimitValue, PlanId, RegionTier};

use crate::error::{BillingError, BillingResult};

/// Price of a plan in one regional bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanPrice {
    pub region_tier: RegionTier,
    pub amount_cents: i64,
    pub currency: &'static str,
}

/// A pricing plan snapshot.
///
/// Immutable once referenced by a live subscription; administrative catalog
/// edits produce a new snapshot and take effect for existing subscribers only
/// through an explicit re-sync.
#[derive(Debug, Clone, Serialize)]
pub struct PricingPlan {
    pub id: PlanId,
    pub display_name: String,
    /// One price per region bracket, ordered Tier1 (highest) to Tier4 (lowest).
    prices: BTreeMap<&'static str, PlanPrice>,
    capabilities: BTreeSet<&'static str>,
    limits: BTreeMap<&'static str, LimitValue>,
    /// Days of free trial offered by this plan; 0 means no trial.
    pub trial_days: u32,
    /// Retired plans are not offerable but stay valid for existing subscribers.
    pub is_active: bool,
}

impl PricingPlan {
    fn new(id: &str, display_name: &str, trial_days: u32) -> Self {
        Self {
            id: PlanId::new(id),
            display_name: display_name.to_string(),
            prices: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            limits: BTreeMap::new(),
            trial_days,
            is_active: true,
        }
    }

    fn price(mut self, tier: RegionTier, amount_cents: i64) -> Self {
        self.prices.insert(
            tier.as_str(),
            PlanPrice {
                region_tier: tier,
                amount_cents,
                currency: "USD",
            },
        );
        self
    }

    fn capability(mut self, cap: Capability) -> Self {
        self.capabilities.insert(cap.as_str());
        self
    }

    fn limit(mut self, name: LimitName, value: LimitValue) -> Self {
        self.limits.insert(name.as_str(), value);
        self
    }

    fn retired(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap.as_str())
    }

    /// Limit defined by this plan; undeclared limits resolve to zero.
    pub fn limit_for(&self, name: LimitName) -> LimitValue {
        self.limits
            .get(name.as_str())
            .copied()
            .unwrap_or(LimitValue::ZERO)
    }

    pub fn offers_trial(&self) -> bool {
        self.trial_days > 0
    }

    /// Price in the given bracket. Plans declare all four brackets; the
    /// lowest bracket covers any gap so checkout never has no price.
    pub fn price_for(&self, tier: RegionTier) -> PlanPrice {
        self.prices
            .get(tier.as_str())
            .or_else(|| self.prices.get(RegionTier::LOWEST.as_str()))
            .copied()
            .unwrap_or(PlanPrice {
                region_tier: RegionTier::LOWEST,
                amount_cents: 0,
                currency: "USD",
            })
    }
}

/// A plan paired with its price for the caller's region.
#[derive(Debug, Clone, Serialize)]
pub struct OfferablePlan {
    pub plan: PricingPlan,
    pub price: PlanPrice,
}

/// The plan catalog: all plans ever offered, active and retired.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<PricingPlan>,
}

impl PlanCatalog {
    /// The standard Tably catalog.
    pub fn standard() -> Self {
        let starter = PricingPlan::new("starter", "Starter", 14)
            .price(RegionTier::Tier1, 2_900)
            .price(RegionTier::Tier2, 2_300)
            .price(RegionTier::Tier3, 1_700)
            .price(RegionTier::Tier4, 900)
            .capability(Capability::QrMenus)
            .capability(Capability::OnlineOrdering)
            .limit(LimitName::MaxMenus, LimitValue::Count(2))
            .limit(LimitName::MaxTables, LimitValue::Count(15))
            .limit(LimitName::MaxStaffAccounts, LimitValue::Count(3))
            .limit(LimitName::MaxMonthlyOrders, LimitValue::Count(500));

        let growth = PricingPlan::new("growth", "Growth", 14)
            .price(RegionTier::Tier1, 5_900)
            .price(RegionTier::Tier2, 4_700)
            .price(RegionTier::Tier3, 3_500)
            .price(RegionTier::Tier4, 1_900)
            .capability(Capability::QrMenus)
            .capability(Capability::OnlineOrdering)
            .capability(Capability::KitchenDisplay)
            .capability(Capability::TableReservations)
            .capability(Capability::SalesAnalytics)
            .capability(Capability::StaffRoles)
            .limit(LimitName::MaxMenus, LimitValue::Count(10))
            .limit(LimitName::MaxTables, LimitValue::Count(60))
            .limit(LimitName::MaxStaffAccounts, LimitValue::Count(15))
            .limit(LimitName::MaxMonthlyOrders, LimitValue::Count(5_000));

        // Premium has no self-serve trial; onboarding is sales-assisted.
        let premium = PricingPlan::new("premium", "Premium", 0)
            .price(RegionTier::Tier1, 11_900)
            .price(RegionTier::Tier2, 9_500)
            .price(RegionTier::Tier3, 6_900)
            .price(RegionTier::Tier4, 3_900)
            .capability(Capability::QrMenus)
            .capability(Capability::OnlineOrdering)
            .capability(Capability::KitchenDisplay)
            .capability(Capability::TableReservations)
            .capability(Capability::SalesAnalytics)
            .capability(Capability::CustomBranding)
            .capability(Capability::StaffRoles)
            .capability(Capability::ApiAccess)
            .limit(LimitName::MaxMenus, LimitValue::Unlimited)
            .limit(LimitName::MaxTables, LimitValue::Unlimited)
            .limit(LimitName::MaxStaffAccounts, LimitValue::Unlimited)
            .limit(LimitName::MaxMonthlyOrders, LimitValue::Unlimited);

        // Legacy plan from the 2023 launch; retired but still carried by
        // subscribers who never migrated.
        let classic = PricingPlan::new("classic", "Classic", 0)
            .price(RegionTier::Tier1, 4_900)
            .price(RegionTier::Tier2, 3_900)
            .price(RegionTier::Tier3, 2_900)
            .price(RegionTier::Tier4, 1_500)
            .capability(Capability::QrMenus)
            .capability(Capability::OnlineOrdering)
            .capability(Capability::KitchenDisplay)
            .limit(LimitName::MaxMenus, LimitValue::Count(5))
            .limit(LimitName::MaxTables, LimitValue::Count(30))
            .limit(LimitName::MaxStaffAccounts, LimitValue::Count(5))
            .limit(LimitName::MaxMonthlyOrders, LimitValue::Count(2_000))
            .retired();

        Self {
            plans: vec![starter, growth, premium, classic],
        }
    }

    /// Look up any plan, active or retired.
    pub fn get_plan(&self, id: &PlanId) -> Option<&PricingPlan> {
        self.plans.iter().find(|p| &p.id == id)
    }

    /// Plans currently offerable at checkout, priced for the given region.
    pub fn list_offerable(&self, region: RegionTier) -> Vec<OfferablePlan> {
        self.plans
            .iter()
            .filter(|p| p.is_active)
            .map(|p| OfferablePlan {
                plan: p.clone(),
                price: p.price_for(region),
            })
            .collect()
    }

    pub fn price_for(&self, id: &PlanId, region: RegionTier) -> BillingResult<PlanPrice> {
        let plan = self
            .get_plan(id)
            .ok_or_else(|| BillingError::NotFound(format!("plan '{}' not found", id)))?;
        Ok(plan.price_for(region))
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
