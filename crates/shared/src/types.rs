//! Common types used across Tably

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant (restaurant account) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pricing plan identifier (stable slug, e.g. "starter")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlanId {
    fn from(slug: &str) -> Self {
        Self(slug.to_string())
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// A plan-gated product capability.
///
/// Every feature gate in the platform goes through this enum and the
/// entitlement resolver; call sites never test plan names directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// QR-code menus for dine-in guests
    QrMenus,
    /// Online ordering storefront
    OnlineOrdering,
    /// Kitchen display screen
    KitchenDisplay,
    /// Table reservation management
    TableReservations,
    /// Sales and menu analytics dashboards
    SalesAnalytics,
    /// Custom branding (logo, colors, domain)
    CustomBranding,
    /// Staff accounts with role-based access
    StaffRoles,
    /// Public API access
    ApiAccess,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::QrMenus,
        Capability::OnlineOrdering,
        Capability::KitchenDisplay,
        Capability::TableReservations,
        Capability::SalesAnalytics,
        Capability::CustomBranding,
        Capability::StaffRoles,
        Capability::ApiAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::QrMenus => "qr_menus",
            Capability::OnlineOrdering => "online_ordering",
            Capability::KitchenDisplay => "kitchen_display",
            Capability::TableReservations => "table_reservations",
            Capability::SalesAnalytics => "sales_analytics",
            Capability::CustomBranding => "custom_branding",
            Capability::StaffRoles => "staff_roles",
            Capability::ApiAccess => "api_access",
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qr_menus" => Ok(Capability::QrMenus),
            "online_ordering" => Ok(Capability::OnlineOrdering),
            "kitchen_display" => Ok(Capability::KitchenDisplay),
            "table_reservations" => Ok(Capability::TableReservations),
            "sales_analytics" => Ok(Capability::SalesAnalytics),
            "custom_branding" => Ok(Capability::CustomBranding),
            "staff_roles" => Ok(Capability::StaffRoles),
            "api_access" => Ok(Capability::ApiAccess),
            other => Err(format!("unknown capability '{}'", other)),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Limits
// =============================================================================

/// A plan-gated numeric resource limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitName {
    MaxMenus,
    MaxTables,
    MaxStaffAccounts,
    MaxMonthlyOrders,
}

impl LimitName {
    pub const ALL: [LimitName; 4] = [
        LimitName::MaxMenus,
        LimitName::MaxTables,
        LimitName::MaxStaffAccounts,
        LimitName::MaxMonthlyOrders,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitName::MaxMenus => "max_menus",
            LimitName::MaxTables => "max_tables",
            LimitName::MaxStaffAccounts => "max_staff_accounts",
            LimitName::MaxMonthlyOrders => "max_monthly_orders",
        }
    }
}

impl std::str::FromStr for LimitName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_menus" => Ok(LimitName::MaxMenus),
            "max_tables" => Ok(LimitName::MaxTables),
            "max_staff_accounts" => Ok(LimitName::MaxStaffAccounts),
            "max_monthly_orders" => Ok(LimitName::MaxMonthlyOrders),
            other => Err(format!("unknown limit '{}'", other)),
        }
    }
}

impl std::fmt::Display for LimitName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A resolved limit value: a concrete count or unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitValue {
    Count(u64),
    Unlimited,
}

impl LimitValue {
    /// Zero, the value returned for unentitled tenants.
    pub const ZERO: LimitValue = LimitValue::Count(0);

    pub fn is_unlimited(&self) -> bool {
        matches!(self, LimitValue::Unlimited)
    }

    /// Whether `used` more units fit under this limit.
    pub fn allows(&self, used: u64) -> bool {
        match self {
            LimitValue::Unlimited => true,
            LimitValue::Count(max) => used < *max,
        }
    }
}

impl std::fmt::Display for LimitValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitValue::Count(n) => write!(f, "{}", n),
            LimitValue::Unlimited => write!(f, "unlimited"),
        }
    }
}

// =============================================================================
// Region tiers
// =============================================================================

/// Regional price bracket.
///
/// Every country code maps to one of four brackets; `Tier4` is the lowest
/// price point and the fallback for unmapped codes, so checkout always has a
/// price to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RegionTier {
    Tier1,
    Tier2,
    Tier3,
    Tier4,
}

impl RegionTier {
    pub const ALL: [RegionTier; 4] = [
        RegionTier::Tier1,
        RegionTier::Tier2,
        RegionTier::Tier3,
        RegionTier::Tier4,
    ];

    /// The lowest-price bracket, used when a region code is unmapped.
    pub const LOWEST: RegionTier = RegionTier::Tier4;

    /// Map an ISO 3166-1 alpha-2 country code to its price bracket.
    ///
    /// Unmapped codes fall back to the lowest bracket rather than failing.
    pub fn for_country(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            // North America, Western Europe, Oceania, rich Asia-Pacific
            "US" | "CA" | "GB" | "IE" | "DE" | "FR" | "NL" | "BE" | "LU" | "AT" | "CH" | "SE"
            | "NO" | "DK" | "FI" | "IS" | "AU" | "NZ" | "JP" | "SG" => RegionTier::Tier1,
            // Southern/Eastern EU, Gulf states, East Asia
            "ES" | "PT" | "IT" | "GR" | "CY" | "MT" | "SI" | "CZ" | "SK" | "EE" | "LV" | "LT"
            | "PL" | "HU" | "HR" | "AE" | "SA" | "QA" | "KW" | "BH" | "OM" | "KR" | "TW"
            | "HK" | "IL" => RegionTier::Tier2,
            // Larger middle-income markets
            "BR" | "MX" | "AR" | "CL" | "CO" | "PE" | "UY" | "TR" | "RO" | "BG" | "RS" | "ZA"
            | "MY" | "TH" | "CN" | "RU" => RegionTier::Tier3,
            // Everything else, including unmapped codes
            _ => RegionTier::Tier4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegionTier::Tier1 => "tier1",
            RegionTier::Tier2 => "tier2",
            RegionTier::Tier3 => "tier3",
            RegionTier::Tier4 => "tier4",
        }
    }
}

impl std::fmt::Display for RegionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
