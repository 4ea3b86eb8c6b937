//! Shared types for Tably
//!
//! Vocabulary used across the platform: tenant/plan/subscription identifiers,
//! plan-gated capabilities, resource limits, and regional price tiers.

pub mod types;

pub use types::{
    Capability, LimitName, LimitValue, PlanId, RegionTier, SubscriptionId, TenantId,
};
