// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tably Billing Module
//!
//! Subscription, billing and entitlement core for the Tably platform.
//!
//! ## Features
//!
//! - **Plan Catalog**: pricing plans with regional price brackets,
//!   capability flags and resource limits
//! - **Payment Gateway Adapter**: one uniform port over card-network and
//!   wallet-style providers, with idempotent mutations
//! - **Entitlement Resolver**: the single capability/limit lookup every
//!   gated action goes through
//! - **Lifecycle Manager**: trial, conversion, renewal, payment failure,
//!   cancellation, reactivation, plan change
//! - **Billing Scheduler**: time-driven charges and past-due retries,
//!   resumable from persisted state
//! - **Webhook Processor**: authenticated, at-most-once reconciliation of
//!   provider events

pub mod catalog;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod lifecycle;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use sqlx::PgPool;

// Catalog
pub use catalog::{OfferablePlan, PlanCatalog, PlanPrice, PricingPlan};

// Config
pub use config::BillingConfig;

// Entitlement
pub use entitlement::{Entitlement, EntitlementResolver, EntitlementState};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType};

// Gateway
pub use gateway::{
    ChargeStatus, GatewayCharge, GatewayError, GatewayRegistry, MockGateway, PaymentGateway,
    PaymentMethodDescriptor, PaymentMethodKind, PaymentMethodToken, RawPaymentData, RecurringTerms,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{
    AppliedOutcome, ChargeDriveResult, ChargeOutcomeReport, CheckoutPreview, LifecycleManager,
    PaymentDetails, SignupRequest,
};

// Scheduler
pub use scheduler::{BillingScheduler, TickSummary};

// Store
pub use store::{
    AttemptClaim, AttemptOutcome, AttemptStore, BillingAttempt, EventStore, Store,
    SubscriptionStore, WebhookEventRecord,
};

// Subscription
pub use subscription::{ConsentRecord, Subscription, SubscriptionStatus, BILLING_CYCLE_DAYS};

// Webhooks
pub use webhooks::{GatewayEvent, GatewayEventData, WebhookProcessor};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: Arc<PlanCatalog>,
    pub gateways: GatewayRegistry,
    pub lifecycle: Arc<LifecycleManager>,
    pub entitlements: EntitlementResolver,
    pub scheduler: BillingScheduler,
    pub webhooks: WebhookProcessor,
    pub invariants: InvariantChecker,
    pub config: BillingConfig,
    store: Store,
}

impl BillingService {
    /// Create a billing service from environment variables, persisting to
    /// Postgres. A missing gateway configuration is a valid state: checkout
    /// will offer no payment methods until one is configured.
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(
            BillingConfig::from_env(),
            GatewayRegistry::from_env(),
            Store::postgres(pool),
        )
    }

    /// Create a billing service with explicit config, gateways and storage.
    pub fn new(config: BillingConfig, gateways: GatewayRegistry, store: Store) -> Self {
        let catalog = Arc::new(PlanCatalog::standard());
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            catalog.clone(),
            gateways.clone(),
            config.clone(),
        ));
        let entitlements = EntitlementResolver::new(
            store.subscriptions.clone(),
            catalog.clone(),
            config.grace,
        );
        let scheduler = BillingScheduler::new(lifecycle.clone());
        let webhooks = WebhookProcessor::new(store.clone(), lifecycle.clone(), config.clone());
        let invariants = InvariantChecker::new(store.clone());

        Self {
            catalog,
            gateways,
            lifecycle,
            entitlements,
            scheduler,
            webhooks,
            invariants,
            config,
            store,
        }
    }

    /// In-memory variant for tests and ephemeral deployments.
    pub fn in_memory(config: BillingConfig, gateways: GatewayRegistry) -> Self {
        Self::new(config, gateways, Store::in_memory())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
