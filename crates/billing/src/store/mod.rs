//! Storage layer
//!
//! Subscription, billing-attempt and event persistence behind repository
//! traits, with a Postgres implementation for production and an in-memory
//! implementation backing tests and ephemeral deployments. Everything the
//! scheduler needs to resume after a crash lives here; there are no
//! in-memory timers to lose.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tably_shared::{SubscriptionId, TenantId};

use crate::error::BillingResult;
use crate::events::BillingEvent;
use crate::subscription::Subscription;

/// Outcome of one charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptOutcome::Pending)
    }
}

/// A record of one charge attempt against the gateway.
///
/// The idempotency key is unique per (subscription, billing-cycle boundary)
/// and drives both retry policy and deduplication across scheduler re-runs
/// and duplicate webhook delivery.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingAttempt {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    pub idempotency_key: String,
    pub amount_cents: i64,
    pub currency: String,
    pub outcome: AttemptOutcome,
    pub failure_reason: Option<String>,
    pub attempted_at: OffsetDateTime,
}

impl BillingAttempt {
    pub fn pending(
        subscription_id: SubscriptionId,
        idempotency_key: String,
        amount_cents: i64,
        currency: String,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            idempotency_key,
            amount_cents,
            currency,
            outcome: AttemptOutcome::Pending,
            failure_reason: None,
            attempted_at: now,
        }
    }
}

/// Result of trying to claim an idempotency key for processing.
#[derive(Debug, Clone)]
pub enum AttemptClaim {
    /// The key was free (or stuck past the stale window) and is now ours.
    Claimed(BillingAttempt),
    /// Another worker holds a recent pending claim on this key.
    InFlight(BillingAttempt),
    /// The key already has a terminal outcome.
    Settled(BillingAttempt),
}

/// Processed gateway webhook events, for at-most-once handling.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    pub processing_started_at: OffsetDateTime,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, sub: &Subscription) -> BillingResult<()>;

    async fn get(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>>;

    /// The tenant's current subscription: the most recently created one.
    /// Replaced (canceled/expired) rows stay behind as history.
    async fn current_for_tenant(&self, tenant: TenantId) -> BillingResult<Option<Subscription>>;

    async fn get_by_gateway_ref(&self, external_ref: &str) -> BillingResult<Option<Subscription>>;

    /// Optimistic write: persists `sub` only if the stored row still carries
    /// `expected_version`. `sub.version` must already be bumped past it.
    async fn update(&self, sub: &Subscription, expected_version: i64) -> BillingResult<()>;

    /// Trialing/active subscriptions whose boundary has passed.
    async fn list_due(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    async fn list_past_due(&self) -> BillingResult<Vec<Subscription>>;

    async fn list_all(&self) -> BillingResult<Vec<Subscription>>;

    /// Whether the tenant has ever consumed its one-time trial grant.
    async fn trial_used(&self, tenant: TenantId) -> BillingResult<bool>;

    async fn mark_trial_used(&self, tenant: TenantId) -> BillingResult<()>;
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Atomically claim `attempt.idempotency_key`. Exactly one concurrent
    /// caller receives `Claimed`; the rest observe `InFlight` or `Settled`.
    /// A pending claim older than `stale_after` is re-claimable, which lets
    /// a crashed worker's attempt be resumed.
    async fn claim(
        &self,
        attempt: &BillingAttempt,
        stale_after: Duration,
        now: OffsetDateTime,
    ) -> BillingResult<AttemptClaim>;

    async fn record_outcome(
        &self,
        idempotency_key: &str,
        outcome: AttemptOutcome,
        failure_reason: Option<&str>,
    ) -> BillingResult<()>;

    async fn get_by_key(&self, idempotency_key: &str) -> BillingResult<Option<BillingAttempt>>;

    async fn list_for_subscription(
        &self,
        id: SubscriptionId,
    ) -> BillingResult<Vec<BillingAttempt>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &BillingEvent) -> BillingResult<()>;

    async fn list_for_tenant(
        &self,
        tenant: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>>;

    /// Atomically claim a webhook event id for processing. Returns false if
    /// the event was already processed or is being processed by another
    /// worker within the stale window.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        stale_after: Duration,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: &str,
        error: Option<&str>,
    ) -> BillingResult<()>;

    async fn purge_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;
}

/// The three repositories bundled for handing around services.
#[derive(Clone)]
pub struct Store {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub attempts: Arc<dyn AttemptStore>,
    pub events: Arc<dyn EventStore>,
}

impl Store {
    pub fn postgres(pool: PgPool) -> Self {
        let backend = Arc::new(postgres::PgStore::new(pool));
        Self {
            subscriptions: backend.clone(),
            attempts: backend.clone(),
            events: backend,
        }
    }

    pub fn in_memory() -> Self {
        let backend = Arc::new(memory::MemoryStore::new());
        Self {
            subscriptions: backend.clone(),
            attempts: backend.clone(),
            events: backend,
        }
    }
}
