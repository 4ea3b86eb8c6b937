//! Billing event log
//!
//! Append-only audit trail of lifecycle transitions and gateway outcomes.
//! Logging failures are reported to the caller but never block the
//! transition they describe; call sites downgrade them to warnings.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use tably_shared::TenantId;

use crate::error::BillingResult;
use crate::store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    SubscriptionCreated,
    TrialStarted,
    TrialConverted,
    RenewalSucceeded,
    PaymentFailed,
    SubscriptionPastDue,
    SubscriptionExpired,
    SubscriptionCanceled,
    CancellationScheduled,
    SubscriptionReactivated,
    PlanChanged,
    PlanResynced,
    ChargeDisputed,
    RecurringCanceledByProvider,
    OutcomeCorrectedByProvider,
    WebhookRejected,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionCreated => "subscription_created",
            BillingEventType::TrialStarted => "trial_started",
            BillingEventType::TrialConverted => "trial_converted",
            BillingEventType::RenewalSucceeded => "renewal_succeeded",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::SubscriptionPastDue => "subscription_past_due",
            BillingEventType::SubscriptionExpired => "subscription_expired",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::CancellationScheduled => "cancellation_scheduled",
            BillingEventType::SubscriptionReactivated => "subscription_reactivated",
            BillingEventType::PlanChanged => "plan_changed",
            BillingEventType::PlanResynced => "plan_resynced",
            BillingEventType::ChargeDisputed => "charge_disputed",
            BillingEventType::RecurringCanceledByProvider => "recurring_canceled_by_provider",
            BillingEventType::OutcomeCorrectedByProvider => "outcome_corrected_by_provider",
            BillingEventType::WebhookRejected => "webhook_rejected",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who caused a billing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    System,
    Tenant,
    Gateway,
    Admin,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub event_type: BillingEventType,
    pub data: serde_json::Value,
    pub actor_type: ActorType,
    /// Gateway event id when the actor is the gateway.
    pub gateway_event_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Builder for billing events; pass to [`BillingEventLogger::log_event`].
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    tenant_id: TenantId,
    event_type: BillingEventType,
    data: serde_json::Value,
    actor_type: ActorType,
    gateway_event_id: Option<String>,
}

impl BillingEventBuilder {
    pub fn new(tenant_id: TenantId, event_type: BillingEventType) -> Self {
        Self {
            tenant_id,
            event_type,
            data: serde_json::Value::Null,
            actor_type: ActorType::System,
            gateway_event_id: None,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor_type = actor;
        self
    }

    pub fn gateway_event(mut self, event_id: &str) -> Self {
        self.gateway_event_id = Some(event_id.to_string());
        self
    }

    fn build(self, now: OffsetDateTime) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            event_type: self.event_type,
            data: self.data,
            actor_type: self.actor_type,
            gateway_event_id: self.gateway_event_id,
            created_at: now,
        }
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn EventStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<()> {
        let event = builder.build(OffsetDateTime::now_utc());
        self.store.append(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let event = BillingEventBuilder::new(TenantId::new(), BillingEventType::TrialStarted)
            .build(OffsetDateTime::UNIX_EPOCH);
        assert_eq!(event.actor_type, ActorType::System);
        assert!(event.gateway_event_id.is_none());
        assert_eq!(event.data, serde_json::Value::Null);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(
            BillingEventType::SubscriptionPastDue.as_str(),
            "subscription_past_due"
        );
        assert_eq!(BillingEventType::PlanChanged.to_string(), "plan_changed");
    }
}
