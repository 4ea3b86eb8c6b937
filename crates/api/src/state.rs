//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use tably_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        // A missing gateway configuration is a valid deployment state: the
        // service starts and checkout offers no payment methods.
        let billing = Arc::new(BillingService::from_env(pool));
        if billing.gateways.is_empty() {
            tracing::warn!("billing running without a payment gateway");
        } else {
            tracing::info!(
                providers = ?billing
                    .gateways
                    .available_methods()
                    .iter()
                    .map(|m| m.provider)
                    .collect::<Vec<_>>(),
                "billing service initialized"
            );
        }

        Self { config, billing }
    }

    /// State for tests: in-memory storage and an explicit gateway registry.
    pub fn for_tests(billing: BillingService) -> Self {
        Self {
            config: Config {
                database_url: String::new(),
                bind_address: "127.0.0.1:0".to_string(),
            },
            billing: Arc::new(billing),
        }
    }
}
