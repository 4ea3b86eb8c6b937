//! Billing configuration
//!
//! Everything tunable about the billing core, loaded from the environment in
//! the binaries. Gateway credentials are read by the gateway registry; this
//! struct carries the policy knobs and webhook secrets.

use std::collections::HashMap;

use time::Duration;

/// Policy configuration for the billing core.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Grace window during which a past-due subscription keeps entitlements.
    pub grace: Duration,
    /// Failed charge attempts allowed beyond the initial failure before the
    /// subscription expires.
    pub max_retries: i32,
    /// Delay after `past_due_since` before each retry attempt.
    pub retry_backoff: Vec<Duration>,
    /// How long a pending billing attempt may sit before another worker can
    /// take it over (crashed-worker recovery).
    pub attempt_stale_after: Duration,
    /// Whether trial signup is allowed with no payment gateway configured.
    /// Explicit opt-in; never an accidental fallback.
    pub trial_without_gateway: bool,
    /// Webhook signing secrets keyed by provider slug.
    pub webhook_secrets: HashMap<String, String>,
    /// Accepted clock skew on webhook signatures.
    pub webhook_tolerance: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace: Duration::days(7),
            max_retries: 3,
            retry_backoff: vec![Duration::days(1), Duration::days(2), Duration::days(4)],
            attempt_stale_after: Duration::minutes(30),
            trial_without_gateway: false,
            webhook_secrets: HashMap::new(),
            webhook_tolerance: Duration::minutes(5),
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("TRIAL_WITHOUT_GATEWAY") {
            config.trial_without_gateway = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(days) = env_i64("BILLING_GRACE_DAYS") {
            config.grace = Duration::days(days);
        }
        if let Some(n) = env_i64("BILLING_MAX_RETRIES") {
            config.max_retries = n as i32;
        }

        if let Ok(secret) = std::env::var("CARDWIRE_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                config.webhook_secrets.insert("cardwire".to_string(), secret);
            }
        }
        if let Ok(secret) = std::env::var("PAYVAULT_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                config.webhook_secrets.insert("payvault".to_string(), secret);
            }
        }

        config
    }

    /// Delay before retry number `retry` (1-based), counted from
    /// `past_due_since`. Past the configured schedule the last step repeats.
    pub fn retry_delay(&self, retry: i32) -> Duration {
        let idx = (retry.max(1) as usize - 1).min(self.retry_backoff.len().saturating_sub(1));
        self.retry_backoff
            .get(idx)
            .copied()
            .unwrap_or(Duration::days(1))
    }
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_schedule() {
        let config = BillingConfig::default();
        assert_eq!(config.retry_delay(1), Duration::days(1));
        assert_eq!(config.retry_delay(2), Duration::days(2));
        assert_eq!(config.retry_delay(3), Duration::days(4));
        // Beyond the schedule the last step repeats.
        assert_eq!(config.retry_delay(9), Duration::days(4));
    }
}
