// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Tably API Library
//!
//! HTTP surface over the billing core: plan listing, capability checks,
//! checkout/signup, subscription management and the gateway webhook
//! endpoint. Session handling and page rendering live elsewhere; tenant
//! identity arrives pre-authenticated.

pub mod config;
pub mod error;
pub mod extract;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
