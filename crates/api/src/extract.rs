//! Request extractors
//!
//! Tenant identity arrives pre-authenticated from the session layer, which
//! is outside this crate; routes read it from the `X-Tenant-Id` header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use tably_shared::TenantId;

use crate::error::ApiError;

/// Authenticated tenant extracted from `X-Tenant-Id`.
#[derive(Debug, Clone, Copy)]
pub struct AuthTenant(pub TenantId);

impl<S> FromRequestParts<S> for AuthTenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-tenant-id")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let id: Uuid = header.parse().map_err(|_| ApiError::Unauthorized)?;
        Ok(AuthTenant(TenantId(id)))
    }
}

/// Best-effort client IP for consent records.
pub fn client_ip(parts: &axum::http::HeaderMap) -> String {
    parts
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
