//! HTTP routes

pub mod checkout;
pub mod entitlements;
pub mod plans;
pub mod subscription;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/plans", get(plans::list_plans))
        .route(
            "/api/capabilities/{name}",
            get(entitlements::check_capability),
        )
        .route("/api/limits/{name}", get(entitlements::check_limit))
        .route("/api/checkout", post(checkout::initiate_checkout))
        .route("/api/signup", post(checkout::signup))
        .route("/api/subscription", get(subscription::subscription_info))
        .route("/api/subscription/plan", post(subscription::change_plan))
        .route("/api/subscription/cancel", post(subscription::cancel))
        .route(
            "/api/subscription/reactivate",
            post(subscription::reactivate),
        )
        .route("/api/webhooks/{provider}", post(webhooks::receive_webhook))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use tably_billing::{BillingConfig, BillingService, GatewayRegistry};
    use tably_shared::TenantId;

    use crate::state::AppState;

    fn test_app() -> axum::Router {
        let billing = BillingService::in_memory(BillingConfig::default(), GatewayRegistry::empty());
        super::create_router(AppState::for_tests(billing))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_plans_listing_excludes_retired_plans() {
        let app = test_app();
        let response = app
            .oneshot(
                Request::get("/api/plans?country=US")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let plans = body["plans"].as_array().unwrap();
        assert!(!plans.is_empty());
        assert!(plans.iter().all(|p| p["id"] != "classic"));
        assert_eq!(body["region_tier"], "tier1");
    }

    #[tokio::test]
    async fn test_plans_listing_unmapped_country_still_prices() {
        let app = test_app();
        let response = app
            .oneshot(
                Request::get("/api/plans?country=ZZ")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["region_tier"], "tier4");
        for plan in body["plans"].as_array().unwrap() {
            assert!(plan["price_cents"].as_i64().unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn test_capability_check_without_subscription_is_false() {
        let app = test_app();
        let tenant = TenantId::new();
        let response = app
            .oneshot(
                Request::get("/api/capabilities/kitchen_display")
                    .header("x-tenant-id", tenant.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["enabled"], false);
    }

    #[tokio::test]
    async fn test_capability_check_requires_tenant_header() {
        let app = test_app();
        let response = app
            .oneshot(
                Request::get("/api/capabilities/kitchen_display")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_capability_name_is_bad_request() {
        let app = test_app();
        let tenant = TenantId::new();
        let response = app
            .oneshot(
                Request::get("/api/capabilities/free_lunch")
                    .header("x-tenant-id", tenant.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_checkout_without_gateway_returns_empty_methods() {
        let app = test_app();
        let tenant = TenantId::new();
        let response = app
            .oneshot(
                Request::post("/api/checkout")
                    .header("x-tenant-id", tenant.to_string())
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"plan_id":"starter","country":"US"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["payment_methods"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_webhook_with_bad_signature_is_rejected() {
        let app = test_app();
        let response = app
            .oneshot(
                Request::post("/api/webhooks/cardwire")
                    .header("x-gateway-signature", "t=1,v1=deadbeef")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":"evt_1","type":"charge.succeeded","created":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_subscription_info_without_subscription_is_404() {
        let app = test_app();
        let tenant = TenantId::new();
        let response = app
            .oneshot(
                Request::get("/api/subscription")
                    .header("x-tenant-id", tenant.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
