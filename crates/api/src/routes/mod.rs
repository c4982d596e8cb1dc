//! HTTP routes

pub mod quota;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod route_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/subscriptions/me", get(subscriptions::current_subscription))
        .route("/subscriptions/cancel", post(subscriptions::cancel_subscription))
        .route("/subscriptions/checkout", post(subscriptions::create_checkout))
        .route("/subscriptions/portal", post(subscriptions::create_portal_session))
        .route("/subscriptions/invoices", get(subscriptions::list_invoices))
        .route("/entitlements", get(subscriptions::entitlements))
        .route("/quota/listings", get(quota::check_listing_quota))
        .route(
            "/quota/listings/{listing_id}/images",
            get(quota::check_image_quota),
        )
        .route("/quota/features/{feature}", get(quota::check_feature))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    let public = Router::new()
        .route("/billing/webhook", post(webhooks::billing_webhook))
        .route("/subscriptions/plans", get(subscriptions::list_plans));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", public.merge(protected))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
