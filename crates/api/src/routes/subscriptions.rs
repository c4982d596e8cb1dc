//! Subscription and entitlement routes

use axum::{
    extract::{Extension, State},
    Json,
};
use estate_billing::{
    CancellationWindow, HostedSession, InvoiceSummary, PlanCatalog, PlanLimits, TenantSubscription,
};
use estate_shared::PlanTier;
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthTenant,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub tier: PlanTier,
    pub name: &'static str,
    pub limits: PlanLimits,
    /// Processor price ids that map to this tier
    pub price_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub table_version: u32,
    pub plans: Vec<PlanResponse>,
}

/// GET /api/v1/subscriptions/plans
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<PlansResponse>> {
    let billing = state.billing_service()?;
    let catalog = &billing.catalog;

    let plans = PlanTier::ALL
        .iter()
        .map(|&tier| PlanResponse {
            tier,
            name: tier.display_name(),
            limits: PlanCatalog::limits_for(tier),
            price_ids: catalog
                .references_for(tier)
                .into_iter()
                .map(String::from)
                .collect(),
        })
        .collect();

    Ok(Json(PlansResponse {
        table_version: catalog.table_version(),
        plans,
    }))
}

#[derive(Debug, Serialize)]
pub struct CurrentSubscriptionResponse {
    pub tier: PlanTier,
    pub subscription: Option<TenantSubscription>,
}

/// GET /api/v1/subscriptions/me
pub async fn current_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthTenant>,
) -> ApiResult<Json<CurrentSubscriptionResponse>> {
    let billing = state.billing_service()?;
    let entitlement = billing.entitlements.current_entitlement(auth.tenant_id).await?;

    Ok(Json(CurrentSubscriptionResponse {
        tier: entitlement.tier,
        subscription: entitlement.subscription,
    }))
}

/// POST /api/v1/subscriptions/cancel
///
/// Schedules cancellation at period end with the processor, then records it.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthTenant>,
) -> ApiResult<Json<CancellationWindow>> {
    let billing = state.billing_service()?;
    let window = billing
        .reconciler
        .request_cancellation(auth.tenant_id)
        .await?;

    tracing::info!(
        tenant_id = %auth.tenant_id,
        period_end = %window.period_end,
        days_remaining = window.days_remaining,
        "Tenant cancelled subscription"
    );
    Ok(Json(window))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    pub price_id: String,
}

/// POST /api/v1/subscriptions/checkout
///
/// Returns the hosted checkout URL. The subscription is recorded when the
/// completion webhook arrives, not here.
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthTenant>,
    Json(body): Json<CheckoutBody>,
) -> ApiResult<Json<HostedSession>> {
    let billing = state.billing_service()?;
    if body.price_id.trim().is_empty() {
        return Err(ApiError::Validation("price_id is required".to_string()));
    }

    let session = billing
        .checkout
        .start_checkout(auth.tenant_id, &body.price_id)
        .await?;
    Ok(Json(session))
}

/// POST /api/v1/subscriptions/portal
pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthTenant>,
) -> ApiResult<Json<HostedSession>> {
    let billing = state.billing_service()?;
    let session = billing.checkout.portal_session(auth.tenant_id).await?;
    Ok(Json(session))
}

#[derive(Debug, Serialize)]
pub struct InvoicesResponse {
    pub invoices: Vec<InvoiceSummary>,
}

/// GET /api/v1/subscriptions/invoices
pub async fn list_invoices(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthTenant>,
) -> ApiResult<Json<InvoicesResponse>> {
    let billing = state.billing_service()?;
    let invoices = billing.checkout.invoices(auth.tenant_id).await?;
    Ok(Json(InvoicesResponse { invoices }))
}

#[derive(Debug, Serialize)]
pub struct EntitlementsResponse {
    pub tier: PlanTier,
    pub limits: PlanLimits,
    pub listing_count: u32,
    pub listings_remaining: u32,
}

/// GET /api/v1/entitlements
pub async fn entitlements(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthTenant>,
) -> ApiResult<Json<EntitlementsResponse>> {
    let billing = state.billing_service()?;
    let entitlement = billing.entitlements.current_entitlement(auth.tenant_id).await?;
    let listing_count = billing.quota.listing_usage(auth.tenant_id).await?;

    Ok(Json(EntitlementsResponse {
        tier: entitlement.tier,
        limits: entitlement.limits,
        listing_count,
        listings_remaining: entitlement.limits.max_listings.saturating_sub(listing_count),
    }))
}
