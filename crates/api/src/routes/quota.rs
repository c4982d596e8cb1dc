//! Quota pre-checks for the listing, image and feature handlers

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use estate_billing::{FailurePolicy, GateDecision};
use estate_shared::{FeatureFlag, ListingId};
use uuid::Uuid;

use crate::{
    auth::AuthTenant,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Turn a denial into 403 with the upgrade-prompt payload
fn into_response(decision: GateDecision) -> ApiResult<Json<GateDecision>> {
    match decision.reason {
        Some(reason) if !decision.allowed => Err(ApiError::QuotaExceeded(reason)),
        _ => Ok(Json(decision)),
    }
}

/// GET /api/v1/quota/listings
pub async fn check_listing_quota(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthTenant>,
) -> ApiResult<Json<GateDecision>> {
    let billing = state.billing_service()?;
    let decision =
        FailurePolicy::FailClosed.apply(billing.quota.can_create_listing(auth.tenant_id).await)?;
    into_response(decision)
}

/// GET /api/v1/quota/listings/{listing_id}/images
pub async fn check_image_quota(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthTenant>,
    Path(listing_id): Path<Uuid>,
) -> ApiResult<Json<GateDecision>> {
    let billing = state.billing_service()?;
    let decision = FailurePolicy::FailClosed.apply(
        billing
            .quota
            .can_add_image(auth.tenant_id, ListingId::from(listing_id))
            .await,
    )?;
    into_response(decision)
}

/// GET /api/v1/quota/features/{feature}
pub async fn check_feature(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthTenant>,
    Path(feature): Path<String>,
) -> ApiResult<Json<GateDecision>> {
    let feature: FeatureFlag = feature
        .parse()
        .map_err(|e: estate_shared::ParseEnumError| ApiError::Validation(e.to_string()))?;

    let billing = state.billing_service()?;
    let decision =
        FailurePolicy::FailClosed.apply(billing.quota.can_use_feature(auth.tenant_id, feature).await)?;
    into_response(decision)
}
