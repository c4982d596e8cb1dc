//! Payment processor webhook endpoint
//!
//! Takes the raw body so the signature is checked against the exact bytes
//! the processor signed.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use estate_billing::{BillingError, WebhookOutcome};
use serde_json::{json, Value};

use crate::{error::ApiResult, state::AppState};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /api/v1/billing/webhook
///
/// 200 for applied, ignored and already-processed events. 404 when the event
/// names a subscription not recorded yet and 502 when the processor could not
/// be asked for a checkout's price; both make the processor redeliver later.
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let billing = state.billing_service()?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request without signature header");
            BillingError::InvalidSignature
        })?;

    let outcome = billing.webhooks.process(&body, signature).await?;

    let label = match outcome {
        WebhookOutcome::Processed(_) => "processed",
        WebhookOutcome::Ignored => "ignored",
        WebhookOutcome::AlreadyProcessed => "already_processed",
    };

    Ok(Json(json!({ "received": true, "outcome": label })))
}
