//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use estate_billing::{BillingError, DenialReason};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Billing is disabled")]
    BillingDisabled,
    #[error("Quota exceeded")]
    QuotaExceeded(DenialReason),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::BillingDisabled => (StatusCode::SERVICE_UNAVAILABLE, "BILLING_DISABLED"),
            ApiError::QuotaExceeded(_) => (StatusCode::FORBIDDEN, "QUOTA_EXCEEDED"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Billing(err) => {
                let status = match err {
                    BillingError::InvalidSignature
                    | BillingError::InvalidPayload(_)
                    | BillingError::UnknownPrice(_) => StatusCode::BAD_REQUEST,
                    // 404 makes the processor redeliver later
                    BillingError::UnknownSubscriptionReference { .. } => StatusCode::NOT_FOUND,
                    BillingError::ExternalProcessor { .. } => StatusCode::BAD_GATEWAY,
                    BillingError::EntitlementUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    BillingError::NoActiveSubscription(_) => StatusCode::NOT_FOUND,
                    BillingError::AlreadyCancelling(_) => StatusCode::CONFLICT,
                    BillingError::ConcurrentModification { .. }
                    | BillingError::Database(_)
                    | BillingError::Config(_)
                    | BillingError::Notification(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.reason_code())
            }
        }
    }

    /// Message safe to show a client; internals stay in the logs
    fn public_message(&self) -> String {
        match self {
            ApiError::Billing(
                BillingError::Database(_) | BillingError::Config(_) | BillingError::Notification(_),
            )
            | ApiError::Internal(_) => "Internal server error".to_string(),
            ApiError::Billing(BillingError::ExternalProcessor { operation, .. }) => {
                format!("Payment processor request failed during {}", operation)
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(code = code, error = %self, "Request failed");
        }

        let body = match &self {
            ApiError::QuotaExceeded(reason) => json!({
                "error": "Plan limit reached",
                "code": code,
                "resource": reason.resource,
                "current_count": reason.current_count,
                "limit": reason.limit,
                "tier": reason.tier,
            }),
            _ => json!({
                "error": self.public_message(),
                "code": code,
            }),
        };

        (status, Json(body)).into_response()
    }
}
