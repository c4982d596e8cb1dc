//! Billing error types

use estate_shared::TenantId;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised by the entitlement and reconciliation engine
///
/// Quota denials are not errors; see [`crate::quota::GateDecision`].
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Webhook payload failed authentication. The sender should not retry.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Webhook payload was signed but could not be interpreted
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    /// Event refers to a subscription this system has not recorded yet
    #[error("Unknown subscription reference: {external_subscription_id}")]
    UnknownSubscriptionReference { external_subscription_id: String },

    /// The payment processor rejected or failed an outbound call
    #[error("Payment processor error during {operation}: {message}")]
    ExternalProcessor { operation: String, message: String },

    /// The subscription store could not be read while resolving a tier
    #[error("Entitlement unavailable for tenant {tenant_id}: {message}")]
    EntitlementUnavailable { tenant_id: TenantId, message: String },

    /// Requested price does not map to a paid plan
    #[error("Unknown price: {0}")]
    UnknownPrice(String),

    #[error("No active subscription for tenant {0}")]
    NoActiveSubscription(TenantId),

    #[error("Subscription for tenant {0} is already scheduled for cancellation")]
    AlreadyCancelling(TenantId),

    /// Conditional update lost the race too many times
    #[error("Concurrent modification of subscription {external_subscription_id}")]
    ConcurrentModification { external_subscription_id: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Notification delivery failed: {0}")]
    Notification(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl BillingError {
    /// Whether the sender of the triggering request should try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::UnknownSubscriptionReference { .. }
                | BillingError::ExternalProcessor { .. }
                | BillingError::EntitlementUnavailable { .. }
                | BillingError::ConcurrentModification { .. }
                | BillingError::Database(_)
        )
    }

    /// Stable machine-readable code surfaced to API clients
    pub fn reason_code(&self) -> &'static str {
        match self {
            BillingError::InvalidSignature => "INVALID_SIGNATURE",
            BillingError::InvalidPayload(_) => "INVALID_PAYLOAD",
            BillingError::UnknownSubscriptionReference { .. } => "UNKNOWN_SUBSCRIPTION",
            BillingError::ExternalProcessor { .. } => "PROCESSOR_ERROR",
            BillingError::EntitlementUnavailable { .. } => "ENTITLEMENT_UNAVAILABLE",
            BillingError::UnknownPrice(_) => "UNKNOWN_PRICE",
            BillingError::NoActiveSubscription(_) => "NO_ACTIVE_SUBSCRIPTION",
            BillingError::AlreadyCancelling(_) => "ALREADY_CANCELLING",
            BillingError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::Config(_) => "CONFIG_ERROR",
            BillingError::Notification(_) => "NOTIFICATION_ERROR",
        }
    }

    pub(crate) fn unavailable(tenant_id: TenantId, source: &BillingError) -> Self {
        BillingError::EntitlementUnavailable {
            tenant_id,
            message: source.to_string(),
        }
    }

    pub(crate) fn processor(operation: &str, message: impl Into<String>) -> Self {
        BillingError::ExternalProcessor {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let unknown = BillingError::UnknownSubscriptionReference {
            external_subscription_id: "sub_1".to_string(),
        };
        assert!(unknown.is_retryable());
        assert_eq!(unknown.reason_code(), "UNKNOWN_SUBSCRIPTION");

        assert!(!BillingError::InvalidSignature.is_retryable());
        assert!(!BillingError::AlreadyCancelling(TenantId::new()).is_retryable());
    }

    #[test]
    fn test_unavailable_wraps_source_message() {
        let tenant = TenantId::new();
        let err = BillingError::unavailable(tenant, &BillingError::Database("timeout".into()));
        match err {
            BillingError::EntitlementUnavailable { tenant_id, message } => {
                assert_eq!(tenant_id, tenant);
                assert!(message.contains("timeout"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
