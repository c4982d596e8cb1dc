//! Tenant-facing processor sessions
//!
//! Starting a checkout, opening the customer portal and reading invoice
//! history. None of these write subscription records; a completed checkout
//! only takes effect once its webhook is reconciled.

use std::sync::Arc;

use estate_shared::TenantId;

use crate::catalog::PlanCatalog;
use crate::client::{CheckoutRequest, HostedSession, InvoiceSummary, PaymentProcessor};
use crate::error::{BillingError, BillingResult};
use crate::storage::SubscriptionStore;

/// Where the processor sends the tenant back to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
    pub portal_return_url: String,
}

impl Default for CheckoutUrls {
    fn default() -> Self {
        Self {
            success_url: "http://localhost:3000/settings/subscription?checkout=success".to_string(),
            cancel_url: "http://localhost:3000/settings/subscription?checkout=cancelled".to_string(),
            portal_return_url: "http://localhost:3000/settings/subscription".to_string(),
        }
    }
}

impl CheckoutUrls {
    /// Read `CHECKOUT_SUCCESS_URL`, `CHECKOUT_CANCEL_URL` and `PORTAL_RETURN_URL`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, fallback: String| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(fallback)
        };
        Self {
            success_url: var("CHECKOUT_SUCCESS_URL", defaults.success_url),
            cancel_url: var("CHECKOUT_CANCEL_URL", defaults.cancel_url),
            portal_return_url: var("PORTAL_RETURN_URL", defaults.portal_return_url),
        }
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    catalog: Arc<PlanCatalog>,
    store: Arc<dyn SubscriptionStore>,
    processor: Arc<dyn PaymentProcessor>,
    urls: CheckoutUrls,
}

impl CheckoutService {
    pub fn new(
        catalog: Arc<PlanCatalog>,
        store: Arc<dyn SubscriptionStore>,
        processor: Arc<dyn PaymentProcessor>,
        urls: CheckoutUrls,
    ) -> Self {
        Self {
            catalog,
            store,
            processor,
            urls,
        }
    }

    pub fn with_urls(mut self, urls: CheckoutUrls) -> Self {
        self.urls = urls;
        self
    }

    /// Hosted checkout for a paid price. The session carries the tenant id as
    /// `client_reference_id` and the price id in its metadata.
    pub async fn start_checkout(
        &self,
        tenant_id: TenantId,
        price_id: &str,
    ) -> BillingResult<HostedSession> {
        let price_id = price_id.trim();
        if !self.catalog.tier_from_external_reference(price_id).is_paid() {
            tracing::warn!(
                tenant_id = %tenant_id,
                price_id = %price_id,
                "Checkout requested for a price with no paid plan"
            );
            return Err(BillingError::UnknownPrice(price_id.to_string()));
        }

        let customer_email = self
            .store
            .tenant_contact(tenant_id)
            .await?
            .map(|contact| contact.email);

        self.processor
            .create_checkout_session(&CheckoutRequest {
                tenant_id,
                price_id: price_id.to_string(),
                customer_email,
                success_url: self.urls.success_url.clone(),
                cancel_url: self.urls.cancel_url.clone(),
            })
            .await
    }

    /// Customer portal for the tenant's current subscription
    pub async fn portal_session(&self, tenant_id: TenantId) -> BillingResult<HostedSession> {
        let current = self
            .store
            .current_subscription(tenant_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(tenant_id))?;

        self.processor
            .create_portal_session(&current.external_subscription_id, &self.urls.portal_return_url)
            .await
    }

    /// Invoices of the current subscription; empty when there is none
    pub async fn invoices(&self, tenant_id: TenantId) -> BillingResult<Vec<InvoiceSummary>> {
        match self.store.current_subscription(tenant_id).await? {
            Some(current) => {
                self.processor
                    .list_invoices(&current.external_subscription_id)
                    .await
            }
            None => Ok(Vec::new()),
        }
    }
}
