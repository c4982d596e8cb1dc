//! Payment processor client
//!
//! State changes arrive through webhooks. Outbound calls cover scheduling a
//! cancellation, reading a subscription whose webhook lacked the price, and
//! the hosted pages a tenant is sent to (checkout, customer portal) plus the
//! invoice history.

use std::collections::HashMap;

use async_trait::async_trait;
use estate_shared::TenantId;
use serde::Serialize;
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, Expandable, Invoice, ListInvoices,
    Subscription, SubscriptionId, UpdateSubscription,
};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Invoices returned per history request
pub const INVOICE_HISTORY_LIMIT: u64 = 100;

/// Stripe credentials
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .finish()
    }
}

impl StripeConfig {
    /// Read `STRIPE_SECRET_KEY` and `STRIPE_WEBHOOK_SECRET`
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        if secret_key.trim().is_empty() || webhook_secret.trim().is_empty() {
            return Err(BillingError::Config(
                "Stripe credentials must not be empty".to_string(),
            ));
        }

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// Processor-side view of a subscription after an outbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSubscription {
    pub external_subscription_id: String,
    /// Price of the first subscription item
    pub price_id: Option<String>,
    pub period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
}

/// Hosted checkout for one tenant and one price
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub tenant_id: TenantId,
    pub price_id: String,
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

/// A hosted page the tenant is redirected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostedSession {
    pub id: String,
    pub url: String,
}

/// One invoice as shown in the tenant's billing history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceSummary {
    pub id: String,
    pub number: Option<String>,
    pub status: Option<String>,
    /// Smallest currency unit
    pub amount_due: i64,
    pub amount_paid: i64,
    pub currency: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub pdf: Option<String>,
}

/// Outbound operations on the payment processor
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Schedule the subscription to end at its current period end.
    /// Idempotent on the processor side.
    async fn cancel_at_period_end(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription>;

    /// Current processor view of a subscription
    async fn retrieve_subscription(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription>;

    /// Create a subscription-mode checkout whose completion webhook carries
    /// the tenant id and the price id
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<HostedSession>;

    /// Customer portal for the customer that owns the subscription
    async fn create_portal_session(
        &self,
        external_subscription_id: &str,
        return_url: &str,
    ) -> BillingResult<HostedSession>;

    /// Newest first, at most [`INVOICE_HISTORY_LIMIT`]
    async fn list_invoices(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Vec<InvoiceSummary>>;
}

fn parse_subscription_id(operation: &str, raw: &str) -> BillingResult<SubscriptionId> {
    raw.parse::<SubscriptionId>()
        .map_err(|e| BillingError::processor(operation, e.to_string()))
}

fn to_processor_subscription(
    operation: &str,
    sub: &Subscription,
) -> BillingResult<ProcessorSubscription> {
    let period_end = OffsetDateTime::from_unix_timestamp(sub.current_period_end)
        .map_err(|e| BillingError::processor(operation, e.to_string()))?;
    let price_id = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    Ok(ProcessorSubscription {
        external_subscription_id: sub.id.to_string(),
        price_id,
        period_end,
        cancel_at_period_end: sub.cancel_at_period_end,
    })
}

fn to_invoice_summary(invoice: Invoice) -> InvoiceSummary {
    InvoiceSummary {
        id: invoice.id.to_string(),
        number: invoice.number,
        status: invoice.status.map(|s| s.as_str().to_string()),
        amount_due: invoice.amount_due.unwrap_or(0),
        amount_paid: invoice.amount_paid.unwrap_or(0),
        currency: invoice.currency.map(|c| c.to_string()),
        created_at: invoice
            .created
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
        hosted_invoice_url: invoice.hosted_invoice_url,
        pdf: invoice.invoice_pdf,
    }
}

/// Stripe implementation of [`PaymentProcessor`]
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
}

impl StripeClient {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
        }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn cancel_at_period_end(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        let sub_id = parse_subscription_id("cancel_at_period_end", external_subscription_id)?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };

        let updated = Subscription::update(&self.inner, &sub_id, params)
            .await
            .map_err(|e| BillingError::processor("cancel_at_period_end", e.to_string()))?;
        let view = to_processor_subscription("cancel_at_period_end", &updated)?;

        tracing::info!(
            external_subscription_id = %external_subscription_id,
            period_end = %view.period_end,
            "Scheduled cancellation at period end"
        );

        Ok(view)
    }

    async fn retrieve_subscription(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        let sub_id = parse_subscription_id("retrieve_subscription", external_subscription_id)?;

        let subscription = Subscription::retrieve(&self.inner, &sub_id, &[])
            .await
            .map_err(|e| BillingError::processor("retrieve_subscription", e.to_string()))?;

        to_processor_subscription("retrieve_subscription", &subscription)
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<HostedSession> {
        let tenant_ref = request.tenant_id.to_string();

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&tenant_ref);
        params.customer_email = request.customer_email.as_deref();
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(HashMap::from([
            ("tenant_id".to_string(), tenant_ref.clone()),
            ("price_id".to_string(), request.price_id.clone()),
        ]));

        let session = CheckoutSession::create(&self.inner, params)
            .await
            .map_err(|e| BillingError::processor("create_checkout_session", e.to_string()))?;
        let url = session.url.ok_or_else(|| {
            BillingError::processor("create_checkout_session", "checkout session has no url")
        })?;

        tracing::info!(
            tenant_id = %request.tenant_id,
            price_id = %request.price_id,
            checkout_session_id = %session.id,
            "Created checkout session"
        );

        Ok(HostedSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn create_portal_session(
        &self,
        external_subscription_id: &str,
        return_url: &str,
    ) -> BillingResult<HostedSession> {
        let sub_id = parse_subscription_id("create_portal_session", external_subscription_id)?;
        let subscription = Subscription::retrieve(&self.inner, &sub_id, &[])
            .await
            .map_err(|e| BillingError::processor("create_portal_session", e.to_string()))?;
        let customer_id = match subscription.customer {
            Expandable::Id(id) => id,
            Expandable::Object(customer) => customer.id,
        };

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(&self.inner, params)
            .await
            .map_err(|e| BillingError::processor("create_portal_session", e.to_string()))?;

        Ok(HostedSession {
            id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn list_invoices(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Vec<InvoiceSummary>> {
        let mut params = ListInvoices::new();
        params.subscription = Some(parse_subscription_id("list_invoices", external_subscription_id)?);
        params.limit = Some(INVOICE_HISTORY_LIMIT);

        let invoices = Invoice::list(&self.inner, &params)
            .await
            .map_err(|e| BillingError::processor("list_invoices", e.to_string()))?;

        Ok(invoices.data.into_iter().map(to_invoice_summary).collect())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use mock::MockPaymentProcessor;

#[cfg(any(test, feature = "test-support"))]
mod mock {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    /// Records outbound calls; can be told to fail
    #[derive(Default)]
    pub struct MockPaymentProcessor {
        fail: AtomicBool,
        period_end: Mutex<Option<OffsetDateTime>>,
        price_id: Mutex<Option<String>>,
        invoices: Mutex<Vec<InvoiceSummary>>,
        calls: Mutex<Vec<String>>,
        retrievals: Mutex<Vec<String>>,
        checkouts: Mutex<Vec<CheckoutRequest>>,
        portal_returns: Mutex<Vec<String>>,
    }

    impl MockPaymentProcessor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        /// Period end the processor reports back; defaults to 30 days out
        pub async fn set_period_end(&self, period_end: OffsetDateTime) {
            *self.period_end.lock().await = Some(period_end);
        }

        /// Price on retrieved subscriptions; none unless set
        pub async fn set_price_id(&self, price_id: &str) {
            *self.price_id.lock().await = Some(price_id.to_string());
        }

        pub async fn set_invoices(&self, invoices: Vec<InvoiceSummary>) {
            *self.invoices.lock().await = invoices;
        }

        /// Subscription ids passed to `cancel_at_period_end`
        pub async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }

        pub async fn retrievals(&self) -> Vec<String> {
            self.retrievals.lock().await.clone()
        }

        pub async fn checkouts(&self) -> Vec<CheckoutRequest> {
            self.checkouts.lock().await.clone()
        }

        pub async fn portal_returns(&self) -> Vec<String> {
            self.portal_returns.lock().await.clone()
        }

        fn check(&self, operation: &str) -> BillingResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BillingError::processor(
                    operation,
                    "processor unavailable (simulated)",
                ));
            }
            Ok(())
        }

        async fn view(&self, external_subscription_id: &str, cancel: bool) -> ProcessorSubscription {
            let period_end = self
                .period_end
                .lock()
                .await
                .unwrap_or_else(|| OffsetDateTime::now_utc() + time::Duration::days(30));

            ProcessorSubscription {
                external_subscription_id: external_subscription_id.to_string(),
                price_id: self.price_id.lock().await.clone(),
                period_end,
                cancel_at_period_end: cancel,
            }
        }
    }

    #[async_trait]
    impl PaymentProcessor for MockPaymentProcessor {
        async fn cancel_at_period_end(
            &self,
            external_subscription_id: &str,
        ) -> BillingResult<ProcessorSubscription> {
            self.calls
                .lock()
                .await
                .push(external_subscription_id.to_string());
            self.check("cancel_at_period_end")?;
            Ok(self.view(external_subscription_id, true).await)
        }

        async fn retrieve_subscription(
            &self,
            external_subscription_id: &str,
        ) -> BillingResult<ProcessorSubscription> {
            self.retrievals
                .lock()
                .await
                .push(external_subscription_id.to_string());
            self.check("retrieve_subscription")?;
            Ok(self.view(external_subscription_id, false).await)
        }

        async fn create_checkout_session(
            &self,
            request: &CheckoutRequest,
        ) -> BillingResult<HostedSession> {
            self.checkouts.lock().await.push(request.clone());
            self.check("create_checkout_session")?;
            Ok(HostedSession {
                id: format!("cs_test_{}", request.tenant_id),
                url: format!("https://checkout.example.com/pay/{}", request.tenant_id),
            })
        }

        async fn create_portal_session(
            &self,
            external_subscription_id: &str,
            return_url: &str,
        ) -> BillingResult<HostedSession> {
            self.portal_returns.lock().await.push(return_url.to_string());
            self.check("create_portal_session")?;
            Ok(HostedSession {
                id: format!("bps_test_{external_subscription_id}"),
                url: format!("https://billing.example.com/session/{external_subscription_id}"),
            })
        }

        async fn list_invoices(
            &self,
            _external_subscription_id: &str,
        ) -> BillingResult<Vec<InvoiceSummary>> {
            self.check("list_invoices")?;
            Ok(self.invoices.lock().await.clone())
        }
    }
}
