// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries owned context strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! EstatePage Billing Module
//!
//! Subscription entitlement and billing reconciliation.
//!
//! ## Components
//!
//! - **Plan catalog**: quotas and features per tier, price id to tier lookup
//! - **Entitlements**: tenant to tier from the locally reconciled record
//! - **Quota gate**: listing, image and feature pre-checks
//! - **Reconciler**: webhook-driven state machine and two-phase cancellation
//! - **Webhooks**: signature verification, event decoding, processed-event ledger
//! - **Checkout**: hosted checkout, customer portal and invoice history
//! - **Lifecycle**: daily expiry warning sweep
//! - **Invariants**: read-only consistency checks

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod lifecycle;
pub mod quota;
pub mod reconciler;
pub mod storage;
pub mod webhooks;


use std::sync::Arc;

// Catalog
pub use catalog::{PlanCatalog, PlanLimits, PlanReferenceTable};

// Checkout
pub use checkout::{CheckoutService, CheckoutUrls};

// Client
#[cfg(any(test, feature = "test-support"))]
pub use client::MockPaymentProcessor;
pub use client::{
    CheckoutRequest, HostedSession, InvoiceSummary, PaymentProcessor, ProcessorSubscription,
    StripeClient, StripeConfig,
};

// Email
#[cfg(any(test, feature = "test-support"))]
pub use email::{RecordingNotifier, SentNotification};
pub use email::{BillingEmailService, BillingNotifier, EmailConfig};

// Entitlement
pub use entitlement::{Entitlement, EntitlementResolver};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{
    parse_thresholds, LifecycleScheduler, SweepOutcome, SweepReport, ThresholdReport,
    DEFAULT_WARNING_DAYS,
};

// Quota
pub use quota::{DenialReason, FailurePolicy, GateDecision, GatedResource, QuotaGate};

// Reconciler
pub use reconciler::{
    BillingReconciler, CancellationWindow, CheckoutCompleted, ProcessorStatus, ReconcileOutcome,
    SubscriptionDeleted, SubscriptionUpdated,
};

// Storage
#[cfg(any(test, feature = "test-support"))]
pub use storage::InMemoryBillingStore;
pub use storage::{
    ListingStore, PgBillingStore, SubscriptionStore, TenantContact, TenantSubscription,
};

// Webhooks
pub use webhooks::{sign_payload, BillingEvent, WebhookHandler, WebhookOutcome};

use sqlx::PgPool;

/// Request-path billing components wired to one set of collaborators
#[derive(Clone)]
pub struct BillingService {
    pub catalog: Arc<PlanCatalog>,
    pub entitlements: EntitlementResolver,
    pub quota: QuotaGate,
    pub reconciler: BillingReconciler,
    pub webhooks: WebhookHandler,
    pub checkout: CheckoutService,
}

impl BillingService {
    /// Wire Postgres, Stripe and Resend from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let catalog = PlanCatalog::from_env()?;
        let stripe_config = StripeConfig::from_env()?;
        let store = Arc::new(PgBillingStore::new(pool));

        Ok(Self::new(
            catalog,
            &stripe_config.webhook_secret,
            store.clone(),
            store,
            Arc::new(StripeClient::new(&stripe_config)),
            Arc::new(BillingEmailService::new(EmailConfig::from_env())),
        )
        .with_checkout_urls(CheckoutUrls::from_env()))
    }

    /// Wire explicit collaborators
    pub fn new(
        catalog: PlanCatalog,
        webhook_secret: &str,
        subscriptions: Arc<dyn SubscriptionStore>,
        listings: Arc<dyn ListingStore>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Arc<dyn BillingNotifier>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let entitlements = EntitlementResolver::new(catalog.clone(), subscriptions.clone());
        let quota = QuotaGate::new(entitlements.clone(), listings);
        let checkout = CheckoutService::new(
            catalog.clone(),
            subscriptions.clone(),
            processor.clone(),
            CheckoutUrls::default(),
        );
        let reconciler = BillingReconciler::new(subscriptions, catalog.clone(), processor, notifier);
        let webhooks = WebhookHandler::new(webhook_secret, reconciler.clone());

        Self {
            catalog,
            entitlements,
            quota,
            reconciler,
            webhooks,
            checkout,
        }
    }

    pub fn with_checkout_urls(mut self, urls: CheckoutUrls) -> Self {
        self.checkout = self.checkout.with_urls(urls);
        self
    }
}
