//! Persistence seams for the billing engine
//!
//! Every component receives its store through its constructor. Production uses
//! [`PgBillingStore`]; tests use the in-memory store behind the
//! `test-support` feature.

use async_trait::async_trait;
use estate_shared::{ListingId, SubscriptionStatus, TenantId};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

#[cfg(any(test, feature = "test-support"))]
mod memory;
mod postgres;

#[cfg(any(test, feature = "test-support"))]
pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

/// Local record of a tenant's subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSubscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub external_subscription_id: String,
    pub status: SubscriptionStatus,
    pub external_plan_reference: String,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancellation_requested_at: Option<OffsetDateTime>,
    /// Processor timestamp of the newest event applied to this record
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    /// Optimistic concurrency token, bumped on every write
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TenantSubscription {
    /// A fresh Active record as created by a completed checkout
    pub fn activated(
        tenant_id: TenantId,
        external_subscription_id: impl Into<String>,
        external_plan_reference: impl Into<String>,
        period_end: OffsetDateTime,
        event_at: OffsetDateTime,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            external_subscription_id: external_subscription_id.into(),
            status: SubscriptionStatus::Active,
            external_plan_reference: external_plan_reference.into(),
            period_end,
            cancellation_requested_at: None,
            last_event_at: Some(event_at),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether an event stamped `event_at` predates the last one applied
    pub fn is_stale(&self, event_at: OffsetDateTime) -> bool {
        matches!(self.last_event_at, Some(last) if event_at < last)
    }
}

/// Contact details used for notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContact {
    pub email: String,
    pub company_name: Option<String>,
}

impl TenantContact {
    pub fn greeting_name(&self) -> &str {
        self.company_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.email)
    }
}

/// Subscription records and the processed-event ledger
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// The tenant's Active or Cancelling record, if any
    async fn current_subscription(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<TenantSubscription>>;

    async fn find_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<TenantSubscription>>;

    /// Insert a new record. Returns `false` if it would violate a uniqueness
    /// rule (duplicate external id, or a second current record for the tenant).
    async fn insert_subscription(&self, subscription: &TenantSubscription) -> BillingResult<bool>;

    /// Conditional write keyed on `subscription.version`. Returns `false` when
    /// the stored version moved on; the stored version is bumped on success.
    async fn update_subscription(&self, subscription: &TenantSubscription) -> BillingResult<bool>;

    /// Close `previous` (conditional on its version) and insert `next` as one
    /// unit. Returns `false` if either half conflicts; nothing is written then.
    async fn replace_current(
        &self,
        previous: &TenantSubscription,
        next: &TenantSubscription,
    ) -> BillingResult<bool>;

    /// Active records whose period ends on `date` (UTC)
    async fn active_expiring_on(&self, date: Date) -> BillingResult<Vec<TenantSubscription>>;

    /// Every Active or Cancelling record
    async fn current_subscriptions(&self) -> BillingResult<Vec<TenantSubscription>>;

    /// Record `event_id` in the processed-event ledger. Returns `false` when
    /// it is already there; exactly one caller wins for a given id.
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    /// Drop a claim whose processing failed so a redelivery runs again
    async fn release_event(&self, event_id: &str) -> BillingResult<()>;

    async fn tenant_contact(&self, tenant_id: TenantId) -> BillingResult<Option<TenantContact>>;
}

/// Live listing/image counts owned by the listings CRUD layer
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn count_listings(&self, tenant_id: TenantId) -> BillingResult<u32>;

    async fn count_images(&self, tenant_id: TenantId, listing_id: ListingId) -> BillingResult<u32>;
}
