//! In-memory store for tests
//!
//! Mirrors the Postgres uniqueness rules (one current record per tenant,
//! unique external id) and the version-conditional update, so reconciler
//! races behave the same way they do against the database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use estate_shared::{ListingId, SubscriptionStatus, TenantId};
use time::{Date, OffsetDateTime, UtcOffset};
use tokio::sync::Mutex;

use super::{ListingStore, SubscriptionStore, TenantContact, TenantSubscription};
use crate::error::{BillingError, BillingResult};

#[derive(Default)]
struct Inner {
    subscriptions: Vec<TenantSubscription>,
    processed_events: Vec<(String, String)>,
    contacts: HashMap<TenantId, TenantContact>,
    listing_counts: HashMap<TenantId, u32>,
    image_counts: HashMap<(TenantId, ListingId), u32>,
    failing_expiry_dates: Vec<Date>,
}

impl Inner {
    fn violates_uniqueness(&self, candidate: &TenantSubscription) -> bool {
        self.subscriptions.iter().any(|s| {
            s.id == candidate.id
                || s.external_subscription_id == candidate.external_subscription_id
                || (candidate.status.is_current()
                    && s.tenant_id == candidate.tenant_id
                    && s.status.is_current())
        })
    }

    fn apply_update(&mut self, update: &TenantSubscription) -> bool {
        let Some(stored) = self.subscriptions.iter_mut().find(|s| s.id == update.id) else {
            return false;
        };
        if stored.version != update.version {
            return false;
        }
        let mut next = update.clone();
        next.version = update.version + 1;
        next.updated_at = OffsetDateTime::now_utc();
        *stored = next;
        true
    }
}

/// Test double for [`SubscriptionStore`] and [`ListingStore`]
#[derive(Default)]
pub struct InMemoryBillingStore {
    inner: Mutex<Inner>,
    fail_reads: AtomicBool,
    /// Number of upcoming conditional updates to reject as if another writer won
    forced_conflicts: AtomicUsize,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read return a database error
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Reject the next `n` conditional updates with a version conflict
    pub fn force_conflicts(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Make `active_expiring_on` fail for one date only
    pub async fn fail_expiring_on(&self, date: Date) {
        self.inner.lock().await.failing_expiry_dates.push(date);
    }

    pub async fn seed(&self, subscription: TenantSubscription) {
        self.inner.lock().await.subscriptions.push(subscription);
    }

    pub async fn set_listing_count(&self, tenant_id: TenantId, count: u32) {
        self.inner
            .lock()
            .await
            .listing_counts
            .insert(tenant_id, count);
    }

    pub async fn set_image_count(&self, tenant_id: TenantId, listing_id: ListingId, count: u32) {
        self.inner
            .lock()
            .await
            .image_counts
            .insert((tenant_id, listing_id), count);
    }

    pub async fn set_contact(&self, tenant_id: TenantId, contact: TenantContact) {
        self.inner.lock().await.contacts.insert(tenant_id, contact);
    }

    /// Every record for the tenant, oldest first
    pub async fn subscriptions_for(&self, tenant_id: TenantId) -> Vec<TenantSubscription> {
        self.inner
            .lock()
            .await
            .subscriptions
            .iter()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn processed_event_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .processed_events
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn check_reads(&self) -> BillingResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "connection refused (simulated)".to_string(),
            ));
        }
        Ok(())
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn current_subscription(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<TenantSubscription>> {
        self.check_reads()?;
        Ok(self
            .inner
            .lock()
            .await
            .subscriptions
            .iter()
            .find(|s| s.tenant_id == tenant_id && s.status.is_current())
            .cloned())
    }

    async fn find_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<TenantSubscription>> {
        self.check_reads()?;
        Ok(self
            .inner
            .lock()
            .await
            .subscriptions
            .iter()
            .find(|s| s.external_subscription_id == external_subscription_id)
            .cloned())
    }

    async fn insert_subscription(&self, subscription: &TenantSubscription) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.violates_uniqueness(subscription) {
            return Ok(false);
        }
        inner.subscriptions.push(subscription.clone());
        Ok(true)
    }

    async fn update_subscription(&self, subscription: &TenantSubscription) -> BillingResult<bool> {
        if self.take_forced_conflict() {
            return Ok(false);
        }
        Ok(self.inner.lock().await.apply_update(subscription))
    }

    async fn replace_current(
        &self,
        previous: &TenantSubscription,
        next: &TenantSubscription,
    ) -> BillingResult<bool> {
        if self.take_forced_conflict() {
            return Ok(false);
        }
        let mut inner = self.inner.lock().await;
        let snapshot = inner.subscriptions.clone();
        if !inner.apply_update(previous) || inner.violates_uniqueness(next) {
            inner.subscriptions = snapshot;
            return Ok(false);
        }
        inner.subscriptions.push(next.clone());
        Ok(true)
    }

    async fn active_expiring_on(&self, date: Date) -> BillingResult<Vec<TenantSubscription>> {
        self.check_reads()?;
        let inner = self.inner.lock().await;
        if inner.failing_expiry_dates.contains(&date) {
            return Err(BillingError::Database(format!(
                "expiry query for {date} timed out (simulated)"
            )));
        }
        Ok(inner
            .subscriptions
            .iter()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && s.period_end.to_offset(UtcOffset::UTC).date() == date
            })
            .cloned()
            .collect())
    }

    async fn current_subscriptions(&self) -> BillingResult<Vec<TenantSubscription>> {
        self.check_reads()?;
        Ok(self
            .inner
            .lock()
            .await
            .subscriptions
            .iter()
            .filter(|s| s.status.is_current())
            .cloned()
            .collect())
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        self.check_reads()?;
        let mut inner = self.inner.lock().await;
        if inner.processed_events.iter().any(|(id, _)| id == event_id) {
            return Ok(false);
        }
        inner
            .processed_events
            .push((event_id.to_string(), event_type.to_string()));
        Ok(true)
    }

    async fn release_event(&self, event_id: &str) -> BillingResult<()> {
        self.inner
            .lock()
            .await
            .processed_events
            .retain(|(id, _)| id != event_id);
        Ok(())
    }

    async fn tenant_contact(&self, tenant_id: TenantId) -> BillingResult<Option<TenantContact>> {
        self.check_reads()?;
        Ok(self.inner.lock().await.contacts.get(&tenant_id).cloned())
    }
}

#[async_trait]
impl ListingStore for InMemoryBillingStore {
    async fn count_listings(&self, tenant_id: TenantId) -> BillingResult<u32> {
        self.check_reads()?;
        Ok(self
            .inner
            .lock()
            .await
            .listing_counts
            .get(&tenant_id)
            .copied()
            .unwrap_or(0))
    }

    async fn count_images(&self, tenant_id: TenantId, listing_id: ListingId) -> BillingResult<u32> {
        self.check_reads()?;
        Ok(self
            .inner
            .lock()
            .await
            .image_counts
            .get(&(tenant_id, listing_id))
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn active(tenant: TenantId, ext: &str) -> TenantSubscription {
        TenantSubscription::activated(
            tenant,
            ext,
            "pro-price-id",
            datetime!(2026-11-01 00:00 UTC),
            datetime!(2026-10-01 00:00 UTC),
        )
    }

    #[tokio::test]
    async fn test_one_current_record_per_tenant() {
        let store = InMemoryBillingStore::new();
        let tenant = TenantId::new();

        assert!(store.insert_subscription(&active(tenant, "sub_1")).await.unwrap());
        assert!(!store.insert_subscription(&active(tenant, "sub_2")).await.unwrap());
        // Same external id for another tenant is still a duplicate
        assert!(!store
            .insert_subscription(&active(TenantId::new(), "sub_1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_conditional_update_bumps_version() {
        let store = InMemoryBillingStore::new();
        let tenant = TenantId::new();
        let sub = active(tenant, "sub_1");
        store.insert_subscription(&sub).await.unwrap();

        let mut edit = sub.clone();
        edit.status = SubscriptionStatus::Cancelling;
        assert!(store.update_subscription(&edit).await.unwrap());

        // Second write with the stale version loses
        assert!(!store.update_subscription(&edit).await.unwrap());

        let stored = store.find_by_external_id("sub_1").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, SubscriptionStatus::Cancelling);
    }

    #[tokio::test]
    async fn test_replace_current_is_all_or_nothing() {
        let store = InMemoryBillingStore::new();
        let tenant = TenantId::new();
        let old = active(tenant, "sub_old");
        store.insert_subscription(&old).await.unwrap();

        // Reusing the old external id makes the insert half fail
        let mut closed = old.clone();
        closed.status = SubscriptionStatus::Cancelled;
        let clash = active(tenant, "sub_old");
        assert!(!store.replace_current(&closed, &clash).await.unwrap());
        let current = store.current_subscription(tenant).await.unwrap().unwrap();
        assert_eq!(current.external_subscription_id, "sub_old");
        assert_eq!(current.version, 0);

        assert!(store
            .replace_current(&closed, &active(tenant, "sub_new"))
            .await
            .unwrap());
        let current = store.current_subscription(tenant).await.unwrap().unwrap();
        assert_eq!(current.external_subscription_id, "sub_new");
        assert_eq!(store.subscriptions_for(tenant).await.len(), 2);
    }

    #[tokio::test]
    async fn test_event_claim_is_exclusive_until_released() {
        let store = InMemoryBillingStore::new();

        assert!(store.claim_event("evt_1", "checkout.session.completed").await.unwrap());
        assert!(!store.claim_event("evt_1", "checkout.session.completed").await.unwrap());

        store.release_event("evt_1").await.unwrap();
        assert!(store.processed_event_ids().await.is_empty());
        assert!(store.claim_event("evt_1", "checkout.session.completed").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_reads() {
        let store = InMemoryBillingStore::new();
        store.set_fail_reads(true);
        assert!(matches!(
            store.current_subscription(TenantId::new()).await,
            Err(BillingError::Database(_))
        ));
    }
}
