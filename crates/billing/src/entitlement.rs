//! Entitlement resolution
//!
//! Maps a tenant to its current [`PlanTier`] from the locally stored
//! subscription record. Never calls the payment processor; request-path
//! decisions are only as fresh as the last reconciled webhook.

use std::sync::Arc;

use estate_shared::{PlanTier, SubscriptionStatus, TenantId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::catalog::{PlanCatalog, PlanLimits};
use crate::error::{BillingError, BillingResult};
use crate::storage::{SubscriptionStore, TenantSubscription};

/// A tenant's resolved entitlement
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub tier: PlanTier,
    pub limits: PlanLimits,
    /// The current (Active or Cancelling) record backing the tier, if any
    pub subscription: Option<TenantSubscription>,
}

/// Resolves tenants to tiers
#[derive(Clone)]
pub struct EntitlementResolver {
    catalog: Arc<PlanCatalog>,
    store: Arc<dyn SubscriptionStore>,
}

impl EntitlementResolver {
    pub fn new(catalog: Arc<PlanCatalog>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self { catalog, store }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Current tier for a tenant
    ///
    /// A store failure is returned as `EntitlementUnavailable`, never as Free.
    pub async fn current_tier(&self, tenant_id: TenantId) -> BillingResult<PlanTier> {
        Ok(self.current_entitlement(tenant_id).await?.tier)
    }

    pub async fn current_entitlement(&self, tenant_id: TenantId) -> BillingResult<Entitlement> {
        let record = self
            .store
            .current_subscription(tenant_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Subscription lookup failed while resolving entitlement"
                );
                BillingError::unavailable(tenant_id, &e)
            })?;

        let tier = record
            .as_ref()
            .map(|sub| self.tier_for(sub, OffsetDateTime::now_utc()))
            .unwrap_or_default();

        Ok(Entitlement {
            tier,
            limits: PlanCatalog::limits_for(tier),
            subscription: record,
        })
    }

    /// Tier granted by a single record at `now`
    ///
    /// Active grants its plan. Cancelling keeps the plan until `period_end`.
    /// Anything else is Free.
    pub fn tier_for(&self, subscription: &TenantSubscription, now: OffsetDateTime) -> PlanTier {
        match subscription.status {
            SubscriptionStatus::Active => self
                .catalog
                .tier_from_external_reference(&subscription.external_plan_reference),
            SubscriptionStatus::Cancelling if now < subscription.period_end => self
                .catalog
                .tier_from_external_reference(&subscription.external_plan_reference),
            SubscriptionStatus::Cancelling
            | SubscriptionStatus::Cancelled
            | SubscriptionStatus::Expired => PlanTier::Free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanReferenceTable;
    use crate::storage::InMemoryBillingStore;
    use time::Duration;

    fn resolver(store: Arc<InMemoryBillingStore>) -> EntitlementResolver {
        let catalog = PlanCatalog::new(
            PlanReferenceTable::new(1)
                .with_reference("pro-price-id", PlanTier::Pro)
                .with_reference("elite-price-id", PlanTier::Elite),
        );
        EntitlementResolver::new(Arc::new(catalog), store)
    }

    fn record(tenant: TenantId, status: SubscriptionStatus, plan: &str) -> TenantSubscription {
        let now = OffsetDateTime::now_utc();
        let mut sub =
            TenantSubscription::activated(tenant, "sub_1", plan, now + Duration::days(10), now);
        sub.status = status;
        sub
    }

    #[tokio::test]
    async fn test_no_record_is_free() {
        let store = Arc::new(InMemoryBillingStore::new());
        let resolver = resolver(store);
        assert_eq!(
            resolver.current_tier(TenantId::new()).await.unwrap(),
            PlanTier::Free
        );
    }

    #[tokio::test]
    async fn test_active_record_maps_through_catalog() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = TenantId::new();
        store
            .seed(record(tenant, SubscriptionStatus::Active, "elite-price-id"))
            .await;

        let entitlement = resolver(store).current_entitlement(tenant).await.unwrap();
        assert_eq!(entitlement.tier, PlanTier::Elite);
        assert_eq!(entitlement.limits.max_listings, 100);
        assert!(entitlement.subscription.is_some());
    }

    #[tokio::test]
    async fn test_unknown_plan_reference_is_free() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = TenantId::new();
        store
            .seed(record(tenant, SubscriptionStatus::Active, "legacy-price"))
            .await;
        assert_eq!(
            resolver(store).current_tier(tenant).await.unwrap(),
            PlanTier::Free
        );
    }

    #[tokio::test]
    async fn test_historical_records_are_free() {
        let store = Arc::new(InMemoryBillingStore::new());
        let resolver = resolver(store);
        let now = OffsetDateTime::now_utc();
        for status in [SubscriptionStatus::Cancelled, SubscriptionStatus::Expired] {
            let sub = record(TenantId::new(), status, "pro-price-id");
            assert_eq!(resolver.tier_for(&sub, now), PlanTier::Free);
        }
    }

    #[tokio::test]
    async fn test_cancelling_keeps_tier_until_period_end() {
        let store = Arc::new(InMemoryBillingStore::new());
        let resolver = resolver(store);
        let sub = record(TenantId::new(), SubscriptionStatus::Cancelling, "pro-price-id");

        assert_eq!(
            resolver.tier_for(&sub, sub.period_end - Duration::seconds(1)),
            PlanTier::Pro
        );
        assert_eq!(resolver.tier_for(&sub, sub.period_end), PlanTier::Free);
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_downgrade() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.set_fail_reads(true);
        let tenant = TenantId::new();

        match resolver(store).current_tier(tenant).await {
            Err(BillingError::EntitlementUnavailable { tenant_id, .. }) => {
                assert_eq!(tenant_id, tenant)
            }
            other => panic!("expected EntitlementUnavailable, got {other:?}"),
        }
    }
}
