//! Quota and feature gates
//!
//! Pre-condition checks for listing creation, image upload and tier-gated
//! features. Counts are read fresh from the listings store on every call.
//!
//! The checks are read-then-act: two concurrent creates from one tenant can
//! both pass and overshoot `max_listings` by the number of requests in flight
//! between the count and the insert. Listing ceilings are soft UX limits, so
//! that overshoot is tolerated; strict enforcement would need the count and
//! the insert in one conditional statement on the listings side.

use std::sync::Arc;

use estate_shared::{FeatureFlag, ListingId, PlanTier, TenantId};
use serde::Serialize;

use crate::catalog::PlanCatalog;
use crate::entitlement::EntitlementResolver;
use crate::error::{BillingError, BillingResult};
use crate::storage::ListingStore;

/// What a gate protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatedResource {
    Listings,
    Images { listing_id: ListingId },
    Feature { feature: FeatureFlag },
}

/// Why a gate said no, shaped for an upgrade prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DenialReason {
    pub resource: GatedResource,
    pub current_count: u32,
    /// For features: 0 when the tier lacks the feature
    pub limit: u32,
    pub tier: PlanTier,
}

/// Outcome of a gate check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// How a caller treats `EntitlementUnavailable`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Propagate the error; the guarded operation does not run
    #[default]
    FailClosed,
    /// Let the operation through when the tier cannot be resolved
    FailOpen,
}

impl FailurePolicy {
    pub fn apply(self, result: BillingResult<GateDecision>) -> BillingResult<GateDecision> {
        match (self, result) {
            (FailurePolicy::FailOpen, Err(BillingError::EntitlementUnavailable { tenant_id, message })) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %message,
                    "Entitlement unavailable, failing open"
                );
                Ok(GateDecision::allow())
            }
            (_, result) => result,
        }
    }
}

/// Synchronous quota and feature checks
#[derive(Clone)]
pub struct QuotaGate {
    resolver: EntitlementResolver,
    listings: Arc<dyn ListingStore>,
}

impl QuotaGate {
    pub fn new(resolver: EntitlementResolver, listings: Arc<dyn ListingStore>) -> Self {
        Self { resolver, listings }
    }

    /// May the tenant create one more listing
    pub async fn can_create_listing(&self, tenant_id: TenantId) -> BillingResult<GateDecision> {
        let tier = self.resolver.current_tier(tenant_id).await?;
        let count = self
            .listings
            .count_listings(tenant_id)
            .await
            .map_err(|e| BillingError::unavailable(tenant_id, &e))?;

        Ok(Self::check_count(
            GatedResource::Listings,
            count,
            PlanCatalog::limits_for(tier).max_listings,
            tier,
        ))
    }

    /// May the tenant add one more image to `listing_id`
    pub async fn can_add_image(
        &self,
        tenant_id: TenantId,
        listing_id: ListingId,
    ) -> BillingResult<GateDecision> {
        let tier = self.resolver.current_tier(tenant_id).await?;
        let count = self
            .listings
            .count_images(tenant_id, listing_id)
            .await
            .map_err(|e| BillingError::unavailable(tenant_id, &e))?;

        Ok(Self::check_count(
            GatedResource::Images { listing_id },
            count,
            PlanCatalog::limits_for(tier).max_images_per_listing,
            tier,
        ))
    }

    /// Listings the tenant currently holds
    pub async fn listing_usage(&self, tenant_id: TenantId) -> BillingResult<u32> {
        self.listings
            .count_listings(tenant_id)
            .await
            .map_err(|e| BillingError::unavailable(tenant_id, &e))
    }

    pub async fn can_use_feature(
        &self,
        tenant_id: TenantId,
        feature: FeatureFlag,
    ) -> BillingResult<GateDecision> {
        let tier = self.resolver.current_tier(tenant_id).await?;
        if PlanCatalog::limits_for(tier).allows(feature) {
            return Ok(GateDecision::allow());
        }

        tracing::debug!(tenant_id = %tenant_id, feature = %feature, tier = %tier, "Feature gated");
        Ok(GateDecision::deny(DenialReason {
            resource: GatedResource::Feature { feature },
            current_count: 0,
            limit: 0,
            tier,
        }))
    }

    fn check_count(resource: GatedResource, count: u32, limit: u32, tier: PlanTier) -> GateDecision {
        if count < limit {
            GateDecision::allow()
        } else {
            GateDecision::deny(DenialReason {
                resource,
                current_count: count,
                limit,
                tier,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanReferenceTable;
    use crate::storage::{InMemoryBillingStore, TenantSubscription};
    use time::{Duration, OffsetDateTime};

    fn gate(store: Arc<InMemoryBillingStore>) -> QuotaGate {
        let catalog = PlanCatalog::new(
            PlanReferenceTable::new(1).with_reference("pro-price-id", PlanTier::Pro),
        );
        let resolver = EntitlementResolver::new(Arc::new(catalog), store.clone());
        QuotaGate::new(resolver, store)
    }

    async fn make_pro(store: &InMemoryBillingStore, tenant: TenantId) {
        let now = OffsetDateTime::now_utc();
        store
            .seed(TenantSubscription::activated(
                tenant,
                format!("sub_{tenant}"),
                "pro-price-id",
                now + Duration::days(30),
                now,
            ))
            .await;
    }

    #[tokio::test]
    async fn test_image_quota_scoped_to_listing() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = TenantId::new();
        let full = ListingId::new();
        let empty = ListingId::new();
        store.set_image_count(tenant, full, 5).await;

        let gate = gate(store);
        let denied = gate.can_add_image(tenant, full).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(
            denied.reason.unwrap().resource,
            GatedResource::Images { listing_id: full }
        );
        assert!(gate.can_add_image(tenant, empty).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_pro_image_limit() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = TenantId::new();
        let listing = ListingId::new();
        make_pro(&store, tenant).await;
        store.set_image_count(tenant, listing, 15).await;

        let gate = gate(store.clone());
        assert!(gate.can_add_image(tenant, listing).await.unwrap().allowed);

        store.set_image_count(tenant, listing, 16).await;
        let decision = gate.can_add_image(tenant, listing).await.unwrap();
        let reason = decision.reason.unwrap();
        assert_eq!((reason.current_count, reason.limit), (16, 16));
        assert_eq!(reason.tier, PlanTier::Pro);
    }

    #[tokio::test]
    async fn test_feature_denial_carries_tier() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = TenantId::new();
        let decision = gate(store)
            .can_use_feature(tenant, FeatureFlag::WhatsAppButton)
            .await
            .unwrap();
        assert_eq!(
            decision.reason,
            Some(DenialReason {
                resource: GatedResource::Feature {
                    feature: FeatureFlag::WhatsAppButton
                },
                current_count: 0,
                limit: 0,
                tier: PlanTier::Free,
            })
        );
    }

    #[tokio::test]
    async fn test_failure_policy() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.set_fail_reads(true);
        let gate = gate(store);
        let tenant = TenantId::new();

        let closed = FailurePolicy::FailClosed.apply(gate.can_create_listing(tenant).await);
        assert!(matches!(
            closed,
            Err(BillingError::EntitlementUnavailable { .. })
        ));

        let open = FailurePolicy::FailOpen
            .apply(gate.can_use_feature(tenant, FeatureFlag::LeadForm).await)
            .unwrap();
        assert!(open.allowed);
    }

    #[test]
    fn test_denial_serialization() {
        let decision = GateDecision::deny(DenialReason {
            resource: GatedResource::Listings,
            current_count: 1,
            limit: 1,
            tier: PlanTier::Free,
        });
        let json = serde_json::to_value(decision).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["reason"]["resource"]["kind"], "listings");
        assert_eq!(json["reason"]["tier"], "free");

        let allowed = serde_json::to_value(GateDecision::allow()).unwrap();
        assert!(allowed.get("reason").is_none());
    }
}
