//! Subscription invariants
//!
//! Read-only consistency checks over the current subscription records. Meant
//! to be run by operators after incidents or webhook replays.

use std::collections::BTreeMap;
use std::sync::Arc;

use estate_shared::{SubscriptionStatus, TenantId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::catalog::PlanCatalog;
use crate::error::BillingResult;
use crate::storage::{SubscriptionStore, TenantSubscription};

/// A single failed check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub tenant_ids: Vec<TenantId>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlement may be wrong right now
    Critical,
    High,
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const SINGLE_CURRENT: &str = "single_current_subscription";
const CANCELLING_HAS_REQUEST: &str = "cancelling_has_request_time";
const ACTIVE_NOT_LAPSED: &str = "active_not_past_period_end";
const PLAN_REFERENCE_KNOWN: &str = "active_plan_reference_known";

pub struct InvariantChecker {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn SubscriptionStore>, catalog: Arc<PlanCatalog>) -> Self {
        Self { store, catalog }
    }

    pub fn available_checks() -> &'static [&'static str] {
        &[
            SINGLE_CURRENT,
            CANCELLING_HAS_REQUEST,
            ACTIVE_NOT_LAPSED,
            PLAN_REFERENCE_KNOWN,
        ]
    }

    pub async fn run_all(&self, now: OffsetDateTime) -> BillingResult<InvariantCheckSummary> {
        let current = self.store.current_subscriptions().await?;

        let mut violations = Vec::new();
        violations.extend(check_single_current(&current));
        violations.extend(check_cancelling_has_request(&current));
        violations.extend(check_active_not_lapsed(&current, now));
        violations.extend(self.check_plan_reference_known(&current));

        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed = checks_failed,
                "Subscription invariants violated"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: Self::available_checks().len(),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Active records whose price id the catalog does not know resolve to Free
    /// while the tenant is paying
    fn check_plan_reference_known(&self, current: &[TenantSubscription]) -> Vec<InvariantViolation> {
        current
            .iter()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .filter(|s| !self.catalog.tier_from_external_reference(&s.external_plan_reference).is_paid())
            .map(|s| InvariantViolation {
                invariant: PLAN_REFERENCE_KNOWN.to_string(),
                tenant_ids: vec![s.tenant_id],
                description: format!(
                    "Active subscription {} has plan reference '{}' that maps to the free tier",
                    s.external_subscription_id, s.external_plan_reference
                ),
                context: serde_json::json!({
                    "external_subscription_id": s.external_subscription_id,
                    "external_plan_reference": s.external_plan_reference,
                    "table_version": self.catalog.table_version(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect()
    }
}

fn check_single_current(current: &[TenantSubscription]) -> Vec<InvariantViolation> {
    let mut by_tenant: BTreeMap<TenantId, Vec<&str>> = BTreeMap::new();
    for sub in current {
        by_tenant
            .entry(sub.tenant_id)
            .or_default()
            .push(&sub.external_subscription_id);
    }

    by_tenant
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(tenant_id, ids)| InvariantViolation {
            invariant: SINGLE_CURRENT.to_string(),
            tenant_ids: vec![tenant_id],
            description: format!("Tenant has {} current subscriptions (expected 1)", ids.len()),
            context: serde_json::json!({ "external_subscription_ids": ids }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

fn check_cancelling_has_request(current: &[TenantSubscription]) -> Vec<InvariantViolation> {
    current
        .iter()
        .filter(|s| {
            s.status == SubscriptionStatus::Cancelling && s.cancellation_requested_at.is_none()
        })
        .map(|s| InvariantViolation {
            invariant: CANCELLING_HAS_REQUEST.to_string(),
            tenant_ids: vec![s.tenant_id],
            description: format!(
                "Subscription {} is cancelling without a request time",
                s.external_subscription_id
            ),
            context: serde_json::json!({ "external_subscription_id": s.external_subscription_id }),
            severity: ViolationSeverity::Medium,
        })
        .collect()
}

/// An Active record past its period end means a renewal or deletion event
/// never landed
fn check_active_not_lapsed(
    current: &[TenantSubscription],
    now: OffsetDateTime,
) -> Vec<InvariantViolation> {
    current
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Active && s.period_end < now)
        .map(|s| InvariantViolation {
            invariant: ACTIVE_NOT_LAPSED.to_string(),
            tenant_ids: vec![s.tenant_id],
            description: format!(
                "Active subscription {} ended at {} with no renewal recorded",
                s.external_subscription_id, s.period_end
            ),
            context: serde_json::json!({
                "external_subscription_id": s.external_subscription_id,
                "period_end": s.period_end.unix_timestamp(),
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanReferenceTable;
    use crate::storage::InMemoryBillingStore;
    use estate_shared::PlanTier;
    use time::macros::datetime;

    fn record(tenant: TenantId, ext: &str, period_end: OffsetDateTime) -> TenantSubscription {
        TenantSubscription::activated(
            tenant,
            ext,
            "pro-price-id",
            period_end,
            datetime!(2026-09-01 00:00 UTC),
        )
    }

    fn checker(store: Arc<InMemoryBillingStore>) -> InvariantChecker {
        InvariantChecker::new(
            store,
            Arc::new(PlanCatalog::new(
                PlanReferenceTable::new(4).with_reference("pro-price-id", PlanTier::Pro),
            )),
        )
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[tokio::test]
    async fn test_healthy_store() {
        let store = Arc::new(InMemoryBillingStore::new());
        store
            .seed(record(TenantId::new(), "sub_1", datetime!(2026-11-01 00:00 UTC)))
            .await;

        let summary = checker(store)
            .run_all(datetime!(2026-10-19 00:00 UTC))
            .await
            .unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.checks_run, 4);
    }

    #[tokio::test]
    async fn test_reports_each_violation_kind() {
        let store = Arc::new(InMemoryBillingStore::new());
        let doubled = TenantId::new();
        store
            .seed(record(doubled, "sub_a", datetime!(2026-11-01 00:00 UTC)))
            .await;
        store
            .seed(record(doubled, "sub_b", datetime!(2026-11-01 00:00 UTC)))
            .await;

        let mut cancelling = record(TenantId::new(), "sub_c", datetime!(2026-11-01 00:00 UTC));
        cancelling.status = SubscriptionStatus::Cancelling;
        store.seed(cancelling).await;

        store
            .seed(record(TenantId::new(), "sub_d", datetime!(2026-10-01 00:00 UTC)))
            .await;

        let mut legacy = record(TenantId::new(), "sub_e", datetime!(2026-11-01 00:00 UTC));
        legacy.external_plan_reference = "price_retired".into();
        store.seed(legacy).await;

        let summary = checker(store)
            .run_all(datetime!(2026-10-19 00:00 UTC))
            .await
            .unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 4);

        let single: Vec<_> = summary
            .violations
            .iter()
            .filter(|v| v.invariant == SINGLE_CURRENT)
            .collect();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].tenant_ids, vec![doubled]);
        assert_eq!(single[0].severity, ViolationSeverity::Critical);
    }
}
