//! Expiry warning sweep
//!
//! Once a day, for each warning threshold, find Active subscriptions whose
//! period ends exactly `threshold` days from today (UTC date match) and warn
//! the tenant. A missed day is not caught up: the date-equality match means a
//! record is only eligible on its threshold day. A threshold whose query fails
//! is reported with its error and the remaining thresholds still run.

use std::sync::Arc;

use serde::Serialize;
use time::{Date, Duration, OffsetDateTime, UtcOffset};
use tokio::sync::Mutex;

use crate::email::BillingNotifier;
use crate::entitlement::EntitlementResolver;
use crate::error::{BillingError, BillingResult};
use crate::storage::SubscriptionStore;

pub const DEFAULT_WARNING_DAYS: [u32; 2] = [7, 3];

/// Per-threshold counts for one sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThresholdReport {
    pub threshold_days: u32,
    pub target_date: Date,
    pub matched: usize,
    pub notified: usize,
    pub failed: usize,
    /// Set when the expiring records for this date could not be read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub thresholds: Vec<ThresholdReport>,
}

impl SweepReport {
    pub fn total_notified(&self) -> usize {
        self.thresholds.iter().map(|t| t.notified).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.thresholds.iter().map(|t| t.failed).sum()
    }

    /// Thresholds that could not be swept at all
    pub fn errored(&self) -> impl Iterator<Item = &ThresholdReport> {
        self.thresholds.iter().filter(|t| t.error.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was still running
    SkippedOverlap,
}

/// Parse `EXPIRY_WARNING_DAYS`-style input ("7,3"). Sorted descending, deduplicated.
pub fn parse_thresholds(raw: &str) -> BillingResult<Vec<u32>> {
    let mut days = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| BillingError::Config(format!("invalid warning threshold: {}", s)))
        })
        .collect::<BillingResult<Vec<u32>>>()?;

    days.sort_unstable_by(|a, b| b.cmp(a));
    days.dedup();
    if days.is_empty() {
        return Err(BillingError::Config(
            "at least one expiry warning threshold is required".to_string(),
        ));
    }
    Ok(days)
}

/// Daily expiry-warning sweep with a single-flight guard
pub struct LifecycleScheduler {
    store: Arc<dyn SubscriptionStore>,
    resolver: EntitlementResolver,
    notifier: Arc<dyn BillingNotifier>,
    thresholds: Vec<u32>,
    guard: Mutex<()>,
}

impl LifecycleScheduler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        resolver: EntitlementResolver,
        notifier: Arc<dyn BillingNotifier>,
        thresholds: Vec<u32>,
    ) -> Self {
        Self {
            store,
            resolver,
            notifier,
            thresholds,
            guard: Mutex::new(()),
        }
    }

    pub fn thresholds(&self) -> &[u32] {
        &self.thresholds
    }

    /// Run one sweep as of `now`. Overlapping calls return `SkippedOverlap`.
    pub async fn run_sweep(&self, now: OffsetDateTime) -> BillingResult<SweepOutcome> {
        let Ok(_running) = self.guard.try_lock() else {
            tracing::warn!("Expiry sweep already running, skipping this tick");
            return Ok(SweepOutcome::SkippedOverlap);
        };

        let today = now.to_offset(UtcOffset::UTC);
        let mut reports = Vec::with_capacity(self.thresholds.len());

        for &days in &self.thresholds {
            let target_date = (today + Duration::days(i64::from(days))).date();
            let report = match self.sweep_threshold(days, target_date, now).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(
                        threshold_days = days,
                        target_date = %target_date,
                        error = %e,
                        "Failed to load expiring subscriptions, threshold skipped"
                    );
                    ThresholdReport {
                        threshold_days: days,
                        target_date,
                        matched: 0,
                        notified: 0,
                        failed: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        let report = SweepReport {
            thresholds: reports,
        };
        tracing::info!(
            notified = report.total_notified(),
            failed = report.total_failed(),
            errored_thresholds = report.errored().count(),
            "Expiry sweep complete"
        );
        Ok(SweepOutcome::Completed(report))
    }

    async fn sweep_threshold(
        &self,
        days: u32,
        target_date: Date,
        now: OffsetDateTime,
    ) -> BillingResult<ThresholdReport> {
        let expiring = self.store.active_expiring_on(target_date).await?;
        let mut report = ThresholdReport {
            threshold_days: days,
            target_date,
            matched: expiring.len(),
            notified: 0,
            failed: 0,
            error: None,
        };

        for sub in expiring {
            let contact = match self.store.tenant_contact(sub.tenant_id).await {
                Ok(Some(contact)) => contact,
                Ok(None) => {
                    tracing::warn!(tenant_id = %sub.tenant_id, "No contact for expiry warning");
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(tenant_id = %sub.tenant_id, error = %e, "Failed to load tenant contact");
                    report.failed += 1;
                    continue;
                }
            };

            let tier = self.resolver.tier_for(&sub, now);
            match self
                .notifier
                .expiry_warning(&contact, tier, sub.period_end, days)
                .await
            {
                Ok(()) => report.notified += 1,
                Err(e) => {
                    tracing::error!(
                        tenant_id = %sub.tenant_id,
                        external_subscription_id = %sub.external_subscription_id,
                        days_left = days,
                        error = %e,
                        "Failed to send expiry warning"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            threshold_days = days,
            target_date = %target_date,
            matched = report.matched,
            notified = report.notified,
            "Expiry threshold swept"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PlanCatalog, PlanReferenceTable};
    use crate::email::{RecordingNotifier, SentNotification};
    use crate::storage::{InMemoryBillingStore, TenantContact, TenantSubscription};
    use estate_shared::{PlanTier, SubscriptionStatus, TenantId};
    use time::macros::datetime;

    struct Harness {
        store: Arc<InMemoryBillingStore>,
        notifier: Arc<RecordingNotifier>,
        scheduler: LifecycleScheduler,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryBillingStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let catalog = PlanCatalog::new(
            PlanReferenceTable::new(1).with_reference("pro-price-id", PlanTier::Pro),
        );
        let resolver = EntitlementResolver::new(Arc::new(catalog), store.clone());
        let scheduler = LifecycleScheduler::new(
            store.clone(),
            resolver,
            notifier.clone(),
            DEFAULT_WARNING_DAYS.to_vec(),
        );
        Harness {
            store,
            notifier,
            scheduler,
        }
    }

    async fn seed(h: &Harness, period_end: OffsetDateTime, status: SubscriptionStatus) -> TenantId {
        let tenant = TenantId::new();
        let mut sub = TenantSubscription::activated(
            tenant,
            format!("sub_{tenant}"),
            "pro-price-id",
            period_end,
            datetime!(2026-09-01 00:00 UTC),
        );
        sub.status = status;
        h.store.seed(sub).await;
        h.store
            .set_contact(
                tenant,
                TenantContact {
                    email: format!("{tenant}@example.com"),
                    company_name: None,
                },
            )
            .await;
        tenant
    }

    #[test]
    fn test_parse_thresholds() {
        assert_eq!(parse_thresholds("3, 7,7").unwrap(), vec![7, 3]);
        assert_eq!(parse_thresholds("1").unwrap(), vec![1]);
        assert!(parse_thresholds("").is_err());
        assert!(parse_thresholds("seven").is_err());
        assert!(parse_thresholds("-1").is_err());
    }

    #[tokio::test]
    async fn test_sweep_matches_exact_threshold_dates() {
        let h = harness();
        let now = datetime!(2026-10-19 09:00 UTC);

        seed(&h, datetime!(2026-10-26 23:30 UTC), SubscriptionStatus::Active).await; // 7 days
        seed(&h, datetime!(2026-10-22 00:15 UTC), SubscriptionStatus::Active).await; // 3 days
        seed(&h, datetime!(2026-10-25 12:00 UTC), SubscriptionStatus::Active).await; // 6 days
        seed(&h, datetime!(2026-10-26 12:00 UTC), SubscriptionStatus::Cancelling).await;

        let SweepOutcome::Completed(report) = h.scheduler.run_sweep(now).await.unwrap() else {
            panic!("sweep skipped");
        };
        assert_eq!(report.thresholds.len(), 2);
        assert_eq!(report.thresholds[0].threshold_days, 7);
        assert_eq!(report.thresholds[0].matched, 1);
        assert_eq!(report.thresholds[1].threshold_days, 3);
        assert_eq!(report.thresholds[1].matched, 1);
        assert_eq!(report.total_notified(), 2);

        let mut days: Vec<u32> = h
            .notifier
            .sent()
            .await
            .into_iter()
            .filter_map(|n| match n {
                SentNotification::ExpiryWarning { days_left, .. } => Some(days_left),
                _ => None,
            })
            .collect();
        days.sort_unstable();
        assert_eq!(days, vec![3, 7]);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_fatal() {
        let h = harness();
        let now = datetime!(2026-10-19 09:00 UTC);
        seed(&h, datetime!(2026-10-26 10:00 UTC), SubscriptionStatus::Active).await;
        h.notifier.set_failing(true);

        let SweepOutcome::Completed(report) = h.scheduler.run_sweep(now).await.unwrap() else {
            panic!("sweep skipped");
        };
        assert_eq!(report.thresholds[0].failed, 1);
        assert_eq!(report.total_notified(), 0);
    }

    #[tokio::test]
    async fn test_failed_threshold_does_not_stop_the_others() {
        let h = harness();
        let now = datetime!(2026-10-19 09:00 UTC);
        let due_in_three = seed(&h, datetime!(2026-10-22 15:00 UTC), SubscriptionStatus::Active).await;
        h.store.fail_expiring_on(time::macros::date!(2026-10-26)).await;

        let SweepOutcome::Completed(report) = h.scheduler.run_sweep(now).await.unwrap() else {
            panic!("sweep skipped");
        };

        let seven = &report.thresholds[0];
        assert_eq!(seven.threshold_days, 7);
        assert!(seven.error.is_some());
        assert_eq!(seven.matched, 0);

        let three = &report.thresholds[1];
        assert_eq!(three.threshold_days, 3);
        assert_eq!(three.error, None);
        assert_eq!(three.notified, 1);
        assert_eq!(report.errored().count(), 1);

        let sent = h.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            SentNotification::ExpiryWarning { email, days_left: 3, .. }
                if email == &format!("{due_in_three}@example.com")
        ));
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let h = harness();
        let now = datetime!(2026-10-19 09:00 UTC);
        seed(&h, datetime!(2026-10-26 10:00 UTC), SubscriptionStatus::Active).await;

        let held = h.scheduler.guard.lock().await;
        assert_eq!(
            h.scheduler.run_sweep(now).await.unwrap(),
            SweepOutcome::SkippedOverlap
        );
        drop(held);

        assert!(matches!(
            h.scheduler.run_sweep(now).await.unwrap(),
            SweepOutcome::Completed(_)
        ));
        assert_eq!(h.notifier.sent().await.len(), 1);
    }
}
