//! EstatePage Background Worker
//!
//! Handles scheduled jobs:
//! - Subscription expiry warnings (daily at 09:00 UTC)
//! - Subscription invariant checks (daily at 05:00 UTC)

use std::sync::Arc;
use std::time::Duration;

use estate_billing::{
    parse_thresholds, BillingEmailService, EmailConfig, EntitlementResolver, InvariantChecker,
    LifecycleScheduler, PgBillingStore, PlanCatalog, SweepOutcome, SweepReport,
    DEFAULT_WARNING_DAYS,
};
use estate_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const EXPIRY_SWEEP_CRON: &str = "0 0 9 * * *";
const INVARIANT_CHECK_CRON: &str = "0 0 5 * * *";

fn warning_thresholds() -> anyhow::Result<Vec<u32>> {
    match std::env::var("EXPIRY_WARNING_DAYS") {
        Ok(raw) if !raw.trim().is_empty() => Ok(parse_thresholds(&raw)?),
        _ => Ok(DEFAULT_WARNING_DAYS.to_vec()),
    }
}

/// Log results of an expiry sweep
fn log_sweep_report(report: &SweepReport) {
    for threshold in &report.thresholds {
        if let Some(e) = &threshold.error {
            error!(
                threshold_days = threshold.threshold_days,
                target_date = %threshold.target_date,
                error = %e,
                "Expiry threshold could not be swept"
            );
            continue;
        }
        info!(
            threshold_days = threshold.threshold_days,
            target_date = %threshold.target_date,
            matched = threshold.matched,
            notified = threshold.notified,
            failed = threshold.failed,
            "Expiry threshold result"
        );
    }

    if report.total_failed() > 0 {
        warn!(
            failed = report.total_failed(),
            "Some expiry warnings were not delivered"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting EstatePage Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let store = Arc::new(PgBillingStore::new(pool));
    let catalog = Arc::new(PlanCatalog::from_env()?);
    let notifier = Arc::new(BillingEmailService::new(EmailConfig::from_env()));
    let thresholds = warning_thresholds()?;
    info!(thresholds = ?thresholds, "Expiry warning thresholds configured");

    let resolver = EntitlementResolver::new(catalog.clone(), store.clone());
    let lifecycle = Arc::new(LifecycleScheduler::new(
        store.clone(),
        resolver,
        notifier,
        thresholds,
    ));
    let invariants = Arc::new(InvariantChecker::new(store, catalog));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expiry warnings
    let sweep_lifecycle = lifecycle.clone();
    scheduler
        .add(Job::new_async(EXPIRY_SWEEP_CRON, move |_uuid, _l| {
            let lifecycle = sweep_lifecycle.clone();
            Box::pin(async move {
                info!("Running subscription expiry sweep");
                match lifecycle.run_sweep(OffsetDateTime::now_utc()).await {
                    Ok(SweepOutcome::Completed(report)) => log_sweep_report(&report),
                    Ok(SweepOutcome::SkippedOverlap) => {
                        warn!("Previous expiry sweep still running, tick skipped")
                    }
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription expiry warnings (daily at 09:00 UTC)");

    // Job 2: Consistency checks over current subscription records
    let check_invariants = invariants.clone();
    scheduler
        .add(Job::new_async(INVARIANT_CHECK_CRON, move |_uuid, _l| {
            let checker = check_invariants.clone();
            Box::pin(async move {
                match checker.run_all(OffsetDateTime::now_utc()).await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Subscription invariants hold")
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                tenant_ids = ?violation.tenant_ids,
                                "{}",
                                violation.description
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription invariant checks (daily at 05:00 UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("EstatePage Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
