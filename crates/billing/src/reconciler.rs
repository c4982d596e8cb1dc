//! Billing reconciliation
//!
//! Applies processor events and the tenant-initiated cancellation to the local
//! [`TenantSubscription`] record. Events are matched by external subscription
//! id, never by arrival order. Writes are version-conditional; a lost race is
//! retried from a fresh read so concurrent deliveries for the same
//! subscription serialize through the store instead of an in-process lock.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use estate_shared::{PlanTier, SubscriptionStatus, TenantId};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::catalog::PlanCatalog;
use crate::client::PaymentProcessor;
use crate::email::BillingNotifier;
use crate::error::{BillingError, BillingResult};
use crate::storage::{SubscriptionStore, TenantContact, TenantSubscription};

/// Attempts per event before giving up with `ConcurrentModification`
const MAX_WRITE_ATTEMPTS: usize = 4;

// =============================================================================
// Events
// =============================================================================

/// Status reported by the processor on a subscription object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorStatus {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Canceled,
    Paused,
    Other(String),
}

impl ProcessorStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "unpaid" => Self::Unpaid,
            "canceled" => Self::Canceled,
            "paused" => Self::Paused,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A checkout finished and a subscription exists on the processor
#[derive(Debug, Clone)]
pub struct CheckoutCompleted {
    pub tenant_id: TenantId,
    pub external_subscription_id: String,
    pub external_plan_reference: String,
    pub period_end: OffsetDateTime,
    pub occurred_at: OffsetDateTime,
}

/// The processor changed a subscription (renewal, plan change, cancel flag)
#[derive(Debug, Clone)]
pub struct SubscriptionUpdated {
    pub external_subscription_id: String,
    pub status: ProcessorStatus,
    pub cancel_at_period_end: bool,
    pub external_plan_reference: Option<String>,
    pub period_end: OffsetDateTime,
    pub occurred_at: OffsetDateTime,
}

/// The processor ended a subscription
#[derive(Debug, Clone)]
pub struct SubscriptionDeleted {
    pub external_subscription_id: String,
    pub ended_at: Option<OffsetDateTime>,
    pub occurred_at: OffsetDateTime,
}

/// What applying an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    /// A new checkout closed an older current record
    Superseded { previous_external_id: String },
    Transitioned {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    /// Period or plan changed, status did not
    Refreshed,
    /// Nothing to do; the record already reflects the event
    NoOp,
    /// The event is older than the last one applied
    Stale,
}

/// Remaining paid access after a cancellation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancellationWindow {
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub days_remaining: i64,
    pub status: SubscriptionStatus,
}

impl CancellationWindow {
    pub fn new(period_end: OffsetDateTime, now: OffsetDateTime) -> Self {
        let seconds = (period_end - now).whole_seconds().max(0);
        Self {
            period_end,
            days_remaining: (seconds + 86_399) / 86_400,
            status: SubscriptionStatus::Cancelling,
        }
    }
}

/// Local status implied by a processor update, or `None` to keep the current one
fn status_from_processor(status: &ProcessorStatus, cancel_at_period_end: bool) -> Option<SubscriptionStatus> {
    match status {
        ProcessorStatus::Canceled => Some(SubscriptionStatus::Cancelled),
        ProcessorStatus::IncompleteExpired | ProcessorStatus::Unpaid => {
            Some(SubscriptionStatus::Expired)
        }
        ProcessorStatus::Active | ProcessorStatus::Trialing if cancel_at_period_end => {
            Some(SubscriptionStatus::Cancelling)
        }
        ProcessorStatus::Active | ProcessorStatus::Trialing => Some(SubscriptionStatus::Active),
        ProcessorStatus::PastDue
        | ProcessorStatus::Incomplete
        | ProcessorStatus::Paused
        | ProcessorStatus::Other(_) => None,
    }
}

fn is_conflict(err: &BillingError) -> bool {
    matches!(err, BillingError::ConcurrentModification { .. })
}

fn conflict(external_subscription_id: &str) -> BillingError {
    BillingError::ConcurrentModification {
        external_subscription_id: external_subscription_id.to_string(),
    }
}

fn write_backoff() -> impl Iterator<Item = StdDuration> {
    ExponentialBackoff::from_millis(5)
        .max_delay(StdDuration::from_millis(100))
        .map(jitter)
        .take(MAX_WRITE_ATTEMPTS - 1)
}

// =============================================================================
// Reconciler
// =============================================================================

/// Sole writer of [`TenantSubscription`] records
#[derive(Clone)]
pub struct BillingReconciler {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
    processor: Arc<dyn PaymentProcessor>,
    notifier: Arc<dyn BillingNotifier>,
}

impl BillingReconciler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<PlanCatalog>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Arc<dyn BillingNotifier>,
    ) -> Self {
        Self {
            store,
            catalog,
            processor,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    pub fn processor(&self) -> &Arc<dyn PaymentProcessor> {
        &self.processor
    }

    // -------------------------------------------------------------------------
    // Checkout
    // -------------------------------------------------------------------------

    pub async fn apply_checkout_completed(
        &self,
        event: &CheckoutCompleted,
    ) -> BillingResult<ReconcileOutcome> {
        // A paid checkout is never recorded without knowing what was bought
        if event.external_plan_reference.trim().is_empty() {
            return Err(BillingError::InvalidPayload(format!(
                "checkout for {} has no plan reference",
                event.external_subscription_id
            )));
        }

        let outcome = RetryIf::spawn(
            write_backoff(),
            || self.try_checkout_completed(event),
            is_conflict,
        )
        .await?;

        if matches!(
            outcome,
            ReconcileOutcome::Created | ReconcileOutcome::Superseded { .. }
        ) {
            let tier = self
                .catalog
                .tier_from_external_reference(&event.external_plan_reference);
            tracing::info!(
                tenant_id = %event.tenant_id,
                external_subscription_id = %event.external_subscription_id,
                tier = %tier,
                "Subscription activated"
            );
            self.notify_started(event.tenant_id, tier, event.period_end, false)
                .await;
        }

        Ok(outcome)
    }

    async fn try_checkout_completed(
        &self,
        event: &CheckoutCompleted,
    ) -> BillingResult<ReconcileOutcome> {
        if let Some(existing) = self
            .store
            .find_by_external_id(&event.external_subscription_id)
            .await?
        {
            if existing.tenant_id != event.tenant_id {
                tracing::warn!(
                    tenant_id = %event.tenant_id,
                    owner_tenant_id = %existing.tenant_id,
                    external_subscription_id = %event.external_subscription_id,
                    "Checkout references a subscription owned by another tenant, ignoring"
                );
            }
            return Ok(ReconcileOutcome::NoOp);
        }

        let next = TenantSubscription::activated(
            event.tenant_id,
            &event.external_subscription_id,
            &event.external_plan_reference,
            event.period_end,
            event.occurred_at,
        );

        match self.store.current_subscription(event.tenant_id).await? {
            None => {
                if !self.store.insert_subscription(&next).await? {
                    return Err(conflict(&event.external_subscription_id));
                }
                Ok(ReconcileOutcome::Created)
            }
            Some(previous) => {
                let previous_external_id = previous.external_subscription_id.clone();
                let mut closed = previous;
                closed.status = SubscriptionStatus::Cancelled;
                closed.last_event_at = Some(event.occurred_at.max(
                    closed.last_event_at.unwrap_or(event.occurred_at),
                ));

                if !self.store.replace_current(&closed, &next).await? {
                    return Err(conflict(&event.external_subscription_id));
                }
                tracing::info!(
                    tenant_id = %event.tenant_id,
                    previous_external_id = %previous_external_id,
                    external_subscription_id = %event.external_subscription_id,
                    "New checkout superseded the current subscription"
                );
                Ok(ReconcileOutcome::Superseded {
                    previous_external_id,
                })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Processor updates
    // -------------------------------------------------------------------------

    pub async fn apply_subscription_updated(
        &self,
        event: &SubscriptionUpdated,
    ) -> BillingResult<ReconcileOutcome> {
        let (outcome, before, after) = RetryIf::spawn(
            write_backoff(),
            || self.try_subscription_updated(event),
            is_conflict,
        )
        .await?;

        let (Some(before), Some(after)) = (before, after) else {
            return Ok(outcome);
        };

        tracing::info!(
            tenant_id = %after.tenant_id,
            external_subscription_id = %after.external_subscription_id,
            from = %before.status,
            to = %after.status,
            "Subscription updated"
        );

        let tier = self
            .catalog
            .tier_from_external_reference(&after.external_plan_reference);
        match after.status {
            SubscriptionStatus::Active if after.period_end > before.period_end => {
                self.notify_started(after.tenant_id, tier, after.period_end, true)
                    .await;
            }
            SubscriptionStatus::Cancelled if before.status != SubscriptionStatus::Cancelled => {
                self.notify_cancelled(after.tenant_id, tier, event.occurred_at)
                    .await;
            }
            _ => {}
        }

        Ok(outcome)
    }

    async fn try_subscription_updated(
        &self,
        event: &SubscriptionUpdated,
    ) -> BillingResult<(
        ReconcileOutcome,
        Option<TenantSubscription>,
        Option<TenantSubscription>,
    )> {
        let record = self
            .store
            .find_by_external_id(&event.external_subscription_id)
            .await?
            .ok_or_else(|| BillingError::UnknownSubscriptionReference {
                external_subscription_id: event.external_subscription_id.clone(),
            })?;

        if record.is_stale(event.occurred_at) {
            tracing::info!(
                external_subscription_id = %event.external_subscription_id,
                "Ignoring subscription update older than the last applied event"
            );
            return Ok((ReconcileOutcome::Stale, None, None));
        }

        // Terminal records are history; a resubscription arrives as a new checkout
        if !record.status.is_current() {
            return Ok((ReconcileOutcome::NoOp, None, None));
        }

        let status = status_from_processor(&event.status, event.cancel_at_period_end)
            .unwrap_or(record.status);

        let mut next = record.clone();
        next.status = status;
        next.period_end = event.period_end;
        if let Some(plan) = event.external_plan_reference.as_deref() {
            next.external_plan_reference = plan.to_string();
        }
        next.cancellation_requested_at = match status {
            SubscriptionStatus::Active => None,
            SubscriptionStatus::Cancelling => {
                Some(record.cancellation_requested_at.unwrap_or(event.occurred_at))
            }
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => {
                record.cancellation_requested_at
            }
        };

        let changed = next.status != record.status
            || next.period_end != record.period_end
            || next.external_plan_reference != record.external_plan_reference
            || next.cancellation_requested_at != record.cancellation_requested_at;
        if !changed {
            return Ok((ReconcileOutcome::NoOp, None, None));
        }

        next.last_event_at = Some(event.occurred_at);
        if !self.store.update_subscription(&next).await? {
            return Err(conflict(&event.external_subscription_id));
        }

        let outcome = if next.status != record.status {
            ReconcileOutcome::Transitioned {
                from: record.status,
                to: next.status,
            }
        } else {
            ReconcileOutcome::Refreshed
        };
        Ok((outcome, Some(record), Some(next)))
    }

    /// Processor ended the subscription. Terminal, so applied regardless of
    /// event order.
    pub async fn apply_subscription_deleted(
        &self,
        event: &SubscriptionDeleted,
    ) -> BillingResult<ReconcileOutcome> {
        let result = RetryIf::spawn(
            write_backoff(),
            || self.try_subscription_deleted(event),
            is_conflict,
        )
        .await?;

        let Some(before) = result else {
            return Ok(ReconcileOutcome::NoOp);
        };

        tracing::info!(
            tenant_id = %before.tenant_id,
            external_subscription_id = %before.external_subscription_id,
            from = %before.status,
            "Subscription cancelled by processor"
        );

        let tier = self
            .catalog
            .tier_from_external_reference(&before.external_plan_reference);
        self.notify_cancelled(
            before.tenant_id,
            tier,
            event.ended_at.unwrap_or(event.occurred_at),
        )
        .await;

        Ok(ReconcileOutcome::Transitioned {
            from: before.status,
            to: SubscriptionStatus::Cancelled,
        })
    }

    async fn try_subscription_deleted(
        &self,
        event: &SubscriptionDeleted,
    ) -> BillingResult<Option<TenantSubscription>> {
        let record = self
            .store
            .find_by_external_id(&event.external_subscription_id)
            .await?
            .ok_or_else(|| BillingError::UnknownSubscriptionReference {
                external_subscription_id: event.external_subscription_id.clone(),
            })?;

        if record.status == SubscriptionStatus::Cancelled {
            return Ok(None);
        }

        let mut next = record.clone();
        next.status = SubscriptionStatus::Cancelled;
        next.last_event_at = Some(match record.last_event_at {
            Some(last) => last.max(event.occurred_at),
            None => event.occurred_at,
        });

        if !self.store.update_subscription(&next).await? {
            return Err(conflict(&event.external_subscription_id));
        }
        Ok(Some(record))
    }

    // -------------------------------------------------------------------------
    // Tenant-initiated cancellation
    // -------------------------------------------------------------------------

    /// Schedule cancellation at period end
    ///
    /// The processor is told first. If that call fails nothing is written
    /// locally and the error goes back to the caller.
    pub async fn request_cancellation(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<CancellationWindow> {
        let current = self
            .store
            .current_subscription(tenant_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(tenant_id))?;

        if current.status == SubscriptionStatus::Cancelling {
            return Err(BillingError::AlreadyCancelling(tenant_id));
        }

        let processor_view = self
            .processor
            .cancel_at_period_end(&current.external_subscription_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    tenant_id = %tenant_id,
                    external_subscription_id = %current.external_subscription_id,
                    error = %e,
                    "Processor rejected cancellation, local record untouched"
                );
                e
            })?;

        let requested_at = OffsetDateTime::now_utc();
        let period_end = RetryIf::spawn(
            write_backoff(),
            || self.try_mark_cancelling(tenant_id, &current, processor_view.period_end, requested_at),
            is_conflict,
        )
        .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            external_subscription_id = %current.external_subscription_id,
            period_end = %period_end,
            "Subscription scheduled for cancellation"
        );

        Ok(CancellationWindow::new(period_end, requested_at))
    }

    async fn try_mark_cancelling(
        &self,
        tenant_id: TenantId,
        current: &TenantSubscription,
        period_end: OffsetDateTime,
        requested_at: OffsetDateTime,
    ) -> BillingResult<OffsetDateTime> {
        let record = self
            .store
            .find_by_external_id(&current.external_subscription_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(tenant_id))?;

        match record.status {
            SubscriptionStatus::Active => {}
            // The processor's own webhook got here first
            SubscriptionStatus::Cancelling => return Ok(record.period_end),
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => {
                return Err(BillingError::NoActiveSubscription(tenant_id))
            }
        }

        let mut next = record;
        next.status = SubscriptionStatus::Cancelling;
        next.cancellation_requested_at = Some(requested_at);
        next.period_end = period_end;

        if !self.store.update_subscription(&next).await? {
            return Err(conflict(&current.external_subscription_id));
        }
        Ok(period_end)
    }

    // -------------------------------------------------------------------------
    // Notifications (best effort)
    // -------------------------------------------------------------------------

    async fn notify_started(
        &self,
        tenant_id: TenantId,
        tier: PlanTier,
        period_end: OffsetDateTime,
        is_renewal: bool,
    ) {
        let Some(contact) = self.contact_for(tenant_id).await else {
            return;
        };
        if let Err(e) = self
            .notifier
            .subscription_started(&contact, tier, period_end, is_renewal)
            .await
        {
            tracing::error!(
                tenant_id = %tenant_id,
                is_renewal = is_renewal,
                error = %e,
                "Failed to send subscription started email"
            );
        }
    }

    async fn notify_cancelled(&self, tenant_id: TenantId, tier: PlanTier, access_until: OffsetDateTime) {
        let Some(contact) = self.contact_for(tenant_id).await else {
            return;
        };
        if let Err(e) = self
            .notifier
            .subscription_cancelled(&contact, tier, access_until)
            .await
        {
            tracing::error!(
                tenant_id = %tenant_id,
                error = %e,
                "Failed to send subscription cancelled email"
            );
        }
    }

    async fn contact_for(&self, tenant_id: TenantId) -> Option<TenantContact> {
        match self.store.tenant_contact(tenant_id).await {
            Ok(Some(contact)) => Some(contact),
            Ok(None) => {
                tracing::warn!(tenant_id = %tenant_id, "No contact on file, skipping notification");
                None
            }
            Err(e) => {
                tracing::error!(tenant_id = %tenant_id, error = %e, "Failed to load tenant contact");
                None
            }
        }
    }
}
