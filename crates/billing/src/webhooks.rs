//! Billing webhook handling
//!
//! Verifies the processor signature over the raw body, decodes the event
//! envelope into a reconciler event and applies it once. A delivery claims its
//! event id in the processed-event ledger before applying it; concurrent
//! duplicates lose the claim. A failed application gives the claim back so the
//! processor's redelivery runs again.

use std::collections::HashMap;
use std::sync::Arc;

use estate_shared::TenantId;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::reconciler::{
    BillingReconciler, CheckoutCompleted, ProcessorStatus, ReconcileOutcome, SubscriptionDeleted,
    SubscriptionUpdated,
};
use crate::storage::SubscriptionStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew accepted on the signature timestamp
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

// =============================================================================
// Envelope
// =============================================================================

/// Signed event envelope `{id, type, created, data: {object}}`
#[derive(Debug, Clone, Deserialize)]
pub struct BillingEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds when the processor created the event
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl BillingEvent {
    fn occurred_at(&self) -> BillingResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.created)
            .map_err(|e| BillingError::InvalidPayload(format!("created: {}", e)))
    }

    fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::InvalidPayload(format!("{} object: {}", self.event_type, e))
        })
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    client_reference_id: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    /// Subscription id, or the expanded subscription object
    #[serde(default)]
    subscription: Option<serde_json::Value>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    ended_at: Option<i64>,
    #[serde(default)]
    items: Option<ItemList>,
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    #[serde(default)]
    price: Option<PriceRef>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PriceRef {
    id: String,
}

impl SubscriptionObject {
    fn price_id(&self) -> Option<String> {
        self.items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.clone())
    }

    /// Newer API versions report the period on the item instead of the subscription
    fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .or_else(|| {
                self.items
                    .as_ref()
                    .and_then(|items| items.data.first())
                    .and_then(|item| item.current_period_end)
            })
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }
}

/// One calendar month later, clamping the day (Jan 31 -> Feb 28/29)
fn add_one_month(at: OffsetDateTime) -> OffsetDateTime {
    let (year, month) = match at.month() {
        time::Month::December => (at.year() + 1, time::Month::January),
        m => (at.year(), m.next()),
    };
    let day = at.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => at.replace_date(date),
        Err(_) => at + Duration::days(30),
    }
}

/// Reconciler input decoded from an envelope
#[derive(Debug, Clone)]
pub enum ReconcilerEvent {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionUpdated(SubscriptionUpdated),
    SubscriptionDeleted(SubscriptionDeleted),
}

/// Decode an envelope. `Ok(None)` means the event type is not handled.
pub fn decode_event(event: &BillingEvent) -> BillingResult<Option<ReconcilerEvent>> {
    let occurred_at = event.occurred_at()?;

    match event.event_type.as_str() {
        CHECKOUT_COMPLETED => {
            let session: CheckoutSessionObject = event.object()?;

            let (external_subscription_id, expanded) = match &session.subscription {
                Some(serde_json::Value::String(id)) => (id.clone(), None),
                Some(object @ serde_json::Value::Object(_)) => {
                    let sub: SubscriptionObject = serde_json::from_value(object.clone())
                        .map_err(|e| BillingError::InvalidPayload(format!("subscription: {}", e)))?;
                    (sub.id.clone(), Some(sub))
                }
                _ if session.mode.as_deref() == Some("subscription") => {
                    return Err(BillingError::InvalidPayload(
                        "subscription checkout without a subscription id".to_string(),
                    ))
                }
                // One-off payment checkout, nothing to entitle
                _ => return Ok(None),
            };

            let tenant_raw = session
                .client_reference_id
                .as_deref()
                .or_else(|| session.metadata.get("tenant_id").map(String::as_str))
                .ok_or_else(|| {
                    BillingError::InvalidPayload("checkout without client_reference_id".to_string())
                })?;
            let tenant_id = Uuid::parse_str(tenant_raw.trim())
                .map(TenantId)
                .map_err(|e| BillingError::InvalidPayload(format!("client_reference_id: {}", e)))?;

            let external_plan_reference = expanded
                .as_ref()
                .and_then(SubscriptionObject::price_id)
                .or_else(|| session.metadata.get("price_id").cloned())
                .unwrap_or_default();
            let period_end = expanded
                .as_ref()
                .and_then(SubscriptionObject::period_end)
                .unwrap_or_else(|| add_one_month(occurred_at));

            Ok(Some(ReconcilerEvent::CheckoutCompleted(CheckoutCompleted {
                tenant_id,
                external_subscription_id,
                external_plan_reference,
                period_end,
                occurred_at,
            })))
        }
        SUBSCRIPTION_UPDATED => {
            let sub: SubscriptionObject = event.object()?;
            let period_end = sub.period_end().ok_or_else(|| {
                BillingError::InvalidPayload("subscription without current_period_end".to_string())
            })?;

            Ok(Some(ReconcilerEvent::SubscriptionUpdated(SubscriptionUpdated {
                status: ProcessorStatus::parse(&sub.status),
                cancel_at_period_end: sub.cancel_at_period_end,
                external_plan_reference: sub.price_id(),
                period_end,
                occurred_at,
                external_subscription_id: sub.id,
            })))
        }
        SUBSCRIPTION_DELETED => {
            let sub: SubscriptionObject = event.object()?;
            Ok(Some(ReconcilerEvent::SubscriptionDeleted(SubscriptionDeleted {
                ended_at: sub
                    .ended_at
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
                occurred_at,
                external_subscription_id: sub.id,
            })))
        }
        _ => Ok(None),
    }
}

// =============================================================================
// Signatures
// =============================================================================

struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

/// Parse `t=<unix>,v1=<hex>[,v1=<hex>...]`; other schemes are ignored
fn parse_signature_header(header: &str) -> BillingResult<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(BillingError::InvalidSignature);
        };
        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(BillingError::InvalidSignature);
    }
    Ok(SignatureParts {
        timestamp,
        signatures,
    })
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a signature header the way the processor does
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<String> {
    let signature = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
}

// =============================================================================
// Handler
// =============================================================================

/// Result of handling one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed(ReconcileOutcome),
    /// Event type this system does not act on
    Ignored,
    /// Event id already in the ledger
    AlreadyProcessed,
}

/// Webhook entry point
#[derive(Clone)]
pub struct WebhookHandler {
    webhook_secret: String,
    reconciler: BillingReconciler,
    store: Arc<dyn SubscriptionStore>,
}

impl WebhookHandler {
    pub fn new(webhook_secret: impl Into<String>, reconciler: BillingReconciler) -> Self {
        let store = reconciler.store().clone();
        Self {
            webhook_secret: webhook_secret.into(),
            reconciler,
            store,
        }
    }

    /// Verify the signature header against the raw body and parse the envelope
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<BillingEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc())
    }

    pub fn verify_event_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: OffsetDateTime,
    ) -> BillingResult<BillingEvent> {
        let parts = parse_signature_header(signature).inspect_err(|_| {
            tracing::warn!("Malformed webhook signature header");
        })?;

        let skew = (now.unix_timestamp() - parts.timestamp).abs();
        if skew > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = parts.timestamp,
                skew_secs = skew,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::InvalidSignature);
        }

        let expected = compute_signature(&self.webhook_secret, parts.timestamp, payload)?;
        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| bool::from(expected.ct_eq(&provided)))
                .unwrap_or(false)
        });
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::InvalidSignature);
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse webhook payload");
            BillingError::InvalidPayload("malformed event envelope".to_string())
        })
    }

    /// Apply a verified event at most once
    pub async fn handle_event(&self, event: BillingEvent) -> BillingResult<WebhookOutcome> {
        let Some(decoded) = decode_event(&event)? else {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring unhandled webhook event"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        if !self.store.claim_event(&event.id, &event.event_type).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook delivery, already claimed"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let outcome = match self.apply(decoded).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_claim(&event).await;
                if matches!(e, BillingError::UnknownSubscriptionReference { .. }) {
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Event arrived before its checkout, asking sender to retry"
                    );
                } else {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Failed to apply webhook event"
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Webhook event processed"
        );
        Ok(WebhookOutcome::Processed(outcome))
    }

    async fn apply(&self, decoded: ReconcilerEvent) -> BillingResult<ReconcileOutcome> {
        match decoded {
            ReconcilerEvent::CheckoutCompleted(e) => {
                let checkout = self.with_plan_reference(e).await?;
                self.reconciler.apply_checkout_completed(&checkout).await
            }
            ReconcilerEvent::SubscriptionUpdated(e) => {
                self.reconciler.apply_subscription_updated(&e).await
            }
            ReconcilerEvent::SubscriptionDeleted(e) => {
                self.reconciler.apply_subscription_deleted(&e).await
            }
        }
    }

    /// Sessions that only carry the subscription id get their price and
    /// period from the processor
    async fn with_plan_reference(
        &self,
        mut checkout: CheckoutCompleted,
    ) -> BillingResult<CheckoutCompleted> {
        if !checkout.external_plan_reference.trim().is_empty() {
            return Ok(checkout);
        }

        let subscription = self
            .reconciler
            .processor()
            .retrieve_subscription(&checkout.external_subscription_id)
            .await?;
        let price_id = subscription
            .price_id
            .filter(|price| !price.trim().is_empty())
            .ok_or_else(|| {
                BillingError::processor(
                    "retrieve_subscription",
                    format!(
                        "subscription {} has no price",
                        checkout.external_subscription_id
                    ),
                )
            })?;

        tracing::info!(
            tenant_id = %checkout.tenant_id,
            external_subscription_id = %checkout.external_subscription_id,
            price_id = %price_id,
            "Resolved checkout plan from processor"
        );
        checkout.external_plan_reference = price_id;
        checkout.period_end = subscription.period_end;
        Ok(checkout)
    }

    async fn release_claim(&self, event: &BillingEvent) {
        if let Err(e) = self.store.release_event(&event.id).await {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Failed to release webhook claim, redelivery will be skipped"
            );
        }
    }

    /// Verify then handle
    pub async fn process(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(event).await
    }
}
