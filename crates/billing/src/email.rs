//! Billing notifications
//!
//! Delivery is best effort: callers log failures and move on, a notification
//! never rolls back a subscription change.

use async_trait::async_trait;
use estate_shared::PlanTier;
use serde::Serialize;
use time::OffsetDateTime;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::storage::TenantContact;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Outbound notification channel
#[async_trait]
pub trait BillingNotifier: Send + Sync {
    /// Welcome (new subscription) or renewal confirmation
    async fn subscription_started(
        &self,
        contact: &TenantContact,
        tier: PlanTier,
        period_end: OffsetDateTime,
        is_renewal: bool,
    ) -> BillingResult<()>;

    async fn subscription_cancelled(
        &self,
        contact: &TenantContact,
        tier: PlanTier,
        access_until: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn expiry_warning(
        &self,
        contact: &TenantContact,
        tier: PlanTier,
        period_end: OffsetDateTime,
        days_left: u32,
    ) -> BillingResult<()>;
}

/// Email settings
#[derive(Clone)]
pub struct EmailConfig {
    pub resend_api_key: String,
    pub from_address: String,
}

impl EmailConfig {
    /// Read `RESEND_API_KEY` and `EMAIL_FROM`. An empty key disables delivery.
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "EstatePage <billing@estatepage.com>".to_string()),
        }
    }
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// Resend-backed notifier
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    http: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        if self.config.resend_api_key.is_empty() {
            tracing::warn!(to = %to, subject = %subject, "RESEND_API_KEY not set, skipping email");
            return Ok(());
        }

        let response = self
            .http
            .post(RESEND_API_URL)
            .bearer_auth(&self.config.resend_api_key)
            .json(&ResendEmail {
                from: &self.config.from_address,
                to: [to],
                subject,
                html,
            })
            .send()
            .await
            .map_err(|e| BillingError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Notification(format!(
                "resend returned {}: {}",
                status, body
            )));
        }

        tracing::debug!(to = %to, subject = %subject, "Billing email sent");
        Ok(())
    }
}

fn format_date(at: OffsetDateTime) -> String {
    format!("{} {}, {}", at.month(), at.day(), at.year())
}

#[async_trait]
impl BillingNotifier for BillingEmailService {
    async fn subscription_started(
        &self,
        contact: &TenantContact,
        tier: PlanTier,
        period_end: OffsetDateTime,
        is_renewal: bool,
    ) -> BillingResult<()> {
        let subject = if is_renewal {
            "Your EstatePage subscription has been renewed"
        } else {
            "Welcome to EstatePage Premium"
        };
        let limits = PlanCatalog::limits_for(tier);
        let html = format!(
            "<p>Hi {},</p><p>Your {} plan is active until {}. You can publish up to {} listings.</p>",
            contact.greeting_name(),
            tier.display_name(),
            format_date(period_end),
            limits.max_listings,
        );
        self.send(&contact.email, subject, &html).await
    }

    async fn subscription_cancelled(
        &self,
        contact: &TenantContact,
        tier: PlanTier,
        access_until: OffsetDateTime,
    ) -> BillingResult<()> {
        let html = format!(
            "<p>Hi {},</p><p>Your {} subscription has been cancelled. Paid features remain available until {}.</p>",
            contact.greeting_name(),
            tier.display_name(),
            format_date(access_until),
        );
        self.send(
            &contact.email,
            "Your subscription has been cancelled",
            &html,
        )
        .await
    }

    async fn expiry_warning(
        &self,
        contact: &TenantContact,
        tier: PlanTier,
        period_end: OffsetDateTime,
        days_left: u32,
    ) -> BillingResult<()> {
        let subject = format!("Your subscription expires in {} days", days_left);
        let html = format!(
            "<p>Hi {},</p><p>Your {} plan ends on {}. Renew to keep your listings online.</p>",
            contact.greeting_name(),
            tier.display_name(),
            format_date(period_end),
        );
        self.send(&contact.email, &subject, &html).await
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use recording::{RecordingNotifier, SentNotification};

#[cfg(any(test, feature = "test-support"))]
mod recording {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SentNotification {
        Started {
            email: String,
            tier: PlanTier,
            is_renewal: bool,
        },
        Cancelled {
            email: String,
            tier: PlanTier,
        },
        ExpiryWarning {
            email: String,
            days_left: u32,
        },
    }

    /// Captures notifications instead of sending them
    #[derive(Default)]
    pub struct RecordingNotifier {
        fail: AtomicBool,
        sent: Mutex<Vec<SentNotification>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every call fails (after being recorded)
        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub async fn sent(&self) -> Vec<SentNotification> {
            self.sent.lock().await.clone()
        }

        async fn record(&self, notification: SentNotification) -> BillingResult<()> {
            self.sent.lock().await.push(notification);
            if self.fail.load(Ordering::SeqCst) {
                return Err(BillingError::Notification(
                    "mailbox unavailable (simulated)".to_string(),
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BillingNotifier for RecordingNotifier {
        async fn subscription_started(
            &self,
            contact: &TenantContact,
            tier: PlanTier,
            _period_end: OffsetDateTime,
            is_renewal: bool,
        ) -> BillingResult<()> {
            self.record(SentNotification::Started {
                email: contact.email.clone(),
                tier,
                is_renewal,
            })
            .await
        }

        async fn subscription_cancelled(
            &self,
            contact: &TenantContact,
            tier: PlanTier,
            _access_until: OffsetDateTime,
        ) -> BillingResult<()> {
            self.record(SentNotification::Cancelled {
                email: contact.email.clone(),
                tier,
            })
            .await
        }

        async fn expiry_warning(
            &self,
            contact: &TenantContact,
            _tier: PlanTier,
            _period_end: OffsetDateTime,
            days_left: u32,
        ) -> BillingResult<()> {
            self.record(SentNotification::ExpiryWarning {
                email: contact.email.clone(),
                days_left,
            })
            .await
        }
    }
}
