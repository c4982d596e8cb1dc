//! Postgres-backed stores

use async_trait::async_trait;
use estate_shared::{ListingId, TenantId};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{ListingStore, SubscriptionStore, TenantContact, TenantSubscription};
use crate::error::{BillingError, BillingResult};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, tenant_id, external_subscription_id, status, external_plan_reference,
    period_end, cancellation_requested_at, last_event_at, version, created_at, updated_at
"#;

/// Row type for tenant_subscriptions
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    external_subscription_id: String,
    status: String,
    external_plan_reference: String,
    period_end: OffsetDateTime,
    cancellation_requested_at: Option<OffsetDateTime>,
    last_event_at: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for TenantSubscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: estate_shared::ParseEnumError| BillingError::Database(e.to_string()))?;
        Ok(Self {
            id: row.id,
            tenant_id: TenantId(row.tenant_id),
            external_subscription_id: row.external_subscription_id,
            status,
            external_plan_reference: row.external_plan_reference,
            period_end: row.period_end,
            cancellation_requested_at: row.cancellation_requested_at,
            last_event_at: row.last_event_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ContactRow {
    email: String,
    company_name: Option<String>,
}

fn into_records(rows: Vec<SubscriptionRow>) -> BillingResult<Vec<TenantSubscription>> {
    rows.into_iter().map(TenantSubscription::try_from).collect()
}

fn clamp_count(count: i64) -> u32 {
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

/// Billing store over the shared Postgres pool
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_in(
        tx: &mut Transaction<'_, Postgres>,
        sub: &TenantSubscription,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tenant_subscriptions
                (id, tenant_id, external_subscription_id, status, external_plan_reference,
                 period_end, cancellation_requested_at, last_event_at, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(sub.id)
        .bind(sub.tenant_id.0)
        .bind(&sub.external_subscription_id)
        .bind(sub.status.as_str())
        .bind(&sub.external_plan_reference)
        .bind(sub.period_end)
        .bind(sub.cancellation_requested_at)
        .bind(sub.last_event_at)
        .bind(sub.version)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_in(
        tx: &mut Transaction<'_, Postgres>,
        sub: &TenantSubscription,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_subscriptions
            SET status = $3,
                external_plan_reference = $4,
                period_end = $5,
                cancellation_requested_at = $6,
                last_event_at = $7,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(sub.id)
        .bind(sub.version)
        .bind(sub.status.as_str())
        .bind(&sub.external_plan_reference)
        .bind(sub.period_end)
        .bind(sub.cancellation_requested_at)
        .bind(sub.last_event_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn current_subscription(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<TenantSubscription>> {
        let sql = format!(
            "SELECT {} FROM tenant_subscriptions WHERE tenant_id = $1 AND status IN ('active', 'cancelling') ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(tenant_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TenantSubscription::try_from).transpose()
    }

    async fn find_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<TenantSubscription>> {
        let sql = format!(
            "SELECT {} FROM tenant_subscriptions WHERE external_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(external_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TenantSubscription::try_from).transpose()
    }

    async fn insert_subscription(&self, subscription: &TenantSubscription) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_in(&mut tx, subscription).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn update_subscription(&self, subscription: &TenantSubscription) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = Self::update_in(&mut tx, subscription).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn replace_current(
        &self,
        previous: &TenantSubscription,
        next: &TenantSubscription,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        if !Self::update_in(&mut tx, previous).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        if !Self::insert_in(&mut tx, next).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn active_expiring_on(&self, date: Date) -> BillingResult<Vec<TenantSubscription>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM tenant_subscriptions
            WHERE status = 'active'
              AND (period_end AT TIME ZONE 'UTC')::date = $1
            ORDER BY period_end
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    async fn current_subscriptions(&self) -> BillingResult<Vec<TenantSubscription>> {
        let sql = format!(
            "SELECT {} FROM tenant_subscriptions WHERE status IN ('active', 'cancelling') ORDER BY tenant_id, created_at",
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        into_records(rows)
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        // Only the caller whose insert lands gets a row back
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO processed_billing_events (event_id, event_type, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn release_event(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM processed_billing_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn tenant_contact(&self, tenant_id: TenantId) -> BillingResult<Option<TenantContact>> {
        let row: Option<ContactRow> =
            sqlx::query_as("SELECT email, company_name FROM users WHERE id = $1")
                .bind(tenant_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| TenantContact {
            email: r.email,
            company_name: r.company_name,
        }))
    }
}

#[async_trait]
impl ListingStore for PgBillingStore {
    async fn count_listings(&self, tenant_id: TenantId) -> BillingResult<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings WHERE tenant_id = $1")
            .bind(tenant_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(clamp_count(count))
    }

    async fn count_images(&self, tenant_id: TenantId, listing_id: ListingId) -> BillingResult<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM listing_images i
            JOIN listings l ON l.id = i.listing_id
            WHERE l.id = $1 AND l.tenant_id = $2
            "#,
        )
        .bind(listing_id.0)
        .bind(tenant_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(clamp_count(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_count() {
        assert_eq!(clamp_count(-3), 0);
        assert_eq!(clamp_count(7), 7);
        assert_eq!(clamp_count(i64::MAX), u32::MAX);
    }
}
