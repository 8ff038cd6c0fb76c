//! Postgres ledger backend
//!
//! Entitlement and purchase transitions take a `SELECT ... FOR UPDATE` row
//! lock, run the shared domain method, and write back in the same
//! transaction. One-shot claims (reminders, credit grants, webhook events)
//! use `INSERT ... ON CONFLICT` so the database decides the winner.

use std::collections::BTreeSet;

use async_trait::async_trait;
use mediamart_shared::{CostType, MembershipTier, PurchaseStatus};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{LedgerStore, EVENT_PROCESSING_TIMEOUT_MINUTES};
use crate::entitlement::{DowngradeOutcome, MembershipChange, MembershipGrant, UserEntitlement};
use crate::error::{BillingError, BillingResult};
use crate::purchases::{MediaAsset, PendingUpload, PurchaseRecord, PurchaseTransition};
use crate::quota::{self, QuotaEvaluation};
use crate::webhooks::{EventStatus, WebhookEventRecord};

macro_rules! entitlement_select {
    ($tail:literal) => {
        concat!(
            "SELECT user_id, membership_tier, membership_expires_at, free_uploads_used, \
             free_uploads_reset_at, paid_upload_credits, payment_customer_ref, \
             payment_subscription_ref, membership_synced_at, updated_at \
             FROM user_entitlements ",
            $tail
        )
    };
}

macro_rules! purchase_select {
    ($tail:literal) => {
        concat!(
            "SELECT p.id, p.buyer_id, p.media_id, p.amount_cents, p.status, \
             p.checkout_session_id, p.created_at, p.completed_at, p.delete_after, \
             p.asset_deleted_at, \
             COALESCE((SELECT array_agg(r.threshold_days ORDER BY r.threshold_days) \
                       FROM purchase_reminders r WHERE r.purchase_id = p.id), \
                      '{}'::SMALLINT[]) AS reminders_sent \
             FROM purchases p ",
            $tail
        )
    };
}

macro_rules! event_select {
    ($tail:literal) => {
        concat!(
            "SELECT event_id, event_type, payload, status, error_message, \
             processing_started_at, finished_at, created_at \
             FROM webhook_events ",
            $tail
        )
    };
}

#[derive(sqlx::FromRow)]
struct EntitlementRow {
    user_id: Uuid,
    membership_tier: String,
    membership_expires_at: Option<OffsetDateTime>,
    free_uploads_used: i32,
    free_uploads_reset_at: OffsetDateTime,
    paid_upload_credits: i32,
    payment_customer_ref: Option<String>,
    payment_subscription_ref: Option<String>,
    membership_synced_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<EntitlementRow> for UserEntitlement {
    type Error = BillingError;

    fn try_from(row: EntitlementRow) -> Result<Self, Self::Error> {
        let membership_tier: MembershipTier = row
            .membership_tier
            .parse()
            .map_err(BillingError::InvalidTier)?;
        Ok(Self {
            user_id: row.user_id,
            membership_tier,
            membership_expires_at: row.membership_expires_at,
            free_uploads_used: u32::try_from(row.free_uploads_used).unwrap_or(0),
            free_uploads_reset_at: row.free_uploads_reset_at,
            paid_upload_credits: u32::try_from(row.paid_upload_credits).unwrap_or(0),
            payment_customer_ref: row.payment_customer_ref,
            payment_subscription_ref: row.payment_subscription_ref,
            membership_synced_at: row.membership_synced_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PurchaseRow {
    id: Uuid,
    buyer_id: Uuid,
    media_id: Uuid,
    amount_cents: i64,
    status: String,
    checkout_session_id: Option<String>,
    created_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
    delete_after: Option<OffsetDateTime>,
    asset_deleted_at: Option<OffsetDateTime>,
    reminders_sent: Vec<i16>,
}

impl TryFrom<PurchaseRow> for PurchaseRecord {
    type Error = BillingError;

    fn try_from(row: PurchaseRow) -> Result<Self, Self::Error> {
        let status: PurchaseStatus = row.status.parse().map_err(BillingError::Internal)?;
        let reminders_sent: BTreeSet<u8> = row
            .reminders_sent
            .into_iter()
            .filter_map(|t| u8::try_from(t).ok())
            .collect();
        Ok(Self {
            id: row.id,
            buyer_id: row.buyer_id,
            media_id: row.media_id,
            amount_cents: row.amount_cents,
            status,
            checkout_session_id: row.checkout_session_id,
            created_at: row.created_at,
            completed_at: row.completed_at,
            delete_after: row.delete_after,
            reminders_sent,
            asset_deleted_at: row.asset_deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MediaRow {
    id: Uuid,
    owner_id: Uuid,
    title: String,
    storage_key: String,
    price_cents: i64,
    is_sold: bool,
    published_at: OffsetDateTime,
    deleted_at: Option<OffsetDateTime>,
}

impl From<MediaRow> for MediaAsset {
    fn from(row: MediaRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            title: row.title,
            storage_key: row.storage_key,
            price_cents: row.price_cents,
            is_sold: row.is_sold,
            published_at: row.published_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PendingUploadRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    storage_key: String,
    price_cents: i64,
    amount_due_cents: i64,
    created_at: OffsetDateTime,
}

impl From<PendingUploadRow> for PendingUpload {
    fn from(row: PendingUploadRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            storage_key: row.storage_key,
            price_cents: row.price_cents,
            amount_due_cents: row.amount_due_cents,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: String,
    event_type: String,
    payload: String,
    status: String,
    error_message: Option<String>,
    processing_started_at: OffsetDateTime,
    finished_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<EventRow> for WebhookEventRecord {
    type Error = BillingError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: row.event_id,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse().map_err(BillingError::Internal)?,
            error_message: row.error_message,
            processing_started_at: row.processing_started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Ledger backed by the `user_entitlements`, `purchases`, `media_assets`,
/// `pending_uploads` and `webhook_events` tables
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the VIEWER row if missing, then lock it for the rest of `tx`
    async fn lock_entitlement(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<UserEntitlement> {
        let fresh = UserEntitlement::new_viewer(user_id, now);
        sqlx::query(
            r#"
            INSERT INTO user_entitlements (user_id, membership_tier, free_uploads_reset_at)
            VALUES ($1, 'viewer', $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(fresh.free_uploads_reset_at)
        .execute(&mut **tx)
        .await?;

        let row: EntitlementRow =
            sqlx::query_as(entitlement_select!("WHERE user_id = $1 FOR UPDATE"))
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?;
        row.try_into()
    }

    async fn save_entitlement(
        tx: &mut Transaction<'_, Postgres>,
        entitlement: &UserEntitlement,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_entitlements
            SET membership_tier = $2,
                membership_expires_at = $3,
                free_uploads_used = $4,
                free_uploads_reset_at = $5,
                paid_upload_credits = $6,
                payment_customer_ref = $7,
                payment_subscription_ref = $8,
                membership_synced_at = $9,
                updated_at = $10
            WHERE user_id = $1
            "#,
        )
        .bind(entitlement.user_id)
        .bind(entitlement.membership_tier.as_str())
        .bind(entitlement.membership_expires_at)
        .bind(to_i32(entitlement.free_uploads_used))
        .bind(entitlement.free_uploads_reset_at)
        .bind(to_i32(entitlement.paid_upload_credits))
        .bind(&entitlement.payment_customer_ref)
        .bind(&entitlement.payment_subscription_ref)
        .bind(entitlement.membership_synced_at)
        .bind(entitlement.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn lock_purchase(
        tx: &mut Transaction<'_, Postgres>,
        purchase_id: Uuid,
    ) -> BillingResult<Option<PurchaseRecord>> {
        let row: Option<PurchaseRow> =
            sqlx::query_as(purchase_select!("WHERE p.id = $1 FOR UPDATE OF p"))
                .bind(purchase_id)
                .fetch_optional(&mut **tx)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn fetch_purchases(
        &self,
        sql: &'static str,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PurchaseRecord>> {
        let rows: Vec<PurchaseRow> = sqlx::query_as(sql).bind(now).fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn get_entitlement(&self, user_id: Uuid) -> BillingResult<Option<UserEntitlement>> {
        let row: Option<EntitlementRow> = sqlx::query_as(entitlement_select!("WHERE user_id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn ensure_entitlement(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<UserEntitlement> {
        let fresh = UserEntitlement::new_viewer(user_id, now);
        sqlx::query(
            r#"
            INSERT INTO user_entitlements (user_id, membership_tier, free_uploads_reset_at)
            VALUES ($1, 'viewer', $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(fresh.free_uploads_reset_at)
        .execute(&self.pool)
        .await?;

        self.get_entitlement(user_id)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("Entitlement {} vanished", user_id)))
    }

    async fn apply_membership(
        &self,
        grant: &MembershipGrant,
        now: OffsetDateTime,
    ) -> BillingResult<MembershipChange> {
        let mut tx = self.pool.begin().await?;
        let mut entitlement = Self::lock_entitlement(&mut tx, grant.user_id, now).await?;
        let change = entitlement.apply_membership(grant, now);
        if change != MembershipChange::Stale {
            Self::save_entitlement(&mut tx, &entitlement).await?;
        }
        tx.commit().await?;
        Ok(change)
    }

    async fn downgrade_to_viewer(
        &self,
        user_id: Uuid,
        subscription_ref: Option<&str>,
        observed_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<DowngradeOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut entitlement = Self::lock_entitlement(&mut tx, user_id, now).await?;
        let outcome = entitlement.downgrade_to_viewer(subscription_ref, observed_at, now);
        if matches!(
            outcome,
            DowngradeOutcome::Downgraded { .. } | DowngradeOutcome::AlreadyViewer
        ) {
            Self::save_entitlement(&mut tx, &entitlement).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_user_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM user_entitlements WHERE payment_subscription_ref = $1 LIMIT 1",
        )
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn find_user_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM user_entitlements WHERE payment_customer_ref = $1 LIMIT 1",
        )
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn commit_upload(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaEvaluation> {
        let mut tx = self.pool.begin().await?;
        let mut entitlement = Self::lock_entitlement(&mut tx, user_id, now).await?;
        let rolled = entitlement.roll_quota_period(now);
        let evaluation = quota::evaluate(&entitlement, now);
        entitlement.record_upload(evaluation.cost_type, now);
        if rolled || matches!(evaluation.cost_type, CostType::Free | CostType::PaidCredit) {
            Self::save_entitlement(&mut tx, &entitlement).await?;
        }
        tx.commit().await?;
        Ok(evaluation)
    }

    async fn grant_upload_credits(
        &self,
        user_id: Uuid,
        grant_ref: &str,
        credits: u32,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let mut entitlement = Self::lock_entitlement(&mut tx, user_id, now).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO upload_credit_grants (grant_ref, user_id, credits, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (grant_ref) DO NOTHING
            "#,
        )
        .bind(grant_ref)
        .bind(user_id)
        .bind(to_i32(credits))
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        entitlement.add_credits(credits, now);
        Self::save_entitlement(&mut tx, &entitlement).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn contact_email(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(email,)| email))
    }

    async fn list_entitlements(&self) -> BillingResult<Vec<UserEntitlement>> {
        let rows: Vec<EntitlementRow> = sqlx::query_as(entitlement_select!("ORDER BY user_id"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_media(&self, media: &MediaAsset) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO media_assets
                (id, owner_id, title, storage_key, price_cents, is_sold, published_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(media.id)
        .bind(media.owner_id)
        .bind(&media.title)
        .bind(&media.storage_key)
        .bind(media.price_cents)
        .bind(media.is_sold)
        .bind(media.published_at)
        .bind(media.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_media(&self, media_id: Uuid) -> BillingResult<Option<MediaAsset>> {
        let row: Option<MediaRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, title, storage_key, price_cents, is_sold, published_at, deleted_at
            FROM media_assets
            WHERE id = $1
            "#,
        )
        .bind(media_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_purchase(&self, purchase: &PurchaseRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO purchases
                (id, buyer_id, media_id, amount_cents, status, checkout_session_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(purchase.id)
        .bind(purchase.buyer_id)
        .bind(purchase.media_id)
        .bind(purchase.amount_cents)
        .bind(purchase.status.as_str())
        .bind(&purchase.checkout_session_id)
        .bind(purchase.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => BillingError::NotFound(
                format!("Media {} not found", purchase.media_id),
            ),
            other => other.into(),
        })?;
        Ok(())
    }

    async fn attach_checkout_session(
        &self,
        purchase_id: Uuid,
        session_id: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query("UPDATE purchases SET checkout_session_id = $2 WHERE id = $1")
            .bind(purchase_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Purchase {} not found",
                purchase_id
            )));
        }
        Ok(())
    }

    async fn get_purchase(&self, purchase_id: Uuid) -> BillingResult<Option<PurchaseRecord>> {
        let row: Option<PurchaseRow> = sqlx::query_as(purchase_select!("WHERE p.id = $1"))
            .bind(purchase_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn purchases_for_session(&self, session_id: &str) -> BillingResult<Vec<PurchaseRecord>> {
        let rows: Vec<PurchaseRow> = sqlx::query_as(purchase_select!(
            "WHERE p.checkout_session_id = $1 ORDER BY p.created_at"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn complete_purchase(
        &self,
        purchase_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<PurchaseTransition> {
        let mut tx = self.pool.begin().await?;
        let Some(mut purchase) = Self::lock_purchase(&mut tx, purchase_id).await? else {
            return Ok(PurchaseTransition::NotFound);
        };
        if purchase.status != PurchaseStatus::Pending {
            return Ok(PurchaseTransition::AlreadyTerminal(purchase.status));
        }

        // Serializes completions of different purchases for the same media
        let available: Option<bool> = sqlx::query_scalar(
            "SELECT NOT is_sold AND deleted_at IS NULL FROM media_assets WHERE id = $1 FOR UPDATE",
        )
        .bind(purchase.media_id)
        .fetch_optional(&mut *tx)
        .await?;

        if available != Some(true) {
            purchase.fail();
            sqlx::query(
                "UPDATE purchases SET status = 'failed' WHERE id = $1 AND status = 'pending'",
            )
            .bind(purchase.id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(PurchaseTransition::AssetUnavailable(purchase));
        }

        purchase.complete(now);
        sqlx::query(
            r#"
            UPDATE purchases
            SET status = $2, completed_at = $3, delete_after = $4
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(purchase.id)
        .bind(purchase.status.as_str())
        .bind(purchase.completed_at)
        .bind(purchase.delete_after)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE media_assets SET is_sold = TRUE WHERE id = $1 AND NOT is_sold")
            .bind(purchase.media_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PurchaseTransition::Applied(purchase))
    }

    async fn fail_purchase(&self, purchase_id: Uuid) -> BillingResult<PurchaseTransition> {
        let mut tx = self.pool.begin().await?;
        let Some(mut purchase) = Self::lock_purchase(&mut tx, purchase_id).await? else {
            return Ok(PurchaseTransition::NotFound);
        };
        if !purchase.fail() {
            return Ok(PurchaseTransition::AlreadyTerminal(purchase.status));
        }

        sqlx::query("UPDATE purchases SET status = 'failed' WHERE id = $1 AND status = 'pending'")
            .bind(purchase.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PurchaseTransition::Applied(purchase))
    }

    async fn active_sold_purchases(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PurchaseRecord>> {
        self.fetch_purchases(
            purchase_select!(
                "JOIN media_assets m ON m.id = p.media_id \
                 WHERE p.status = 'completed' AND m.is_sold \
                   AND p.asset_deleted_at IS NULL AND p.delete_after > $1 \
                 ORDER BY p.buyer_id, p.delete_after"
            ),
            now,
        )
        .await
    }

    async fn expired_sold_purchases(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PurchaseRecord>> {
        self.fetch_purchases(
            purchase_select!(
                "JOIN media_assets m ON m.id = p.media_id \
                 WHERE p.status = 'completed' AND m.is_sold \
                   AND p.asset_deleted_at IS NULL AND p.delete_after <= $1 \
                 ORDER BY p.delete_after"
            ),
            now,
        )
        .await
    }

    async fn claim_reminder(
        &self,
        purchase_id: Uuid,
        threshold_days: u8,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO purchase_reminders (purchase_id, threshold_days, sent_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (purchase_id, threshold_days) DO NOTHING
            "#,
        )
        .bind(purchase_id)
        .bind(i16::from(threshold_days))
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn mark_asset_deleted(
        &self,
        purchase_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let media_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE purchases
            SET asset_deleted_at = $2
            WHERE id = $1 AND asset_deleted_at IS NULL
            RETURNING media_id
            "#,
        )
        .bind(purchase_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((media_id,)) = media_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query("UPDATE media_assets SET is_sold = FALSE, deleted_at = $2 WHERE id = $1")
            .bind(media_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_purchases(&self) -> BillingResult<Vec<PurchaseRecord>> {
        let rows: Vec<PurchaseRow> = sqlx::query_as(purchase_select!("ORDER BY p.created_at"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_pending_upload(&self, pending: &PendingUpload) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_uploads
                (id, user_id, title, storage_key, price_cents, amount_due_cents, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(pending.id)
        .bind(pending.user_id)
        .bind(&pending.title)
        .bind(&pending.storage_key)
        .bind(pending.price_cents)
        .bind(pending.amount_due_cents)
        .bind(pending.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_pending_upload(
        &self,
        pending_upload_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<MediaAsset>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<PendingUploadRow> = sqlx::query_as(
            r#"
            DELETE FROM pending_uploads
            WHERE id = $1
            RETURNING id, user_id, title, storage_key, price_cents, amount_due_cents, created_at
            "#,
        )
        .bind(pending_upload_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(pending) = row.map(PendingUpload::from) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let media = pending.publish(now);
        sqlx::query(
            r#"
            INSERT INTO media_assets
                (id, owner_id, title, storage_key, price_cents, is_sold, published_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6)
            "#,
        )
        .bind(media.id)
        .bind(media.owner_id)
        .bind(&media.title)
        .bind(&media.storage_key)
        .bind(media.price_cents)
        .bind(media.published_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(media))
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        // Only one concurrent caller gets a row back. Failed events and
        // events stuck in processing past the timeout can be claimed again.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (event_id, event_type, payload, status, processing_started_at, created_at)
            VALUES ($1, $2, $3, 'processing', $4, $4)
            ON CONFLICT (event_id) DO UPDATE SET
                status = 'processing',
                processing_started_at = EXCLUDED.processing_started_at,
                error_message = NULL,
                finished_at = NULL
            WHERE webhook_events.status = 'error'
               OR (webhook_events.status = 'processing'
                   AND webhook_events.processing_started_at < $4 - make_interval(mins => $5))
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(now)
        .bind(EVENT_PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_event(
        &self,
        event_id: &str,
        error: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let status = if error.is_some() {
            EventStatus::Error
        } else {
            EventStatus::Success
        };
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, error_message = $3, finished_at = $4
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Webhook event {} not found",
                event_id
            )));
        }
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let row: Option<EventRow> = sqlx::query_as(event_select!("WHERE event_id = $1"))
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<EventRow> = match status {
            Some(status) => {
                sqlx::query_as(event_select!(
                    "WHERE status = $1 ORDER BY created_at DESC LIMIT $2"
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(event_select!("ORDER BY created_at DESC LIMIT $1"))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn prune_events(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            "DELETE FROM webhook_events WHERE status = 'success' AND finished_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
