//! Ledger store
//!
//! The ledger is the payment truth source: entitlements, purchases, pending
//! uploads and the webhook event log. Each mutating operation checks its
//! guard and writes inside one critical section (a row-locking transaction
//! in Postgres, a mutex in memory), so concurrent webhook deliveries and
//! overlapping sweeps cannot double-apply a transition.

mod memory;
mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::{DowngradeOutcome, MembershipChange, MembershipGrant, UserEntitlement};
use crate::error::BillingResult;
use crate::purchases::{MediaAsset, PendingUpload, PurchaseRecord, PurchaseTransition};
use crate::quota::QuotaEvaluation;
use crate::webhooks::{EventStatus, WebhookEventRecord};

/// Minutes after which an event stuck in `processing` may be claimed again
pub const EVENT_PROCESSING_TIMEOUT_MINUTES: i64 = 30;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ---- Entitlements -------------------------------------------------

    async fn get_entitlement(&self, user_id: Uuid) -> BillingResult<Option<UserEntitlement>>;

    /// Fetch the record, creating a VIEWER entitlement when absent
    async fn ensure_entitlement(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<UserEntitlement>;

    /// Upsert tier, expiry and refs from a grant
    async fn apply_membership(
        &self,
        grant: &MembershipGrant,
        now: OffsetDateTime,
    ) -> BillingResult<MembershipChange>;

    /// Drop to VIEWER. `subscription_ref` restricts the downgrade to that
    /// subscription when given.
    async fn downgrade_to_viewer(
        &self,
        user_id: Uuid,
        subscription_ref: Option<&str>,
        observed_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<DowngradeOutcome>;

    async fn find_user_by_subscription_ref(&self, subscription_ref: &str)
        -> BillingResult<Option<Uuid>>;

    async fn find_user_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Uuid>>;

    /// Re-evaluate the quota under the entitlement lock and apply the FREE
    /// or PAID_CREDIT side effect. PAID_CHARGE and BLOCKED are returned
    /// without mutation.
    async fn commit_upload(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaEvaluation>;

    /// Add one-time credits. Idempotent per `grant_ref`; returns whether
    /// the credits were newly granted.
    async fn grant_upload_credits(
        &self,
        user_id: Uuid,
        grant_ref: &str,
        credits: u32,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Email address to notify, from the external user directory
    async fn contact_email(&self, user_id: Uuid) -> BillingResult<Option<String>>;

    async fn list_entitlements(&self) -> BillingResult<Vec<UserEntitlement>>;

    // ---- Media --------------------------------------------------------

    async fn insert_media(&self, media: &MediaAsset) -> BillingResult<()>;

    async fn get_media(&self, media_id: Uuid) -> BillingResult<Option<MediaAsset>>;

    // ---- Purchases ----------------------------------------------------

    /// Insert a PENDING purchase
    async fn insert_purchase(&self, purchase: &PurchaseRecord) -> BillingResult<()>;

    async fn attach_checkout_session(&self, purchase_id: Uuid, session_id: &str)
        -> BillingResult<()>;

    async fn get_purchase(&self, purchase_id: Uuid) -> BillingResult<Option<PurchaseRecord>>;

    async fn purchases_for_session(&self, session_id: &str) -> BillingResult<Vec<PurchaseRecord>>;

    /// PENDING → COMPLETED and mark the media sold, in one step. When the
    /// media is already sold or deleted the purchase goes PENDING → FAILED
    /// and `AssetUnavailable` is returned.
    async fn complete_purchase(
        &self,
        purchase_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<PurchaseTransition>;

    /// PENDING → FAILED
    async fn fail_purchase(&self, purchase_id: Uuid) -> BillingResult<PurchaseTransition>;

    /// Completed purchases whose asset is still sold and not yet due
    async fn active_sold_purchases(&self, now: OffsetDateTime)
        -> BillingResult<Vec<PurchaseRecord>>;

    /// Completed purchases whose asset is still sold and past `delete_after`
    async fn expired_sold_purchases(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PurchaseRecord>>;

    /// Record a reminder threshold for a purchase if not already present.
    /// Returns whether this call claimed it.
    async fn claim_reminder(
        &self,
        purchase_id: Uuid,
        threshold_days: u8,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Flip the media's sold flag off and stamp the purchase as deleted.
    /// Returns false when already done.
    async fn mark_asset_deleted(&self, purchase_id: Uuid, now: OffsetDateTime)
        -> BillingResult<bool>;

    async fn list_purchases(&self) -> BillingResult<Vec<PurchaseRecord>>;

    // ---- Pending uploads ----------------------------------------------

    async fn insert_pending_upload(&self, pending: &PendingUpload) -> BillingResult<()>;

    /// Delete the pending record and publish its media in one step.
    /// `None` when it was already consumed.
    async fn consume_pending_upload(
        &self,
        pending_upload_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<MediaAsset>>;

    // ---- Webhook event ledger -----------------------------------------

    /// Claim exclusive processing rights for an event. False when it already
    /// succeeded or is being processed within the timeout window.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Record the processing result; `error` is `None` on success
    async fn finish_event(
        &self,
        event_id: &str,
        error: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    /// Newest first
    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Delete successful events finished before `older_than`
    async fn prune_events(&self, older_than: OffsetDateTime) -> BillingResult<u64>;
}
