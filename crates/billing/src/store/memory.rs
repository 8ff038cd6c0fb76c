//! In-memory ledger backend for tests and local runs

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use mediamart_shared::PurchaseStatus;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerStore, EVENT_PROCESSING_TIMEOUT_MINUTES};
use crate::entitlement::{DowngradeOutcome, MembershipChange, MembershipGrant, UserEntitlement};
use crate::error::{BillingError, BillingResult};
use crate::purchases::{MediaAsset, PendingUpload, PurchaseRecord, PurchaseTransition};
use crate::quota::{self, QuotaEvaluation};
use crate::webhooks::{EventStatus, WebhookEventRecord};

#[derive(Default)]
struct LedgerState {
    entitlements: HashMap<Uuid, UserEntitlement>,
    contacts: HashMap<Uuid, String>,
    credit_grants: HashSet<String>,
    media: HashMap<Uuid, MediaAsset>,
    purchases: HashMap<Uuid, PurchaseRecord>,
    pending_uploads: HashMap<Uuid, PendingUpload>,
    events: HashMap<String, WebhookEventRecord>,
}

impl LedgerState {
    fn entitlement_mut(&mut self, user_id: Uuid, now: OffsetDateTime) -> &mut UserEntitlement {
        self.entitlements
            .entry(user_id)
            .or_insert_with(|| UserEntitlement::new_viewer(user_id, now))
    }

    fn media_is_sold(&self, media_id: Uuid) -> bool {
        self.media.get(&media_id).is_some_and(|m| m.is_sold)
    }

    fn sold_completed(&self) -> impl Iterator<Item = &PurchaseRecord> {
        self.purchases.values().filter(|p| {
            p.status == PurchaseStatus::Completed
                && p.asset_deleted_at.is_none()
                && self.media_is_sold(p.media_id)
        })
    }
}

/// Ledger held in process memory behind a single async mutex
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<LedgerState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the email used to notify a user
    pub async fn register_contact(&self, user_id: Uuid, email: impl Into<String>) {
        self.state.lock().await.contacts.insert(user_id, email.into());
    }

    /// Replace an entitlement record wholesale
    pub async fn put_entitlement(&self, entitlement: UserEntitlement) {
        self.state
            .lock()
            .await
            .entitlements
            .insert(entitlement.user_id, entitlement);
    }

    /// Replace a purchase record wholesale
    pub async fn put_purchase(&self, purchase: PurchaseRecord) {
        self.state
            .lock()
            .await
            .purchases
            .insert(purchase.id, purchase);
    }

    pub async fn pending_upload_count(&self) -> usize {
        self.state.lock().await.pending_uploads.len()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_entitlement(&self, user_id: Uuid) -> BillingResult<Option<UserEntitlement>> {
        Ok(self.state.lock().await.entitlements.get(&user_id).cloned())
    }

    async fn ensure_entitlement(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<UserEntitlement> {
        let mut state = self.state.lock().await;
        Ok(state.entitlement_mut(user_id, now).clone())
    }

    async fn apply_membership(
        &self,
        grant: &MembershipGrant,
        now: OffsetDateTime,
    ) -> BillingResult<MembershipChange> {
        let mut state = self.state.lock().await;
        let entitlement = state.entitlement_mut(grant.user_id, now);
        Ok(entitlement.apply_membership(grant, now))
    }

    async fn downgrade_to_viewer(
        &self,
        user_id: Uuid,
        subscription_ref: Option<&str>,
        observed_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<DowngradeOutcome> {
        let mut state = self.state.lock().await;
        let entitlement = state.entitlement_mut(user_id, now);
        Ok(entitlement.downgrade_to_viewer(subscription_ref, observed_at, now))
    }

    async fn find_user_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .entitlements
            .values()
            .find(|e| e.payment_subscription_ref.as_deref() == Some(subscription_ref))
            .map(|e| e.user_id))
    }

    async fn find_user_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .entitlements
            .values()
            .find(|e| e.payment_customer_ref.as_deref() == Some(customer_ref))
            .map(|e| e.user_id))
    }

    async fn commit_upload(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaEvaluation> {
        let mut state = self.state.lock().await;
        let entitlement = state.entitlement_mut(user_id, now);
        entitlement.roll_quota_period(now);
        let evaluation = quota::evaluate(entitlement, now);
        entitlement.record_upload(evaluation.cost_type, now);
        Ok(evaluation)
    }

    async fn grant_upload_credits(
        &self,
        user_id: Uuid,
        grant_ref: &str,
        credits: u32,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if !state.credit_grants.insert(grant_ref.to_string()) {
            return Ok(false);
        }
        state.entitlement_mut(user_id, now).add_credits(credits, now);
        Ok(true)
    }

    async fn contact_email(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.state.lock().await.contacts.get(&user_id).cloned())
    }

    async fn list_entitlements(&self) -> BillingResult<Vec<UserEntitlement>> {
        Ok(self
            .state
            .lock()
            .await
            .entitlements
            .values()
            .cloned()
            .collect())
    }

    async fn insert_media(&self, media: &MediaAsset) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .media
            .insert(media.id, media.clone());
        Ok(())
    }

    async fn get_media(&self, media_id: Uuid) -> BillingResult<Option<MediaAsset>> {
        Ok(self.state.lock().await.media.get(&media_id).cloned())
    }

    async fn insert_purchase(&self, purchase: &PurchaseRecord) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if !state.media.contains_key(&purchase.media_id) {
            return Err(BillingError::NotFound(format!(
                "Media {} not found",
                purchase.media_id
            )));
        }
        state.purchases.insert(purchase.id, purchase.clone());
        Ok(())
    }

    async fn attach_checkout_session(
        &self,
        purchase_id: Uuid,
        session_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let purchase = state
            .purchases
            .get_mut(&purchase_id)
            .ok_or_else(|| BillingError::NotFound(format!("Purchase {} not found", purchase_id)))?;
        purchase.checkout_session_id = Some(session_id.to_string());
        Ok(())
    }

    async fn get_purchase(&self, purchase_id: Uuid) -> BillingResult<Option<PurchaseRecord>> {
        Ok(self.state.lock().await.purchases.get(&purchase_id).cloned())
    }

    async fn purchases_for_session(&self, session_id: &str) -> BillingResult<Vec<PurchaseRecord>> {
        let state = self.state.lock().await;
        let mut purchases: Vec<PurchaseRecord> = state
            .purchases
            .values()
            .filter(|p| p.checkout_session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        purchases.sort_by_key(|p| p.created_at);
        Ok(purchases)
    }

    async fn complete_purchase(
        &self,
        purchase_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<PurchaseTransition> {
        let mut state = self.state.lock().await;
        let LedgerState {
            purchases, media, ..
        } = &mut *state;
        let Some(purchase) = purchases.get_mut(&purchase_id) else {
            return Ok(PurchaseTransition::NotFound);
        };
        if purchase.status != PurchaseStatus::Pending {
            return Ok(PurchaseTransition::AlreadyTerminal(purchase.status));
        }

        match media.get_mut(&purchase.media_id) {
            Some(asset) if !asset.is_sold && asset.deleted_at.is_none() => {
                purchase.complete(now);
                asset.is_sold = true;
                Ok(PurchaseTransition::Applied(purchase.clone()))
            }
            _ => {
                purchase.fail();
                Ok(PurchaseTransition::AssetUnavailable(purchase.clone()))
            }
        }
    }

    async fn fail_purchase(&self, purchase_id: Uuid) -> BillingResult<PurchaseTransition> {
        let mut state = self.state.lock().await;
        let Some(purchase) = state.purchases.get_mut(&purchase_id) else {
            return Ok(PurchaseTransition::NotFound);
        };
        if !purchase.fail() {
            return Ok(PurchaseTransition::AlreadyTerminal(purchase.status));
        }
        Ok(PurchaseTransition::Applied(purchase.clone()))
    }

    async fn active_sold_purchases(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PurchaseRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .sold_completed()
            .filter(|p| p.delete_after.is_some_and(|d| d > now))
            .cloned()
            .collect())
    }

    async fn expired_sold_purchases(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PurchaseRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .sold_completed()
            .filter(|p| p.is_expired(now))
            .cloned()
            .collect())
    }

    async fn claim_reminder(
        &self,
        purchase_id: Uuid,
        threshold_days: u8,
        _now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let purchase = state
            .purchases
            .get_mut(&purchase_id)
            .ok_or_else(|| BillingError::NotFound(format!("Purchase {} not found", purchase_id)))?;
        Ok(purchase.reminders_sent.insert(threshold_days))
    }

    async fn mark_asset_deleted(
        &self,
        purchase_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(purchase) = state.purchases.get_mut(&purchase_id) else {
            return Ok(false);
        };
        if purchase.asset_deleted_at.is_some() {
            return Ok(false);
        }
        purchase.asset_deleted_at = Some(now);
        let media_id = purchase.media_id;
        if let Some(media) = state.media.get_mut(&media_id) {
            media.is_sold = false;
            media.deleted_at = Some(now);
        }
        Ok(true)
    }

    async fn list_purchases(&self) -> BillingResult<Vec<PurchaseRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .purchases
            .values()
            .cloned()
            .collect())
    }

    async fn insert_pending_upload(&self, pending: &PendingUpload) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .pending_uploads
            .insert(pending.id, pending.clone());
        Ok(())
    }

    async fn consume_pending_upload(
        &self,
        pending_upload_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<MediaAsset>> {
        let mut state = self.state.lock().await;
        let Some(pending) = state.pending_uploads.remove(&pending_upload_id) else {
            return Ok(None);
        };
        let media = pending.publish(now);
        state.media.insert(media.id, media.clone());
        Ok(Some(media))
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let timeout = Duration::minutes(EVENT_PROCESSING_TIMEOUT_MINUTES);

        match state.events.get_mut(event_id) {
            None => {
                state.events.insert(
                    event_id.to_string(),
                    WebhookEventRecord {
                        event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        payload: payload.to_string(),
                        status: EventStatus::Processing,
                        error_message: None,
                        processing_started_at: now,
                        finished_at: None,
                        created_at: now,
                    },
                );
                Ok(true)
            }
            Some(record) => {
                let reclaimable = match record.status {
                    EventStatus::Success => false,
                    EventStatus::Error => true,
                    EventStatus::Processing => record.processing_started_at < now - timeout,
                };
                if reclaimable {
                    record.status = EventStatus::Processing;
                    record.processing_started_at = now;
                    record.error_message = None;
                    record.finished_at = None;
                }
                Ok(reclaimable)
            }
        }
    }

    async fn finish_event(
        &self,
        event_id: &str,
        error: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .events
            .get_mut(event_id)
            .ok_or_else(|| BillingError::NotFound(format!("Webhook event {} not found", event_id)))?;
        record.status = if error.is_some() {
            EventStatus::Error
        } else {
            EventStatus::Success
        };
        record.error_message = error.map(str::to_string);
        record.finished_at = Some(now);
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self.state.lock().await.events.get(event_id).cloned())
    }

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let state = self.state.lock().await;
        let mut events: Vec<WebhookEventRecord> = state
            .events
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(events)
    }

    async fn prune_events(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.events.len();
        state.events.retain(|_, e| {
            !(e.status == EventStatus::Success && e.finished_at.is_some_and(|f| f < older_than))
        });
        Ok((before - state.events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediamart_shared::{CostType, MembershipTier};
    use time::macros::datetime;

    fn now() -> OffsetDateTime {
        datetime!(2025-03-01 12:00 UTC)
    }

    fn media(owner_id: Uuid) -> MediaAsset {
        MediaAsset {
            id: Uuid::new_v4(),
            owner_id,
            title: "Harbor at dusk".into(),
            storage_key: "media/harbor.jpg".into(),
            price_cents: 400,
            is_sold: false,
            published_at: now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_commit_upload_consumes_free_then_credit() {
        let store = InMemoryLedgerStore::new();
        let user_id = Uuid::new_v4();
        let mut e = UserEntitlement::new_viewer(user_id, now());
        e.membership_tier = MembershipTier::Basic;
        e.free_uploads_used = 4;
        e.paid_upload_credits = 1;
        store.put_entitlement(e).await;

        let first = store.commit_upload(user_id, now()).await.unwrap();
        assert_eq!(first.cost_type, CostType::Free);
        let second = store.commit_upload(user_id, now()).await.unwrap();
        assert_eq!(second.cost_type, CostType::PaidCredit);
        let third = store.commit_upload(user_id, now()).await.unwrap();
        assert_eq!(third.cost_type, CostType::PaidCharge);

        let e = store.get_entitlement(user_id).await.unwrap().unwrap();
        assert_eq!(e.free_uploads_used, 5);
        assert_eq!(e.paid_upload_credits, 0);
    }

    #[tokio::test]
    async fn test_credit_grant_idempotent_per_ref() {
        let store = InMemoryLedgerStore::new();
        let user_id = Uuid::new_v4();

        assert!(store.grant_upload_credits(user_id, "cs_1", 5, now()).await.unwrap());
        assert!(!store.grant_upload_credits(user_id, "cs_1", 5, now()).await.unwrap());
        assert!(store.grant_upload_credits(user_id, "cs_2", 2, now()).await.unwrap());

        let e = store.get_entitlement(user_id).await.unwrap().unwrap();
        assert_eq!(e.paid_upload_credits, 7);
    }

    #[tokio::test]
    async fn test_complete_purchase_marks_media_sold_once() {
        let store = InMemoryLedgerStore::new();
        let m = media(Uuid::new_v4());
        store.insert_media(&m).await.unwrap();
        let p = PurchaseRecord::new_pending(Uuid::new_v4(), m.id, 400, now());
        store.insert_purchase(&p).await.unwrap();

        let first = store.complete_purchase(p.id, now()).await.unwrap();
        assert!(matches!(first, PurchaseTransition::Applied(_)));
        assert!(store.get_media(m.id).await.unwrap().unwrap().is_sold);

        let second = store
            .complete_purchase(p.id, now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(
            second,
            PurchaseTransition::AlreadyTerminal(PurchaseStatus::Completed)
        );
        let stored = store.get_purchase(p.id).await.unwrap().unwrap();
        assert_eq!(stored.completed_at, Some(now()));
    }

    #[tokio::test]
    async fn test_insert_purchase_requires_media() {
        let store = InMemoryLedgerStore::new();
        let p = PurchaseRecord::new_pending(Uuid::new_v4(), Uuid::new_v4(), 400, now());
        assert!(matches!(
            store.insert_purchase(&p).await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_consume_pending_upload_once() {
        let store = InMemoryLedgerStore::new();
        let pending = PendingUpload {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            title: "Field notes".into(),
            storage_key: "media/field.mp4".into(),
            price_cents: 900,
            amount_due_cents: 100,
            created_at: now(),
        };
        store.insert_pending_upload(&pending).await.unwrap();

        let published = store.consume_pending_upload(pending.id, now()).await.unwrap();
        assert_eq!(published.map(|m| m.id), Some(pending.id));
        assert!(store
            .consume_pending_upload(pending.id, now())
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.pending_upload_count().await, 0);
    }

    #[tokio::test]
    async fn test_event_claim_lifecycle() {
        let store = InMemoryLedgerStore::new();

        assert!(store.claim_event("evt_1", "x", "{}", now()).await.unwrap());
        // In flight
        assert!(!store.claim_event("evt_1", "x", "{}", now()).await.unwrap());
        // Stuck past the timeout
        let later = now() + Duration::minutes(31);
        assert!(store.claim_event("evt_1", "x", "{}", later).await.unwrap());

        store.finish_event("evt_1", Some("boom"), later).await.unwrap();
        assert!(store.claim_event("evt_1", "x", "{}", later).await.unwrap());

        store.finish_event("evt_1", None, later).await.unwrap();
        assert!(!store.claim_event("evt_1", "x", "{}", later).await.unwrap());

        let pruned = store
            .prune_events(later + Duration::days(31))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn test_mark_asset_deleted_flips_sold_once() {
        let store = InMemoryLedgerStore::new();
        let m = media(Uuid::new_v4());
        store.insert_media(&m).await.unwrap();
        let p = PurchaseRecord::new_pending(Uuid::new_v4(), m.id, 400, now());
        store.insert_purchase(&p).await.unwrap();
        store.complete_purchase(p.id, now()).await.unwrap();

        let due = now() + Duration::days(10);
        assert_eq!(store.expired_sold_purchases(due).await.unwrap().len(), 1);
        assert!(store.mark_asset_deleted(p.id, due).await.unwrap());
        assert!(!store.mark_asset_deleted(p.id, due).await.unwrap());
        assert!(!store.get_media(m.id).await.unwrap().unwrap().is_sold);
        assert!(store.expired_sold_purchases(due).await.unwrap().is_empty());
    }
}
