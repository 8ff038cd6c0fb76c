//! Recording fakes for the external collaborators
//!
//! Enabled for this crate's tests and, through the `testing` feature, for
//! dependents' tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use mediamart_shared::MembershipTier;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::assets::{AssetStore, AssetStoreError};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutRequest, CheckoutSessionInfo, PaymentGateway};
use crate::notifications::{NotificationDispatcher, NotificationKind, Recipient};
use crate::purchases::MediaAsset;

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub user_id: Uuid,
    pub email: String,
    pub kind: NotificationKind,
    pub data: Value,
}

/// Dispatcher that records every accepted notification
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<SentNotification>>,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send report failure
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }

    pub async fn count(&self, kind: NotificationKind) -> usize {
        self.sent.lock().await.iter().filter(|n| n.kind == kind).count()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send(&self, recipient: &Recipient, kind: NotificationKind, data: &Value) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().await.push(SentNotification {
            user_id: recipient.user_id,
            email: recipient.email.clone(),
            kind,
            data: data.clone(),
        });
        true
    }
}

/// Asset store that remembers deletions and can simulate outages
#[derive(Default)]
pub struct RecordingAssetStore {
    calls: Mutex<Vec<Uuid>>,
    gone: Mutex<HashSet<Uuid>>,
    failures_remaining: AtomicUsize,
}

impl RecordingAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` delete calls
    pub async fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Pretend the object was removed out of band
    pub async fn mark_gone(&self, media_id: Uuid) {
        self.gone.lock().await.insert(media_id);
    }

    /// Media ids passed to `delete`, in call order
    pub async fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl AssetStore for RecordingAssetStore {
    async fn delete(&self, media: &MediaAsset) -> Result<(), AssetStoreError> {
        self.calls.lock().await.push(media.id);

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AssetStoreError::Failed("simulated outage".to_string()));
        }

        if self.gone.lock().await.insert(media.id) {
            Ok(())
        } else {
            Err(AssetStoreError::AlreadyGone)
        }
    }
}

/// Gateway that records requests and hands out sequential session ids
#[derive(Default)]
pub struct FakeGateway {
    checkouts: Mutex<Vec<CheckoutRequest>>,
    cancelled: Mutex<Vec<String>>,
    price_changes: Mutex<Vec<(String, String, MembershipTier)>>,
    failing: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn checkouts(&self) -> Vec<CheckoutRequest> {
        self.checkouts.lock().await.clone()
    }

    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }

    pub async fn price_changes(&self) -> Vec<(String, String, MembershipTier)> {
        self.price_changes.lock().await.clone()
    }

    fn check(&self) -> BillingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BillingError::Gateway("simulated gateway outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout(&self, request: CheckoutRequest) -> BillingResult<CheckoutSessionInfo> {
        self.check()?;
        let mut checkouts = self.checkouts.lock().await;
        checkouts.push(request);
        let session_id = format!("cs_test_{}", checkouts.len());
        Ok(CheckoutSessionInfo {
            url: Some(format!("https://checkout.test/{}", session_id)),
            session_id,
        })
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()> {
        self.check()?;
        self.cancelled.lock().await.push(subscription_ref.to_string());
        Ok(())
    }

    async fn change_subscription_price(
        &self,
        subscription_ref: &str,
        price_id: &str,
        tier: MembershipTier,
    ) -> BillingResult<()> {
        self.check()?;
        self.price_changes.lock().await.push((
            subscription_ref.to_string(),
            price_id.to_string(),
            tier,
        ));
        Ok(())
    }
}
