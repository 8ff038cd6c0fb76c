//! Payment webhook reconciliation
//!
//! Verified gateway events are claimed in the `webhook_events` ledger,
//! processed against the Ledger Store and recorded with their result.
//! Every state change is guarded at the entity level (purchase status,
//! pending upload presence, credit grant ref, membership sync time), so a
//! redelivered or replayed event never applies twice even if the event
//! claim is bypassed.

use std::sync::Arc;

use mediamart_shared::MembershipTier;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::{DowngradeOutcome, MembershipChange, MembershipGrant};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    metadata_keys, CheckoutSessionObject, CheckoutType, EventKind, GatewayEvent,
    SubscriptionObject, SubscriptionState,
};
use crate::gateway::PriceIds;
use crate::notifications::{NotificationKind, Notifier};
use crate::purchases::{PurchaseRecord, PurchaseTransition};
use crate::signature::verify_signature;
use crate::store::LedgerStore;

/// Processing state of a stored webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Processing,
    Success,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid webhook event status: {}", s)),
        }
    }
}

/// Stored webhook event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    /// Raw verified body, kept for replay
    #[serde(skip_serializing)]
    pub payload: String,
    pub status: EventStatus,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub processing_started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Acknowledged result of handling one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// At least one ledger mutation was made
    Applied,
    /// Every referenced record was already in the target state
    StaleReplay,
    /// Nothing to do for this event
    Ignored,
    /// The event id already succeeded or is in flight elsewhere
    Duplicate,
    /// Referenced data is missing or malformed; acknowledged so the gateway
    /// stops retrying, flagged for reconciliation
    Anomaly(String),
}

/// Result of replaying a stored event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub event_id: String,
    pub event_type: String,
    pub previous_status: EventStatus,
    pub previous_error: Option<String>,
    pub new_status: EventStatus,
    pub new_error: Option<String>,
    pub outcome: Option<WebhookOutcome>,
    pub success: bool,
}

/// Tally of a fan-out over several purchases
#[derive(Default)]
struct FanOut {
    applied: usize,
    replays: usize,
    missing: usize,
    /// Paid purchases whose media was already sold
    unavailable: usize,
    retryable: Option<BillingError>,
}

impl FanOut {
    fn record_error(&mut self, err: BillingError) {
        if err.is_retryable() && self.retryable.is_none() {
            self.retryable = Some(err);
        }
    }

    fn into_outcome(self, session_id: &str) -> BillingResult<WebhookOutcome> {
        if let Some(err) = self.retryable {
            return Err(err);
        }
        if self.unavailable > 0 {
            Ok(WebhookOutcome::Anomaly(format!(
                "{} purchase(s) for session {} paid for media that was no longer available; refund required",
                self.unavailable, session_id
            )))
        } else if self.applied > 0 {
            Ok(WebhookOutcome::Applied)
        } else if self.replays > 0 {
            Ok(WebhookOutcome::StaleReplay)
        } else if self.missing > 0 {
            Ok(WebhookOutcome::Anomaly(format!(
                "purchases for session {} not found",
                session_id
            )))
        } else {
            Ok(WebhookOutcome::Ignored)
        }
    }
}

fn anomaly(event: &GatewayEvent, detail: String) -> WebhookOutcome {
    tracing::error!(
        event_id = %event.id,
        event_type = %event.event_type,
        detail = %detail,
        "RECONCILIATION NEEDED: webhook references missing or malformed data"
    );
    WebhookOutcome::Anomaly(detail)
}

/// Webhook Reconciler
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn LedgerStore>,
    notifier: Notifier,
    webhook_secret: String,
    prices: PriceIds,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        notifier: Notifier,
        webhook_secret: impl Into<String>,
        prices: PriceIds,
    ) -> Self {
        Self {
            store,
            notifier,
            webhook_secret: webhook_secret.into(),
            prices,
        }
    }

    /// Verify, claim and process a raw webhook delivery
    pub async fn handle(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        self.handle_at(payload, signature, OffsetDateTime::now_utc())
            .await
    }

    /// [`handle`](Self::handle) with an explicit clock
    pub async fn handle_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        verify_signature(payload, signature, &self.webhook_secret, now)?;

        let event: GatewayEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "RECONCILIATION NEEDED: signed webhook body is not a valid event"
                );
                return Ok(WebhookOutcome::Anomaly(format!("malformed event: {}", e)));
            }
        };

        let raw = String::from_utf8_lossy(payload);
        let claimed = self
            .store
            .claim_event(&event.id, &event.event_type, &raw, now)
            .await?;

        if !claimed {
            let status = self
                .store
                .get_event(&event.id)
                .await
                .ok()
                .flatten()
                .map(|e| e.status);
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                status = ?status,
                "Duplicate webhook event; already processed or in flight"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.process_event(&event, now).await;
        self.record_result(&event.id, &result, now).await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => Ok(anomaly(&event, e.to_string())),
        }
    }

    async fn record_result(
        &self,
        event_id: &str,
        result: &BillingResult<WebhookOutcome>,
        now: OffsetDateTime,
    ) {
        let error_message = match result {
            Ok(WebhookOutcome::Anomaly(detail)) => Some(detail.clone()),
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };

        // Retry once; a lost result leaves the event stuck in processing
        // until the claim timeout
        if let Err(e) = self
            .store
            .finish_event(event_id, error_message.as_deref(), now)
            .await
        {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to record webhook result failed, retrying"
            );
            if let Err(retry_err) = self
                .store
                .finish_event(event_id, error_message.as_deref(), now)
                .await
            {
                tracing::error!(
                    event_id = %event_id,
                    first_error = %e,
                    retry_error = %retry_err,
                    "CRITICAL: Failed to record webhook result after retry"
                );
            }
        }
    }

    /// Apply one verified event to the ledger
    pub async fn process_event(
        &self,
        event: &GatewayEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        match event.kind() {
            kind @ (EventKind::CheckoutCompleted | EventKind::CheckoutAsyncPaymentSucceeded) => {
                let session = event.checkout_session()?;
                if kind == EventKind::CheckoutCompleted && session.is_awaiting_payment() {
                    tracing::info!(
                        event_id = %event.id,
                        session_id = %session.id,
                        "Checkout completed with payment pending; waiting for async confirmation"
                    );
                    return Ok(WebhookOutcome::Ignored);
                }
                self.handle_checkout_completed(event, &session, now).await
            }
            EventKind::CheckoutExpired | EventKind::CheckoutAsyncPaymentFailed => {
                let session = event.checkout_session()?;
                self.handle_checkout_failed(&session).await
            }
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                let subscription = event.subscription()?;
                self.handle_subscription_upsert(event, &subscription, now)
                    .await
            }
            EventKind::SubscriptionDeleted => {
                let subscription = event.subscription()?;
                self.handle_subscription_ended(event, &subscription, now)
                    .await
            }
            EventKind::Other(event_type) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event_type,
                    "Unhandled webhook event type; acknowledged"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        event: &GatewayEvent,
        session: &CheckoutSessionObject,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        match session.checkout_type() {
            Some(CheckoutType::Subscription) => {
                self.activate_from_checkout(event, session, now).await
            }
            Some(CheckoutType::MediaPurchase) => self.complete_purchases(session, now).await,
            Some(CheckoutType::UploadFee) => self.publish_pending_upload(event, session, now).await,
            Some(CheckoutType::UploadCredits) => self.grant_credits(event, session, now).await,
            None => {
                tracing::warn!(
                    event_id = %event.id,
                    session_id = %session.id,
                    checkout_type = ?session.metadata.get(metadata_keys::CHECKOUT_TYPE),
                    "Checkout session without a known checkout type; ignoring"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn activate_from_checkout(
        &self,
        event: &GatewayEvent,
        session: &CheckoutSessionObject,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let user_id = match session.metadata_uuid(metadata_keys::USER_ID) {
            Some(id) => Some(id),
            None => match session.customer_ref() {
                Some(customer) => self.store.find_user_by_customer_ref(&customer).await?,
                None => None,
            },
        };
        let Some(user_id) = user_id else {
            return Ok(anomaly(
                event,
                format!("no user for subscription checkout {}", session.id),
            ));
        };

        let tier = session
            .metadata
            .get(metadata_keys::TIER)
            .and_then(|t| t.parse::<MembershipTier>().ok())
            .filter(MembershipTier::is_paid);
        let Some(tier) = tier else {
            return Ok(anomaly(
                event,
                format!("no paid tier on subscription checkout {}", session.id),
            ));
        };

        // Expiry is provisional until a subscription event carries the
        // real period end
        let grant = MembershipGrant {
            user_id,
            tier,
            period_end: None,
            customer_ref: session.customer_ref(),
            subscription_ref: session.subscription_ref(),
            observed_at: event.created_at(),
        };

        self.apply_grant(event, grant, now).await
    }

    async fn apply_grant(
        &self,
        event: &GatewayEvent,
        grant: MembershipGrant,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let change = self.store.apply_membership(&grant, now).await?;

        tracing::info!(
            event_id = %event.id,
            user_id = %grant.user_id,
            tier = %grant.tier,
            change = ?change,
            "Applied membership grant"
        );

        if change.is_activation() {
            self.notifier
                .dispatch(
                    grant.user_id,
                    NotificationKind::MembershipActivated,
                    json!({ "tier": grant.tier.as_str() }),
                )
                .await;
        }

        Ok(match change {
            MembershipChange::Stale | MembershipChange::Unchanged => WebhookOutcome::StaleReplay,
            _ => WebhookOutcome::Applied,
        })
    }

    /// Purchases tied to a session, falling back to the metadata purchase id
    async fn session_purchases(
        &self,
        session: &CheckoutSessionObject,
    ) -> BillingResult<Vec<PurchaseRecord>> {
        let purchases = self.store.purchases_for_session(&session.id).await?;
        if !purchases.is_empty() {
            return Ok(purchases);
        }
        match session.metadata_uuid(metadata_keys::PURCHASE_ID) {
            Some(purchase_id) => Ok(self.store.get_purchase(purchase_id).await?.into_iter().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn complete_purchases(
        &self,
        session: &CheckoutSessionObject,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let purchases = self.session_purchases(session).await?;
        let mut tally = FanOut::default();
        if purchases.is_empty() {
            tally.missing += 1;
        }

        for purchase in purchases {
            match self.store.complete_purchase(purchase.id, now).await {
                Ok(PurchaseTransition::Applied(completed)) => {
                    tally.applied += 1;
                    tracing::info!(
                        purchase_id = %completed.id,
                        buyer_id = %completed.buyer_id,
                        media_id = %completed.media_id,
                        "Purchase completed"
                    );
                    self.notify_purchase(&completed).await;
                }
                Ok(PurchaseTransition::AlreadyTerminal(status)) => {
                    tally.replays += 1;
                    tracing::info!(
                        purchase_id = %purchase.id,
                        status = %status,
                        "Purchase already terminal; replay ignored"
                    );
                }
                Ok(PurchaseTransition::AssetUnavailable(failed)) => {
                    tally.unavailable += 1;
                    tracing::error!(
                        purchase_id = %failed.id,
                        buyer_id = %failed.buyer_id,
                        media_id = %failed.media_id,
                        amount_cents = failed.amount_cents,
                        session_id = %session.id,
                        "RECONCILIATION NEEDED: media already sold; purchase failed, refund required"
                    );
                }
                Ok(PurchaseTransition::NotFound) => {
                    tally.missing += 1;
                    tracing::error!(
                        purchase_id = %purchase.id,
                        session_id = %session.id,
                        "RECONCILIATION NEEDED: purchase vanished during completion"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        purchase_id = %purchase.id,
                        session_id = %session.id,
                        error = %e,
                        "Failed to complete purchase"
                    );
                    tally.record_error(e);
                }
            }
        }

        tally.into_outcome(&session.id)
    }

    async fn notify_purchase(&self, purchase: &PurchaseRecord) {
        let media = match self.store.get_media(purchase.media_id).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(
                    purchase_id = %purchase.id,
                    error = %e,
                    "Could not load media for purchase notification"
                );
                None
            }
        };
        let title = media.as_ref().map(|m| m.title.clone()).unwrap_or_default();

        self.notifier
            .dispatch(
                purchase.buyer_id,
                NotificationKind::PurchaseCompleted,
                json!({
                    "purchase_id": purchase.id,
                    "media_id": purchase.media_id,
                    "title": title,
                    "delete_after": purchase.delete_after.map(|d| d.unix_timestamp()),
                }),
            )
            .await;

        if let Some(media) = media {
            self.notifier
                .dispatch(
                    media.owner_id,
                    NotificationKind::MediaSold,
                    json!({
                        "media_id": media.id,
                        "title": media.title,
                        "amount_cents": purchase.amount_cents,
                    }),
                )
                .await;
        }
    }

    async fn handle_checkout_failed(
        &self,
        session: &CheckoutSessionObject,
    ) -> BillingResult<WebhookOutcome> {
        let purchases = self.session_purchases(session).await?;
        if purchases.is_empty() {
            // Subscription and upload sessions expire too
            return Ok(WebhookOutcome::Ignored);
        }

        let mut tally = FanOut::default();
        for purchase in purchases {
            match self.store.fail_purchase(purchase.id).await {
                Ok(PurchaseTransition::Applied(_)) => {
                    tally.applied += 1;
                    tracing::info!(purchase_id = %purchase.id, "Purchase failed");
                }
                Ok(PurchaseTransition::AlreadyTerminal(_))
                | Ok(PurchaseTransition::AssetUnavailable(_)) => tally.replays += 1,
                Ok(PurchaseTransition::NotFound) => tally.missing += 1,
                Err(e) => {
                    tracing::error!(
                        purchase_id = %purchase.id,
                        error = %e,
                        "Failed to mark purchase failed"
                    );
                    tally.record_error(e);
                }
            }
        }

        tally.into_outcome(&session.id)
    }

    async fn publish_pending_upload(
        &self,
        event: &GatewayEvent,
        session: &CheckoutSessionObject,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(pending_id) = session.metadata_uuid(metadata_keys::PENDING_UPLOAD_ID) else {
            return Ok(anomaly(
                event,
                format!("upload fee session {} has no pending upload id", session.id),
            ));
        };

        match self.store.consume_pending_upload(pending_id, now).await? {
            Some(media) => {
                tracing::info!(
                    pending_upload_id = %pending_id,
                    media_id = %media.id,
                    user_id = %media.owner_id,
                    "Paid upload published"
                );
                self.notifier
                    .dispatch(
                        media.owner_id,
                        NotificationKind::UploadPublished,
                        json!({ "media_id": media.id, "title": media.title }),
                    )
                    .await;
                Ok(WebhookOutcome::Applied)
            }
            None if self.store.get_media(pending_id).await?.is_some() => {
                tracing::info!(
                    pending_upload_id = %pending_id,
                    "Pending upload already published; replay ignored"
                );
                Ok(WebhookOutcome::StaleReplay)
            }
            None => Ok(anomaly(
                event,
                format!("pending upload {} not found", pending_id),
            )),
        }
    }

    async fn grant_credits(
        &self,
        event: &GatewayEvent,
        session: &CheckoutSessionObject,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let user_id = session.metadata_uuid(metadata_keys::USER_ID);
        let credits = session
            .metadata
            .get(metadata_keys::CREDITS)
            .and_then(|c| c.parse::<u32>().ok())
            .filter(|c| *c > 0);

        let (Some(user_id), Some(credits)) = (user_id, credits) else {
            return Ok(anomaly(
                event,
                format!("credit pack session {} missing user or credits", session.id),
            ));
        };

        let granted = self
            .store
            .grant_upload_credits(user_id, &session.id, credits, now)
            .await?;

        if granted {
            tracing::info!(
                user_id = %user_id,
                credits = credits,
                session_id = %session.id,
                "Granted upload credits"
            );
            Ok(WebhookOutcome::Applied)
        } else {
            tracing::info!(session_id = %session.id, "Upload credits already granted");
            Ok(WebhookOutcome::StaleReplay)
        }
    }

    async fn resolve_subscription_user(
        &self,
        subscription: &SubscriptionObject,
    ) -> BillingResult<Option<Uuid>> {
        if let Some(user_id) = subscription.metadata_user_id() {
            return Ok(Some(user_id));
        }
        if let Some(user_id) = self
            .store
            .find_user_by_subscription_ref(&subscription.id)
            .await?
        {
            return Ok(Some(user_id));
        }
        match subscription.customer_ref() {
            Some(customer) => self.store.find_user_by_customer_ref(&customer).await,
            None => Ok(None),
        }
    }

    fn subscription_tier(&self, subscription: &SubscriptionObject) -> Option<MembershipTier> {
        subscription
            .metadata
            .get(metadata_keys::TIER)
            .and_then(|t| t.parse::<MembershipTier>().ok())
            .or_else(|| {
                subscription
                    .price_ids()
                    .find_map(|price| self.prices.tier_for_price_id(price))
            })
            .filter(MembershipTier::is_paid)
    }

    async fn handle_subscription_upsert(
        &self,
        event: &GatewayEvent,
        subscription: &SubscriptionObject,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        match subscription.state() {
            SubscriptionState::Ended => {
                return self
                    .handle_subscription_ended(event, subscription, now)
                    .await;
            }
            SubscriptionState::PastDue => {
                tracing::warn!(
                    event_id = %event.id,
                    subscription_id = %subscription.id,
                    "Subscription past due; keeping tier while payment is retried"
                );
                return Ok(WebhookOutcome::Ignored);
            }
            SubscriptionState::Pending => {
                tracing::info!(
                    event_id = %event.id,
                    subscription_id = %subscription.id,
                    status = %subscription.status,
                    "Subscription not yet entitled; no change"
                );
                return Ok(WebhookOutcome::Ignored);
            }
            SubscriptionState::Entitled => {}
        }

        let Some(user_id) = self.resolve_subscription_user(subscription).await? else {
            return Ok(anomaly(
                event,
                format!("no user for subscription {}", subscription.id),
            ));
        };
        let Some(tier) = self.subscription_tier(subscription) else {
            return Ok(anomaly(
                event,
                format!("cannot determine tier for subscription {}", subscription.id),
            ));
        };

        let grant = MembershipGrant {
            user_id,
            tier,
            period_end: subscription.period_end(),
            customer_ref: subscription.customer_ref(),
            subscription_ref: Some(subscription.id.clone()),
            observed_at: event.created_at(),
        };

        self.apply_grant(event, grant, now).await
    }

    async fn handle_subscription_ended(
        &self,
        event: &GatewayEvent,
        subscription: &SubscriptionObject,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(user_id) = self.resolve_subscription_user(subscription).await? else {
            return Ok(anomaly(
                event,
                format!("no user for ended subscription {}", subscription.id),
            ));
        };

        let outcome = self
            .store
            .downgrade_to_viewer(user_id, Some(&subscription.id), event.created_at(), now)
            .await?;

        match outcome {
            DowngradeOutcome::Downgraded { previous_tier } => {
                tracing::info!(
                    event_id = %event.id,
                    user_id = %user_id,
                    previous_tier = %previous_tier,
                    "Membership downgraded to viewer"
                );
                self.notifier
                    .dispatch(
                        user_id,
                        NotificationKind::MembershipCancelled,
                        json!({ "previous_tier": previous_tier.as_str() }),
                    )
                    .await;
                Ok(WebhookOutcome::Applied)
            }
            DowngradeOutcome::AlreadyViewer | DowngradeOutcome::Stale => {
                tracing::info!(
                    event_id = %event.id,
                    user_id = %user_id,
                    outcome = ?outcome,
                    "Subscription end already reflected"
                );
                Ok(WebhookOutcome::StaleReplay)
            }
            DowngradeOutcome::SubscriptionMismatch => {
                tracing::info!(
                    event_id = %event.id,
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    "Ended subscription is not the user's current one; ignoring"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    // ---- Event ledger administration ----------------------------------

    pub async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.list_events(status, limit).await
    }

    /// Re-run a stored event through the reconciler.
    ///
    /// The stored body was verified on receipt, so it is not re-verified.
    pub async fn replay_event(
        &self,
        event_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookReplayResult> {
        let record = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Webhook event {} not found", event_id)))?;

        tracing::info!(
            event_id = %event_id,
            previous_status = %record.status,
            "Replaying webhook event"
        );

        let event: GatewayEvent = serde_json::from_str(&record.payload)?;
        let result = match self.process_event(&event, now).await {
            Err(e) if !e.is_retryable() => Ok(anomaly(&event, e.to_string())),
            other => other,
        };
        self.record_result(event_id, &result, now).await;

        let (new_status, new_error, outcome) = match result {
            Ok(WebhookOutcome::Anomaly(detail)) => (
                EventStatus::Error,
                Some(detail.clone()),
                Some(WebhookOutcome::Anomaly(detail)),
            ),
            Ok(outcome) => (EventStatus::Success, None, Some(outcome)),
            Err(e) => (EventStatus::Error, Some(e.to_string()), None),
        };

        tracing::info!(
            event_id = %event_id,
            previous_status = %record.status,
            new_status = %new_status,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            event_id: record.event_id,
            event_type: record.event_type,
            previous_status: record.status,
            previous_error: record.error_message,
            success: new_status == EventStatus::Success,
            new_status,
            new_error,
            outcome,
        })
    }

    /// Replay failed events, oldest first
    pub async fn replay_all_failed(
        &self,
        max_events: Option<i64>,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<WebhookReplayResult>> {
        let mut failed = self
            .store
            .list_events(Some(EventStatus::Error), max_events.unwrap_or(100))
            .await?;
        failed.reverse();

        let mut results = Vec::with_capacity(failed.len());
        for record in failed {
            match self.replay_event(&record.event_id, now).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        event_id = %record.event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        event_id: record.event_id,
                        event_type: record.event_type,
                        previous_status: record.status,
                        previous_error: record.error_message,
                        new_status: EventStatus::Error,
                        new_error: Some(e.to_string()),
                        outcome: None,
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }
}
