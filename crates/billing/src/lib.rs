// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Service assembly takes every collaborator explicitly
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! MediaMart Billing Module
//!
//! The payment truth source for the marketplace: who may upload, what each
//! upload costs, who bought what, and when purchased content goes away.
//!
//! ## Features
//!
//! - **Ledger**: entitlements, purchases, pending uploads and the webhook log
//!   behind one [`LedgerStore`] trait, with Postgres and in-memory backends
//! - **Quota**: FREE / PAID_CREDIT / PAID_CHARGE / BLOCKED upload evaluation
//! - **Checkout**: media purchases, upload fees, credit packs, subscriptions
//! - **Webhooks**: signed, idempotent, replayable reconciliation of gateway
//!   events into ledger state
//! - **Memberships**: user-initiated cancel and tier changes
//! - **Expiration**: reminders at 7/3/1 days and deletion of sold content
//! - **Invariants**: read-only ledger consistency checks

pub mod assets;
pub mod checkout;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod expiration;
pub mod gateway;
pub mod invariants;
pub mod memberships;
pub mod notifications;
pub mod purchases;
pub mod quota;
pub mod signature;
pub mod store;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


use std::sync::Arc;

// Assets
pub use assets::{AssetStore, AssetStoreError, HttpAssetStore};

// Checkout
pub use checkout::{
    CheckoutService, PurchaseCheckout, UploadOutcome, MAX_CREDIT_PACK, UPLOAD_CREDIT_PRICE_CENTS,
};

// Entitlement
pub use entitlement::{DowngradeOutcome, MembershipChange, MembershipGrant, UserEntitlement};

// Error
pub use error::{BillingError, BillingResult};

// Expiration
pub use expiration::{ExpirationScheduler, SweepReport, UndeliveredReminder};

// Gateway
pub use gateway::{
    CheckoutLine, CheckoutRequest, CheckoutSessionInfo, PaymentGateway, PriceIds, StripeConfig,
    StripeGateway,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Memberships
pub use memberships::{MembershipService, TierChangeOutcome};

// Notifications
pub use notifications::{
    DispatchMode, EmailConfig, NotificationDispatcher, NotificationKind, Notifier,
    ResendDispatcher,
};

// Purchases
pub use purchases::{
    MediaAsset, NewUpload, PendingUpload, PurchaseRecord, DELETE_AFTER_DAYS, REMINDER_THRESHOLDS,
};

// Quota
pub use quota::{QuotaEvaluation, QuotaStatus};

// Store
pub use store::{InMemoryLedgerStore, LedgerStore, PgLedgerStore};

// Webhooks
pub use webhooks::{
    EventStatus, WebhookEventRecord, WebhookHandler, WebhookOutcome, WebhookReplayResult,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn LedgerStore>,
    pub notifier: Notifier,
    pub checkout: CheckoutService,
    pub memberships: MembershipService,
    pub webhooks: WebhookHandler,
    pub expiration: ExpirationScheduler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        let webhook_secret = config.webhook_secret.clone();
        let prices = config.prices.clone();

        Ok(Self::new(
            Arc::new(PgLedgerStore::new(pool)),
            Arc::new(StripeGateway::new(config)),
            Arc::new(ResendDispatcher::from_env()),
            Arc::new(HttpAssetStore::from_env()),
            webhook_secret,
            prices,
            DispatchMode::Detached,
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        assets: Arc<dyn AssetStore>,
        webhook_secret: impl Into<String>,
        prices: PriceIds,
        mode: DispatchMode,
    ) -> Self {
        let notifier = Notifier::new(store.clone(), dispatcher, mode);

        Self {
            checkout: CheckoutService::new(
                store.clone(),
                gateway.clone(),
                notifier.clone(),
                prices.clone(),
            ),
            memberships: MembershipService::new(
                store.clone(),
                gateway,
                notifier.clone(),
                prices.clone(),
            ),
            webhooks: WebhookHandler::new(store.clone(), notifier.clone(), webhook_secret, prices),
            expiration: ExpirationScheduler::new(store.clone(), notifier.clone(), assets),
            notifier,
            store,
        }
    }

    /// Current quota and plan projection for a user
    pub async fn quota_status(
        &self,
        user_id: uuid::Uuid,
        now: time::OffsetDateTime,
    ) -> BillingResult<QuotaStatus> {
        let entitlement = self.store.ensure_entitlement(user_id, now).await?;
        Ok(QuotaStatus::project(&entitlement, now))
    }

    pub fn invariants(&self) -> InvariantChecker {
        InvariantChecker::new(self.store.clone())
    }
}
