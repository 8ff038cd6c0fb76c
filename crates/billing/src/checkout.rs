//! Checkout initiation
//!
//! Creates the local records a later webhook will settle (PENDING purchase,
//! pending upload) and the matching gateway session. Session metadata carries
//! everything the reconciler needs to route the confirmation back.

use std::collections::HashMap;
use std::sync::Arc;

use mediamart_shared::{CostType, MembershipTier};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{metadata_keys, CheckoutType};
use crate::gateway::{CheckoutLine, CheckoutRequest, CheckoutSessionInfo, PaymentGateway, PriceIds};
use crate::notifications::{NotificationKind, Notifier};
use crate::purchases::{MediaAsset, NewUpload, PendingUpload, PurchaseRecord};
use crate::quota::QuotaEvaluation;
use crate::store::LedgerStore;

/// Price of one pre-purchased upload credit
pub const UPLOAD_CREDIT_PRICE_CENTS: i64 = 100;

/// Largest credit pack sold in one checkout
pub const MAX_CREDIT_PACK: u32 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseCheckout {
    pub purchase_id: Uuid,
    pub amount_cents: i64,
    #[serde(flatten)]
    pub session: CheckoutSessionInfo,
}

/// What happened to an upload request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    /// Covered by quota or a credit; the media is live
    Published {
        media: MediaAsset,
        evaluation: QuotaEvaluation,
    },
    /// Staged until the upload fee is paid
    PaymentRequired {
        pending_upload_id: Uuid,
        evaluation: QuotaEvaluation,
        session: CheckoutSessionInfo,
    },
    /// No upload path on the current plan
    Blocked { evaluation: QuotaEvaluation },
}

fn metadata(checkout_type: CheckoutType, user_id: Uuid) -> HashMap<String, String> {
    HashMap::from([
        (
            metadata_keys::CHECKOUT_TYPE.to_string(),
            checkout_type.as_str().to_string(),
        ),
        (metadata_keys::USER_ID.to_string(), user_id.to_string()),
    ])
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Notifier,
    prices: PriceIds,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Notifier,
        prices: PriceIds,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            prices,
        }
    }

    /// Start buying someone else's published media
    pub async fn begin_media_purchase(
        &self,
        buyer_id: Uuid,
        media_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<PurchaseCheckout> {
        let media = self
            .store
            .get_media(media_id)
            .await?
            .filter(|m| m.deleted_at.is_none())
            .ok_or_else(|| BillingError::NotFound(format!("Media {} not found", media_id)))?;

        if media.owner_id == buyer_id {
            return Err(BillingError::InvalidInput(
                "cannot purchase your own media".to_string(),
            ));
        }
        if media.is_sold {
            return Err(BillingError::InvalidInput("media is already sold".to_string()));
        }
        if media.price_cents <= 0 {
            return Err(BillingError::InvalidInput("media is not for sale".to_string()));
        }

        let purchase = PurchaseRecord::new_pending(buyer_id, media.id, media.price_cents, now);
        self.store.insert_purchase(&purchase).await?;

        let mut meta = metadata(CheckoutType::MediaPurchase, buyer_id);
        meta.insert(metadata_keys::PURCHASE_ID.to_string(), purchase.id.to_string());

        let customer_ref = self
            .store
            .get_entitlement(buyer_id)
            .await?
            .and_then(|e| e.payment_customer_ref);

        let request = CheckoutRequest {
            customer_ref,
            line: CheckoutLine::OneOff {
                name: media.title.clone(),
                description: Some("10 days of download access".to_string()),
                unit_amount_cents: media.price_cents,
                quantity: 1,
            },
            metadata: meta,
        };

        let session = match self.gateway.create_checkout(request).await {
            Ok(session) => session,
            Err(e) => {
                // Nothing can settle this purchase without a session
                if let Err(fail_err) = self.store.fail_purchase(purchase.id).await {
                    tracing::warn!(
                        purchase_id = %purchase.id,
                        error = %fail_err,
                        "Failed to mark abandoned purchase failed"
                    );
                }
                return Err(e);
            }
        };

        self.store
            .attach_checkout_session(purchase.id, &session.session_id)
            .await?;

        tracing::info!(
            purchase_id = %purchase.id,
            buyer_id = %buyer_id,
            media_id = %media.id,
            session_id = %session.session_id,
            "Started media purchase checkout"
        );

        Ok(PurchaseCheckout {
            purchase_id: purchase.id,
            amount_cents: purchase.amount_cents,
            session,
        })
    }

    /// Publish an upload now or stage it behind an upload fee
    pub async fn begin_upload(
        &self,
        user_id: Uuid,
        upload: NewUpload,
        now: OffsetDateTime,
    ) -> BillingResult<UploadOutcome> {
        upload.validate().map_err(BillingError::InvalidInput)?;

        let evaluation = self.store.commit_upload(user_id, now).await?;

        match evaluation.cost_type {
            CostType::Free | CostType::PaidCredit => {
                let media = upload.into_media(user_id, now);
                self.store.insert_media(&media).await?;

                tracing::info!(
                    user_id = %user_id,
                    media_id = %media.id,
                    cost_type = %evaluation.cost_type,
                    "Upload published"
                );
                self.notifier
                    .dispatch(
                        user_id,
                        NotificationKind::UploadPublished,
                        json!({ "media_id": media.id, "title": media.title }),
                    )
                    .await;

                Ok(UploadOutcome::Published { media, evaluation })
            }
            CostType::PaidCharge => {
                let pending = PendingUpload::new(user_id, upload, evaluation.amount_due_cents, now);
                self.store.insert_pending_upload(&pending).await?;

                let mut meta = metadata(CheckoutType::UploadFee, user_id);
                meta.insert(
                    metadata_keys::PENDING_UPLOAD_ID.to_string(),
                    pending.id.to_string(),
                );

                let customer_ref = self
                    .store
                    .get_entitlement(user_id)
                    .await?
                    .and_then(|e| e.payment_customer_ref);

                let session = self
                    .gateway
                    .create_checkout(CheckoutRequest {
                        customer_ref,
                        line: CheckoutLine::OneOff {
                            name: "Upload fee".to_string(),
                            description: Some(pending.title.clone()),
                            unit_amount_cents: evaluation.amount_due_cents,
                            quantity: 1,
                        },
                        metadata: meta,
                    })
                    .await?;

                tracing::info!(
                    user_id = %user_id,
                    pending_upload_id = %pending.id,
                    amount_due_cents = evaluation.amount_due_cents,
                    "Upload staged pending fee payment"
                );

                Ok(UploadOutcome::PaymentRequired {
                    pending_upload_id: pending.id,
                    evaluation,
                    session,
                })
            }
            CostType::Blocked => {
                tracing::info!(user_id = %user_id, "Upload blocked on current plan");
                Ok(UploadOutcome::Blocked { evaluation })
            }
        }
    }

    /// Start a subscription for a VIEWER
    pub async fn begin_subscription_checkout(
        &self,
        user_id: Uuid,
        tier: MembershipTier,
        now: OffsetDateTime,
    ) -> BillingResult<CheckoutSessionInfo> {
        if !tier.is_paid() {
            return Err(BillingError::InvalidTier(
                "viewer has no subscription".to_string(),
            ));
        }
        let price_id = self
            .prices
            .price_id_for_tier(tier)
            .ok_or_else(|| BillingError::InvalidTier(format!("no price configured for {}", tier)))?;

        let entitlement = self.store.ensure_entitlement(user_id, now).await?;
        if entitlement.payment_subscription_ref.is_some() && entitlement.membership_tier.is_paid() {
            return Err(BillingError::InvalidInput(
                "already subscribed; change tier instead".to_string(),
            ));
        }

        let mut meta = metadata(CheckoutType::Subscription, user_id);
        meta.insert(metadata_keys::TIER.to_string(), tier.as_str().to_string());

        let session = self
            .gateway
            .create_checkout(CheckoutRequest {
                customer_ref: entitlement.payment_customer_ref,
                line: CheckoutLine::Subscription {
                    price_id: price_id.to_string(),
                },
                metadata: meta,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            tier = %tier,
            session_id = %session.session_id,
            "Started subscription checkout"
        );

        Ok(session)
    }

    /// Start buying a pack of one-time upload credits
    pub async fn begin_credit_pack_checkout(
        &self,
        user_id: Uuid,
        credits: u32,
        now: OffsetDateTime,
    ) -> BillingResult<CheckoutSessionInfo> {
        if credits == 0 || credits > MAX_CREDIT_PACK {
            return Err(BillingError::InvalidInput(format!(
                "credits must be between 1 and {}",
                MAX_CREDIT_PACK
            )));
        }

        let entitlement = self.store.ensure_entitlement(user_id, now).await?;

        let mut meta = metadata(CheckoutType::UploadCredits, user_id);
        meta.insert(metadata_keys::CREDITS.to_string(), credits.to_string());

        let session = self
            .gateway
            .create_checkout(CheckoutRequest {
                customer_ref: entitlement.payment_customer_ref,
                line: CheckoutLine::OneOff {
                    name: "Upload credits".to_string(),
                    description: Some(format!("{} one-time upload credits", credits)),
                    unit_amount_cents: UPLOAD_CREDIT_PRICE_CENTS,
                    quantity: u64::from(credits),
                },
                metadata: meta,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            credits = credits,
            session_id = %session.session_id,
            "Started credit pack checkout"
        );

        Ok(session)
    }
}
