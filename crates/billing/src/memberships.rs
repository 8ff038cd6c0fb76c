//! User-initiated membership actions
//!
//! Not webhook-driven, but still idempotent: a double-submitted cancel
//! finds the user already on VIEWER and does nothing.

use std::sync::Arc;

use mediamart_shared::MembershipTier;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::{DowngradeOutcome, MembershipGrant};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{PaymentGateway, PriceIds};
use crate::notifications::{NotificationKind, Notifier};
use crate::store::LedgerStore;

/// Result of a tier change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TierChangeOutcome {
    /// Already on the requested tier
    Unchanged,
    /// Target was VIEWER
    Cancelled { outcome: DowngradeOutcome },
    Changed {
        previous_tier: MembershipTier,
        tier: MembershipTier,
    },
}

/// Gateway timestamps have second precision, so manual changes are stamped
/// at the start of the current second. The gateway's follow-up event for the
/// same change is then never older.
fn observed_now(now: OffsetDateTime) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(now.unix_timestamp()).unwrap_or(now)
}

#[derive(Clone)]
pub struct MembershipService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Notifier,
    prices: PriceIds,
}

impl MembershipService {
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

    /// Cancel the user's membership immediately
    pub async fn cancel(&self, user_id: Uuid, now: OffsetDateTime) -> BillingResult<DowngradeOutcome> {
        let entitlement = self.store.ensure_entitlement(user_id, now).await?;
        if entitlement.membership_tier == MembershipTier::Viewer {
            tracing::info!(user_id = %user_id, "Cancel requested for viewer; nothing to do");
            return Ok(DowngradeOutcome::AlreadyViewer);
        }

        // Gateway cancel must succeed before the local downgrade
        if let Some(subscription_ref) = &entitlement.payment_subscription_ref {
            self.gateway.cancel_subscription(subscription_ref).await?;
        }

        let outcome = self
            .store
            .downgrade_to_viewer(user_id, None, observed_now(now), now)
            .await?;

        if let DowngradeOutcome::Downgraded { previous_tier } = outcome {
            tracing::info!(
                user_id = %user_id,
                previous_tier = %previous_tier,
                "Membership cancelled by user"
            );
            self.notifier
                .dispatch(
                    user_id,
                    NotificationKind::MembershipCancelled,
                    json!({ "previous_tier": previous_tier.as_str() }),
                )
                .await;
        }

        Ok(outcome)
    }

    /// Upgrade or downgrade between tiers
    pub async fn change_tier(
        &self,
        user_id: Uuid,
        tier: MembershipTier,
        now: OffsetDateTime,
    ) -> BillingResult<TierChangeOutcome> {
        let entitlement = self.store.ensure_entitlement(user_id, now).await?;
        let previous_tier = entitlement.membership_tier;

        if previous_tier == tier {
            return Ok(TierChangeOutcome::Unchanged);
        }

        if tier == MembershipTier::Viewer {
            let outcome = self.cancel(user_id, now).await?;
            return Ok(TierChangeOutcome::Cancelled { outcome });
        }

        let subscription_ref = entitlement.payment_subscription_ref.clone().ok_or_else(|| {
            BillingError::SubscriptionRequired(format!(
                "subscribe to {} through checkout first",
                tier
            ))
        })?;
        let price_id = self
            .prices
            .price_id_for_tier(tier)
            .ok_or_else(|| BillingError::InvalidTier(format!("no price configured for {}", tier)))?;

        self.gateway
            .change_subscription_price(&subscription_ref, price_id, tier)
            .await?;

        // Keep the paid period; the tier change itself resets the quota
        let grant = MembershipGrant {
            user_id,
            tier,
            period_end: entitlement.membership_expires_at.filter(|end| *end > now),
            customer_ref: None,
            subscription_ref: None,
            observed_at: observed_now(now),
        };
        let change = self.store.apply_membership(&grant, now).await?;

        tracing::info!(
            user_id = %user_id,
            previous_tier = %previous_tier,
            tier = %tier,
            change = ?change,
            "Membership tier changed by user"
        );

        if change.is_activation() {
            self.notifier
                .dispatch(
                    user_id,
                    NotificationKind::MembershipActivated,
                    json!({ "tier": tier.as_str(), "previous_tier": previous_tier.as_str() }),
                )
                .await;
        }

        Ok(TierChangeOutcome::Changed {
            previous_tier,
            tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::DispatchMode;
    use crate::store::InMemoryLedgerStore;
    use crate::testing::{FakeGateway, RecordingDispatcher};
    use time::macros::datetime;
    use time::Duration;

    fn now() -> OffsetDateTime {
        datetime!(2025-03-01 12:00:00.250 UTC)
    }

    struct Harness {
        store: Arc<InMemoryLedgerStore>,
        gateway: Arc<FakeGateway>,
        dispatcher: Arc<RecordingDispatcher>,
        service: MembershipService,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryLedgerStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let notifier = Notifier::new(store.clone(), dispatcher.clone(), DispatchMode::Inline);
        let prices = PriceIds {
            basic: Some("price_basic".into()),
            advanced: Some("price_advanced".into()),
            premium: Some("price_premium".into()),
        };
        let service = MembershipService::new(store.clone(), gateway.clone(), notifier, prices);
        Harness {
            store,
            gateway,
            dispatcher,
            service,
        }
    }

    async fn subscribe(h: &Harness, user_id: Uuid, tier: MembershipTier) {
        h.store.register_contact(user_id, "member@example.com").await;
        let grant = MembershipGrant {
            user_id,
            tier,
            period_end: Some(now() + Duration::days(20)),
            customer_ref: Some("cus_1".into()),
            subscription_ref: Some("sub_1".into()),
            observed_at: now() - Duration::days(10),
        };
        h.store.apply_membership(&grant, now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_cancels_gateway_then_downgrades() {
        let h = harness();
        let user_id = Uuid::new_v4();
        subscribe(&h, user_id, MembershipTier::Premium).await;

        let outcome = h.service.cancel(user_id, now()).await.unwrap();
        assert_eq!(
            outcome,
            DowngradeOutcome::Downgraded {
                previous_tier: MembershipTier::Premium
            }
        );
        assert_eq!(h.gateway.cancelled().await, vec!["sub_1".to_string()]);
        assert_eq!(h.dispatcher.count(NotificationKind::MembershipCancelled).await, 1);
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_membership_intact() {
        let h = harness();
        let user_id = Uuid::new_v4();
        subscribe(&h, user_id, MembershipTier::Basic).await;
        h.gateway.set_failing(true);

        assert!(matches!(
            h.service.cancel(user_id, now()).await,
            Err(BillingError::Gateway(_))
        ));
        let e = h.store.get_entitlement(user_id).await.unwrap().unwrap();
        assert_eq!(e.membership_tier, MembershipTier::Basic);
    }

    #[tokio::test]
    async fn test_upgrade_keeps_period_and_resets_quota() {
        let h = harness();
        let user_id = Uuid::new_v4();
        subscribe(&h, user_id, MembershipTier::Basic).await;
        h.store.commit_upload(user_id, now()).await.unwrap();

        let outcome = h
            .service
            .change_tier(user_id, MembershipTier::Advanced, now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TierChangeOutcome::Changed {
                previous_tier: MembershipTier::Basic,
                tier: MembershipTier::Advanced
            }
        );

        let e = h.store.get_entitlement(user_id).await.unwrap().unwrap();
        assert_eq!(e.membership_tier, MembershipTier::Advanced);
        assert_eq!(e.membership_expires_at, Some(now() + Duration::days(20)));
        assert_eq!(e.free_uploads_used, 0);
        assert_eq!(
            h.gateway.price_changes().await,
            vec![(
                "sub_1".to_string(),
                "price_advanced".to_string(),
                MembershipTier::Advanced
            )]
        );

        // Gateway's follow-up event stamped in the same second is not stale
        let follow_up = MembershipGrant {
            user_id,
            tier: MembershipTier::Advanced,
            period_end: Some(now() + Duration::days(20)),
            customer_ref: None,
            subscription_ref: Some("sub_1".into()),
            observed_at: datetime!(2025-03-01 12:00:00 UTC),
        };
        assert_ne!(
            h.store.apply_membership(&follow_up, now()).await.unwrap(),
            crate::entitlement::MembershipChange::Stale
        );
    }

    #[tokio::test]
    async fn test_paid_tier_without_subscription_requires_checkout() {
        let h = harness();
        let user_id = Uuid::new_v4();
        assert!(matches!(
            h.service
                .change_tier(user_id, MembershipTier::Basic, now())
                .await,
            Err(BillingError::SubscriptionRequired(_))
        ));
        assert!(h.gateway.price_changes().await.is_empty());
    }

    #[tokio::test]
    async fn test_same_tier_and_viewer_target() {
        let h = harness();
        let user_id = Uuid::new_v4();
        subscribe(&h, user_id, MembershipTier::Advanced).await;

        assert_eq!(
            h.service
                .change_tier(user_id, MembershipTier::Advanced, now())
                .await
                .unwrap(),
            TierChangeOutcome::Unchanged
        );

        let outcome = h
            .service
            .change_tier(user_id, MembershipTier::Viewer, now())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TierChangeOutcome::Cancelled {
                outcome: DowngradeOutcome::Downgraded { .. }
            }
        ));
    }
}
