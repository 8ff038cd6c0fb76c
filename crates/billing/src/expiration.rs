//! Purchased-content expiration sweep
//!
//! A completed purchase grants ten days of access. Each sweep:
//!
//! 1. groups active purchases by buyer, and when the buyer's most urgent
//!    purchase sits exactly on a reminder threshold, sends one aggregated
//!    reminder listing every purchase with seven days or fewer left
//! 2. deletes assets whose deadline has passed and flips them unsold
//!
//! Both passes rely on ledger guards (reminder claims, the deleted stamp),
//! so two sweeps running at once cannot double-send or double-delete.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::assets::{AssetStore, AssetStoreError, HttpAssetStore};
use crate::error::BillingResult;
use crate::notifications::{DispatchMode, NotificationKind, Notifier, ResendDispatcher};
use crate::purchases::{PurchaseRecord, REMINDER_THRESHOLDS};
use crate::store::LedgerStore;

/// Purchases with at most this many days left are listed in a reminder
const REMINDER_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub buyers_notified: usize,
    /// Purchase-threshold pairs claimed and delivered
    pub reminders_sent: usize,
    pub expired: usize,
    pub deletion_failures: usize,
    pub notification_failures: usize,
    /// Reminders claimed but not delivered, for manual resend
    pub undelivered_reminders: Vec<UndeliveredReminder>,
    /// Another sweep held the lock in this process
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndeliveredReminder {
    pub buyer_id: Uuid,
    pub threshold_days: u8,
    pub purchase_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct ExpirationScheduler {
    store: Arc<dyn LedgerStore>,
    notifier: Notifier,
    assets: Arc<dyn AssetStore>,
    sweep_lock: Arc<Mutex<()>>,
}

impl ExpirationScheduler {
    pub fn new(store: Arc<dyn LedgerStore>, notifier: Notifier, assets: Arc<dyn AssetStore>) -> Self {
        Self {
            store,
            notifier,
            assets,
            sweep_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Notification and asset-store settings from the environment. Needs no
    /// payment gateway configuration, so the worker can sweep without it.
    pub fn from_env(store: Arc<dyn LedgerStore>) -> Self {
        let notifier = Notifier::new(
            store.clone(),
            Arc::new(ResendDispatcher::from_env()),
            DispatchMode::Detached,
        );
        Self::new(store, notifier, Arc::new(HttpAssetStore::from_env()))
    }

    /// Run one reminder pass and one deletion pass
    pub async fn sweep(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            tracing::info!("Expiration sweep already running in this process; skipping");
            return Ok(SweepReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = SweepReport::default();
        self.reminder_pass(now, &mut report).await?;
        self.deletion_pass(now, &mut report).await?;

        tracing::info!(
            buyers_notified = report.buyers_notified,
            reminders_sent = report.reminders_sent,
            expired = report.expired,
            deletion_failures = report.deletion_failures,
            notification_failures = report.notification_failures,
            "Expiration sweep complete"
        );

        Ok(report)
    }

    async fn reminder_pass(&self, now: OffsetDateTime, report: &mut SweepReport) -> BillingResult<()> {
        let active = self.store.active_sold_purchases(now).await?;

        let mut by_buyer: BTreeMap<Uuid, Vec<(PurchaseRecord, i64)>> = BTreeMap::new();
        for purchase in active {
            let Some(days_left) = purchase.days_left(now) else {
                continue;
            };
            by_buyer
                .entry(purchase.buyer_id)
                .or_default()
                .push((purchase, days_left));
        }

        for (buyer_id, purchases) in by_buyer {
            let Some(min_days_left) = purchases.iter().map(|(_, days)| *days).min() else {
                continue;
            };
            // Only the threshold reached right now is sent; missed ones are
            // never backfilled
            let Some(threshold) = u8::try_from(min_days_left)
                .ok()
                .filter(|t| REMINDER_THRESHOLDS.contains(t))
            else {
                continue;
            };

            let due: Vec<&(PurchaseRecord, i64)> = purchases
                .iter()
                .filter(|(p, days)| {
                    *days <= REMINDER_WINDOW_DAYS && !p.reminders_sent.contains(&threshold)
                })
                .collect();
            if due.is_empty() {
                continue;
            }

            let mut claimed = Vec::with_capacity(due.len());
            for (purchase, days_left) in due {
                match self.store.claim_reminder(purchase.id, threshold, now).await {
                    Ok(true) => claimed.push((purchase, *days_left)),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        purchase_id = %purchase.id,
                        threshold = threshold,
                        error = %e,
                        "Failed to claim reminder threshold"
                    ),
                }
            }
            if claimed.is_empty() {
                continue;
            }

            let mut items = Vec::with_capacity(claimed.len());
            for (purchase, days_left) in &claimed {
                let title = match self.store.get_media(purchase.media_id).await {
                    Ok(Some(media)) => media.title,
                    _ => String::new(),
                };
                items.push(json!({
                    "purchase_id": purchase.id,
                    "media_id": purchase.media_id,
                    "title": title,
                    "days_left": days_left,
                }));
            }

            let delivered = self
                .notifier
                .send_now(
                    buyer_id,
                    NotificationKind::ExpirationReminder,
                    json!({ "threshold_days": threshold, "items": items }),
                )
                .await;

            if delivered {
                report.buyers_notified += 1;
                report.reminders_sent += claimed.len();
                tracing::info!(
                    buyer_id = %buyer_id,
                    threshold = threshold,
                    purchases = claimed.len(),
                    "Sent expiration reminder"
                );
            } else {
                // Claims stay recorded, so this threshold will not be sent again
                let purchase_ids: Vec<Uuid> = claimed.iter().map(|(p, _)| p.id).collect();
                report.notification_failures += 1;
                tracing::error!(
                    buyer_id = %buyer_id,
                    threshold = threshold,
                    purchase_ids = ?purchase_ids,
                    "Expiration reminder not delivered; threshold consumed, resend manually"
                );
                report.undelivered_reminders.push(UndeliveredReminder {
                    buyer_id,
                    threshold_days: threshold,
                    purchase_ids,
                });
            }
        }

        Ok(())
    }

    async fn deletion_pass(&self, now: OffsetDateTime, report: &mut SweepReport) -> BillingResult<()> {
        let expired = self.store.expired_sold_purchases(now).await?;

        for purchase in expired {
            let media = match self.store.get_media(purchase.media_id).await {
                Ok(media) => media,
                Err(e) => {
                    tracing::error!(
                        purchase_id = %purchase.id,
                        error = %e,
                        "Failed to load media for expired purchase"
                    );
                    report.deletion_failures += 1;
                    continue;
                }
            };

            let title = match &media {
                Some(media) => match self.assets.delete(media).await {
                    Ok(()) => media.title.clone(),
                    Err(AssetStoreError::AlreadyGone) => {
                        tracing::info!(media_id = %media.id, "Asset already deleted");
                        media.title.clone()
                    }
                    Err(AssetStoreError::Failed(reason)) => {
                        tracing::warn!(
                            purchase_id = %purchase.id,
                            media_id = %media.id,
                            reason = %reason,
                            "Asset deletion failed; will retry next sweep"
                        );
                        report.deletion_failures += 1;
                        continue;
                    }
                },
                None => {
                    tracing::error!(
                        purchase_id = %purchase.id,
                        media_id = %purchase.media_id,
                        "RECONCILIATION NEEDED: expired purchase references missing media"
                    );
                    String::new()
                }
            };

            match self.store.mark_asset_deleted(purchase.id, now).await {
                Ok(true) => {
                    report.expired += 1;
                    tracing::info!(
                        purchase_id = %purchase.id,
                        media_id = %purchase.media_id,
                        "Purchased content expired"
                    );
                    let delivered = self
                        .notifier
                        .send_now(
                            purchase.buyer_id,
                            NotificationKind::ContentExpired,
                            json!({ "media_id": purchase.media_id, "title": title }),
                        )
                        .await;
                    if !delivered {
                        report.notification_failures += 1;
                    }
                }
                Ok(false) => {
                    tracing::debug!(purchase_id = %purchase.id, "Expiry already recorded");
                }
                Err(e) => {
                    tracing::error!(
                        purchase_id = %purchase.id,
                        error = %e,
                        "Failed to record asset deletion"
                    );
                    report.deletion_failures += 1;
                }
            }
        }

        Ok(())
    }
}
