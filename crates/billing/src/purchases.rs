//! Media assets, purchase records and pending uploads

use std::collections::BTreeSet;

use mediamart_shared::PurchaseStatus;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Days of access a buyer gets before the purchased asset is deleted
pub const DELETE_AFTER_DAYS: i64 = 10;

/// Days-remaining checkpoints at which a buyer is reminded
pub const REMINDER_THRESHOLDS: [u8; 3] = [7, 3, 1];

const NANOS_PER_DAY: i128 = 86_400 * 1_000_000_000;

/// A published media asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaAsset {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub storage_key: String,
    pub price_cents: i64,
    pub is_sold: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

/// Metadata supplied by the client for a new upload
#[derive(Debug, Clone, Deserialize)]
pub struct NewUpload {
    pub title: String,
    pub storage_key: String,
    pub price_cents: i64,
}

impl NewUpload {
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title must not be empty".into());
        }
        if self.storage_key.trim().is_empty() {
            return Err("storage_key must not be empty".into());
        }
        if self.price_cents < 0 {
            return Err("price_cents must not be negative".into());
        }
        Ok(())
    }

    pub fn into_media(self, owner_id: Uuid, now: OffsetDateTime) -> MediaAsset {
        MediaAsset {
            id: Uuid::new_v4(),
            owner_id,
            title: self.title,
            storage_key: self.storage_key,
            price_cents: self.price_cents,
            is_sold: false,
            published_at: now,
            deleted_at: None,
        }
    }
}

/// One buyer's purchase of one media asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseRecord {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub media_id: Uuid,
    pub amount_cents: i64,
    pub status: PurchaseStatus,
    pub checkout_session_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub delete_after: Option<OffsetDateTime>,
    /// Reminder thresholds already claimed; only grows
    pub reminders_sent: BTreeSet<u8>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub asset_deleted_at: Option<OffsetDateTime>,
}

impl PurchaseRecord {
    pub fn new_pending(
        buyer_id: Uuid,
        media_id: Uuid,
        amount_cents: i64,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            buyer_id,
            media_id,
            amount_cents,
            status: PurchaseStatus::Pending,
            checkout_session_id: None,
            created_at: now,
            completed_at: None,
            delete_after: None,
            reminders_sent: BTreeSet::new(),
            asset_deleted_at: None,
        }
    }

    /// PENDING → COMPLETED. Sets `completed_at` and `delete_after` on this
    /// edge only; returns false when the purchase is already terminal.
    pub fn complete(&mut self, now: OffsetDateTime) -> bool {
        if self.status != PurchaseStatus::Pending {
            return false;
        }
        self.status = PurchaseStatus::Completed;
        self.completed_at = Some(now);
        self.delete_after = Some(now + Duration::days(DELETE_AFTER_DAYS));
        true
    }

    /// PENDING → FAILED; returns false when already terminal
    pub fn fail(&mut self) -> bool {
        if self.status != PurchaseStatus::Pending {
            return false;
        }
        self.status = PurchaseStatus::Failed;
        true
    }

    /// Whole days of access left, rounded up. `None` until completed.
    pub fn days_left(&self, now: OffsetDateTime) -> Option<i64> {
        self.delete_after.map(|deadline| days_left(deadline, now))
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.delete_after.is_some_and(|deadline| deadline <= now)
    }
}

/// `ceil((deadline - now) / 1 day)`, floored at zero
pub fn days_left(deadline: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let nanos = (deadline - now).whole_nanoseconds();
    if nanos <= 0 {
        return 0;
    }
    let days = (nanos + NANOS_PER_DAY - 1) / NANOS_PER_DAY;
    i64::try_from(days).unwrap_or(i64::MAX)
}

/// Upload staged until its upload fee is paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingUpload {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub storage_key: String,
    pub price_cents: i64,
    pub amount_due_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PendingUpload {
    pub fn new(user_id: Uuid, upload: NewUpload, amount_due_cents: i64, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: upload.title,
            storage_key: upload.storage_key,
            price_cents: upload.price_cents,
            amount_due_cents,
            created_at: now,
        }
    }

    /// The asset published once the fee is confirmed. Its id is the pending
    /// upload id so a replayed publish can never create a second asset.
    pub fn publish(&self, now: OffsetDateTime) -> MediaAsset {
        MediaAsset {
            id: self.id,
            owner_id: self.user_id,
            title: self.title.clone(),
            storage_key: self.storage_key.clone(),
            price_cents: self.price_cents,
            is_sold: false,
            published_at: now,
            deleted_at: None,
        }
    }
}

/// Result of a guarded purchase status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseTransition {
    /// The edge was taken; carries the updated record
    Applied(PurchaseRecord),
    /// The purchase was already terminal; nothing written
    AlreadyTerminal(PurchaseStatus),
    /// The media was sold to another buyer or removed first. The purchase
    /// was moved to FAILED instead and its payment needs a refund.
    AssetUnavailable(PurchaseRecord),
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn now() -> OffsetDateTime {
        datetime!(2025-03-01 12:00 UTC)
    }

    #[test]
    fn test_complete_sets_deadline_once() {
        let mut p = PurchaseRecord::new_pending(Uuid::new_v4(), Uuid::new_v4(), 500, now());
        assert!(p.complete(now()));
        assert_eq!(p.completed_at, Some(now()));
        assert_eq!(p.delete_after, Some(now() + Duration::days(10)));

        let later = now() + Duration::days(1);
        assert!(!p.complete(later));
        assert_eq!(p.completed_at, Some(now()));
        assert_eq!(p.delete_after, Some(now() + Duration::days(10)));
    }

    #[test]
    fn test_failed_purchase_cannot_complete() {
        let mut p = PurchaseRecord::new_pending(Uuid::new_v4(), Uuid::new_v4(), 500, now());
        assert!(p.fail());
        assert!(!p.complete(now()));
        assert_eq!(p.status, PurchaseStatus::Failed);
        assert!(p.delete_after.is_none());
        assert!(!p.fail());
    }

    #[test]
    fn test_days_left_rounds_up() {
        let deadline = now() + Duration::days(7);
        assert_eq!(days_left(deadline, now()), 7);
        assert_eq!(days_left(deadline, now() + Duration::hours(1)), 7);
        assert_eq!(days_left(deadline, now() + Duration::days(1)), 6);
        assert_eq!(days_left(deadline, deadline - Duration::seconds(1)), 1);
        assert_eq!(days_left(deadline, deadline), 0);
        assert_eq!(days_left(deadline, deadline + Duration::days(2)), 0);
    }

    #[test]
    fn test_days_left_sub_second_before_deadline_is_one() {
        let deadline = now() + Duration::days(1);
        assert_eq!(days_left(deadline, deadline - Duration::milliseconds(250)), 1);
        assert_eq!(days_left(deadline, deadline - Duration::nanoseconds(1)), 1);
        let p = {
            let mut p = PurchaseRecord::new_pending(Uuid::new_v4(), Uuid::new_v4(), 500, now());
            p.complete(now());
            p
        };
        let almost = now() + Duration::days(10) - Duration::milliseconds(1);
        assert!(!p.is_expired(almost));
        assert_eq!(p.days_left(almost), Some(1));
    }

    #[test]
    fn test_is_expired_at_deadline() {
        let mut p = PurchaseRecord::new_pending(Uuid::new_v4(), Uuid::new_v4(), 500, now());
        assert!(!p.is_expired(now() + Duration::days(30)));
        p.complete(now());
        assert!(!p.is_expired(now() + Duration::days(9)));
        assert!(p.is_expired(now() + Duration::days(10)));
    }

    #[test]
    fn test_new_upload_validation() {
        let ok = NewUpload {
            title: "Sunset".into(),
            storage_key: "u/1/sunset.jpg".into(),
            price_cents: 300,
        };
        assert!(ok.validate().is_ok());

        let negative = NewUpload {
            price_cents: -1,
            ..ok.clone()
        };
        assert!(negative.validate().is_err());

        let untitled = NewUpload {
            title: "  ".into(),
            ..ok
        };
        assert!(untitled.validate().is_err());
    }

    #[test]
    fn test_pending_upload_publishes_under_its_own_id() {
        let upload = NewUpload {
            title: "Sunset".into(),
            storage_key: "u/1/sunset.jpg".into(),
            price_cents: 300,
        };
        let pending = PendingUpload::new(Uuid::new_v4(), upload, 100, now());
        let media = pending.publish(now());
        assert_eq!(media.id, pending.id);
        assert_eq!(media.owner_id, pending.user_id);
        assert!(!media.is_sold);
    }
}
