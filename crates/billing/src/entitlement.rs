//! User entitlement record and its state transitions
//!
//! The record holds membership tier, free-upload counters and one-time
//! upload credits. Every mutation goes through the methods here so that both
//! ledger backends apply identical rules:
//!
//! - the free-upload counter resets exactly once per tier change or per
//!   crossing of `free_uploads_reset_at`
//! - membership events older than the last applied one are ignored
//! - a downgrade only clears the subscription it names

use mediamart_shared::{CostType, MembershipTier, QUOTA_PERIOD_DAYS};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Length of one quota period
pub fn quota_period() -> Duration {
    Duration::days(QUOTA_PERIOD_DAYS)
}

/// Per-user entitlement state owned by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserEntitlement {
    pub user_id: Uuid,
    pub membership_tier: MembershipTier,
    /// `None` for VIEWER or for a non-expiring admin-granted tier
    #[serde(with = "time::serde::rfc3339::option")]
    pub membership_expires_at: Option<OffsetDateTime>,
    pub free_uploads_used: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub free_uploads_reset_at: OffsetDateTime,
    pub paid_upload_credits: u32,
    pub payment_customer_ref: Option<String>,
    pub payment_subscription_ref: Option<String>,
    /// Gateway timestamp of the newest membership change applied
    #[serde(with = "time::serde::rfc3339::option")]
    pub membership_synced_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Membership state asserted by a webhook or a manual tier change
#[derive(Debug, Clone)]
pub struct MembershipGrant {
    pub user_id: Uuid,
    pub tier: MembershipTier,
    /// End of the paid period. `None` keeps the current expiry when the
    /// tier is unchanged, otherwise one quota period from now.
    pub period_end: Option<OffsetDateTime>,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    /// When the gateway produced the fact (event `created`), or now for
    /// manual actions
    pub observed_at: OffsetDateTime,
}

/// What applying a grant did to the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum MembershipChange {
    /// Paid tier granted to a VIEWER
    Activated { previous_tier: MembershipTier },
    /// Paid tier switched to another paid tier
    TierChanged { previous_tier: MembershipTier },
    /// Same tier, period end moved forward
    Renewed,
    /// Identical replay; only bookkeeping fields touched
    Unchanged,
    /// Older than the last applied membership change; nothing written
    Stale,
}

impl MembershipChange {
    /// Whether this change warrants a `membership_activated` notification
    pub fn is_activation(&self) -> bool {
        matches!(self, Self::Activated { .. } | Self::TierChanged { .. })
    }
}

/// What a downgrade request did to the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DowngradeOutcome {
    Downgraded { previous_tier: MembershipTier },
    /// Already VIEWER; nothing but the timestamp changed
    AlreadyViewer,
    /// The request names a subscription the user no longer holds
    SubscriptionMismatch,
    /// Older than the last applied membership change
    Stale,
}

impl UserEntitlement {
    /// A fresh VIEWER record with its first quota period starting now
    pub fn new_viewer(user_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            membership_tier: MembershipTier::Viewer,
            membership_expires_at: None,
            free_uploads_used: 0,
            free_uploads_reset_at: now + quota_period(),
            paid_upload_credits: 0,
            payment_customer_ref: None,
            payment_subscription_ref: None,
            membership_synced_at: None,
            updated_at: now,
        }
    }

    /// Free uploads actually used in the period containing `now`.
    ///
    /// A period boundary that has already passed counts as a reset even
    /// before the record is rewritten.
    pub fn effective_free_uploads_used(&self, now: OffsetDateTime) -> u32 {
        if now > self.free_uploads_reset_at {
            0
        } else {
            self.free_uploads_used
        }
    }

    /// Reset the counter if `now` has crossed the period boundary.
    ///
    /// The boundary rolls forward in whole periods until it lies in the
    /// future, so any number of elapsed periods produces a single reset.
    pub fn roll_quota_period(&mut self, now: OffsetDateTime) -> bool {
        if now <= self.free_uploads_reset_at {
            return false;
        }

        let period = quota_period();
        let elapsed = now - self.free_uploads_reset_at;
        let periods = elapsed.whole_seconds() / period.whole_seconds() + 1;
        self.free_uploads_used = 0;
        self.free_uploads_reset_at = self
            .free_uploads_reset_at
            .checked_add(Duration::seconds(
                period.whole_seconds().saturating_mul(periods),
            ))
            .unwrap_or(now + period);
        self.updated_at = now;
        true
    }

    fn reset_quota(&mut self, next_reset_at: OffsetDateTime) {
        self.free_uploads_used = 0;
        self.free_uploads_reset_at = next_reset_at;
    }

    fn is_stale(&self, observed_at: OffsetDateTime) -> bool {
        self.membership_synced_at
            .is_some_and(|synced| observed_at < synced)
    }

    /// Apply a membership grant (activation, renewal or tier change).
    ///
    /// Replaying the same grant is a no-op apart from `updated_at`.
    pub fn apply_membership(
        &mut self,
        grant: &MembershipGrant,
        now: OffsetDateTime,
    ) -> MembershipChange {
        if self.is_stale(grant.observed_at) {
            return MembershipChange::Stale;
        }

        let previous_tier = self.membership_tier;
        let tier_changed = previous_tier != grant.tier;

        let new_expiry = match grant.period_end {
            Some(end) => end,
            None => match self.membership_expires_at {
                Some(current) if !tier_changed && current > now => current,
                _ => now + quota_period(),
            },
        };
        let period_advanced = self
            .membership_expires_at
            .is_some_and(|current| new_expiry > current);

        let change = if tier_changed {
            if previous_tier == MembershipTier::Viewer {
                MembershipChange::Activated { previous_tier }
            } else {
                MembershipChange::TierChanged { previous_tier }
            }
        } else if period_advanced {
            MembershipChange::Renewed
        } else {
            MembershipChange::Unchanged
        };

        if tier_changed || period_advanced {
            self.reset_quota(new_expiry);
        }

        self.membership_tier = grant.tier;
        self.membership_expires_at = Some(new_expiry);
        if let Some(customer_ref) = &grant.customer_ref {
            self.payment_customer_ref = Some(customer_ref.clone());
        }
        if let Some(subscription_ref) = &grant.subscription_ref {
            self.payment_subscription_ref = Some(subscription_ref.clone());
        }
        self.membership_synced_at = Some(grant.observed_at);
        self.updated_at = now;

        change
    }

    /// Drop the user to VIEWER, clearing subscription ref and expiry.
    ///
    /// When `subscription_ref` is given the downgrade only applies if it is
    /// the subscription currently on record, so a late cancellation of an
    /// old subscription cannot revoke a newer one.
    pub fn downgrade_to_viewer(
        &mut self,
        subscription_ref: Option<&str>,
        observed_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> DowngradeOutcome {
        if self.is_stale(observed_at) {
            return DowngradeOutcome::Stale;
        }

        if let (Some(requested), Some(current)) =
            (subscription_ref, self.payment_subscription_ref.as_deref())
        {
            if requested != current {
                return DowngradeOutcome::SubscriptionMismatch;
            }
        }

        self.updated_at = now;

        if self.membership_tier == MembershipTier::Viewer {
            self.payment_subscription_ref = None;
            self.membership_expires_at = None;
            return DowngradeOutcome::AlreadyViewer;
        }

        let previous_tier = self.membership_tier;
        self.membership_tier = MembershipTier::Viewer;
        self.membership_expires_at = None;
        self.payment_subscription_ref = None;
        self.membership_synced_at = Some(observed_at);
        self.reset_quota(now + quota_period());

        DowngradeOutcome::Downgraded { previous_tier }
    }

    /// Apply the side effect of a confirmed upload.
    ///
    /// FREE bumps the counter (except on unlimited plans), PAID_CREDIT spends
    /// a credit. PAID_CHARGE and BLOCKED change nothing here.
    pub fn record_upload(&mut self, cost_type: CostType, now: OffsetDateTime) {
        match cost_type {
            CostType::Free => {
                if self.membership_tier.free_uploads().is_some() {
                    self.free_uploads_used += 1;
                }
            }
            CostType::PaidCredit => {
                self.paid_upload_credits = self.paid_upload_credits.saturating_sub(1);
            }
            CostType::PaidCharge | CostType::Blocked => return,
        }
        self.updated_at = now;
    }

    /// Add one-time upload credits
    pub fn add_credits(&mut self, credits: u32, now: OffsetDateTime) {
        self.paid_upload_credits = self.paid_upload_credits.saturating_add(credits);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn now() -> OffsetDateTime {
        datetime!(2025-03-01 12:00 UTC)
    }

    fn grant(user_id: Uuid, tier: MembershipTier, period_end: OffsetDateTime) -> MembershipGrant {
        MembershipGrant {
            user_id,
            tier,
            period_end: Some(period_end),
            customer_ref: Some("cus_123".into()),
            subscription_ref: Some("sub_123".into()),
            observed_at: now(),
        }
    }

    #[test]
    fn test_new_viewer_defaults() {
        let e = UserEntitlement::new_viewer(Uuid::new_v4(), now());
        assert_eq!(e.membership_tier, MembershipTier::Viewer);
        assert_eq!(e.free_uploads_used, 0);
        assert_eq!(e.free_uploads_reset_at, now() + Duration::days(30));
        assert!(e.membership_expires_at.is_none());
    }

    #[test]
    fn test_roll_quota_period_single_reset_after_many_periods() {
        let mut e = UserEntitlement::new_viewer(Uuid::new_v4(), now());
        e.free_uploads_used = 3;
        let later = now() + Duration::days(95);

        assert!(e.roll_quota_period(later));
        assert_eq!(e.free_uploads_used, 0);
        assert!(e.free_uploads_reset_at > later);
        assert!(e.free_uploads_reset_at - later <= Duration::days(30));

        // Second call inside the new period does nothing
        e.free_uploads_used = 1;
        assert!(!e.roll_quota_period(later + Duration::days(1)));
        assert_eq!(e.free_uploads_used, 1);
    }

    #[test]
    fn test_roll_quota_period_after_centuries_stays_period_aligned() {
        let mut e = UserEntitlement::new_viewer(Uuid::new_v4(), now());
        let start = e.free_uploads_reset_at;
        let much_later = datetime!(2525-01-01 00:00 UTC);

        assert!(e.roll_quota_period(much_later));
        assert!(e.free_uploads_reset_at > much_later);
        assert!(e.free_uploads_reset_at - much_later <= quota_period());
        let offset = (e.free_uploads_reset_at - start).whole_seconds();
        assert_eq!(offset % quota_period().whole_seconds(), 0);
    }

    #[test]
    fn test_roll_quota_period_at_exact_boundary_does_not_reset() {
        let mut e = UserEntitlement::new_viewer(Uuid::new_v4(), now());
        e.free_uploads_used = 2;
        let boundary = e.free_uploads_reset_at;
        assert!(!e.roll_quota_period(boundary));
        assert_eq!(e.effective_free_uploads_used(boundary), 2);
        assert_eq!(e.effective_free_uploads_used(boundary + Duration::seconds(1)), 0);
    }

    #[test]
    fn test_activation_resets_quota_and_sets_refs() {
        let user_id = Uuid::new_v4();
        let mut e = UserEntitlement::new_viewer(user_id, now());
        e.free_uploads_used = 0;
        let end = now() + Duration::days(30);

        let change = e.apply_membership(&grant(user_id, MembershipTier::Basic, end), now());
        assert_eq!(
            change,
            MembershipChange::Activated {
                previous_tier: MembershipTier::Viewer
            }
        );
        assert_eq!(e.membership_tier, MembershipTier::Basic);
        assert_eq!(e.membership_expires_at, Some(end));
        assert_eq!(e.free_uploads_reset_at, end);
        assert_eq!(e.payment_subscription_ref.as_deref(), Some("sub_123"));
    }

    #[test]
    fn test_identical_replay_does_not_reset_quota() {
        let user_id = Uuid::new_v4();
        let mut e = UserEntitlement::new_viewer(user_id, now());
        let end = now() + Duration::days(30);
        let g = grant(user_id, MembershipTier::Basic, end);

        e.apply_membership(&g, now());
        e.free_uploads_used = 4;

        let change = e.apply_membership(&g, now() + Duration::minutes(5));
        assert_eq!(change, MembershipChange::Unchanged);
        assert_eq!(e.free_uploads_used, 4);
    }

    #[test]
    fn test_renewal_resets_quota_once() {
        let user_id = Uuid::new_v4();
        let mut e = UserEntitlement::new_viewer(user_id, now());
        let first_end = now() + Duration::days(30);
        e.apply_membership(&grant(user_id, MembershipTier::Basic, first_end), now());
        e.free_uploads_used = 5;

        let second_end = first_end + Duration::days(30);
        let mut renewal = grant(user_id, MembershipTier::Basic, second_end);
        renewal.observed_at = first_end;

        assert_eq!(e.apply_membership(&renewal, first_end), MembershipChange::Renewed);
        assert_eq!(e.free_uploads_used, 0);
        assert_eq!(e.free_uploads_reset_at, second_end);

        e.free_uploads_used = 2;
        assert_eq!(e.apply_membership(&renewal, first_end), MembershipChange::Unchanged);
        assert_eq!(e.free_uploads_used, 2);
    }

    #[test]
    fn test_out_of_order_event_is_stale() {
        let user_id = Uuid::new_v4();
        let mut e = UserEntitlement::new_viewer(user_id, now());
        let mut newer = grant(user_id, MembershipTier::Premium, now() + Duration::days(30));
        newer.observed_at = now() + Duration::hours(1);
        e.apply_membership(&newer, now());

        let older = grant(user_id, MembershipTier::Basic, now() + Duration::days(30));
        assert_eq!(e.apply_membership(&older, now()), MembershipChange::Stale);
        assert_eq!(e.membership_tier, MembershipTier::Premium);
    }

    #[test]
    fn test_grant_without_period_end_keeps_current_expiry() {
        let user_id = Uuid::new_v4();
        let mut e = UserEntitlement::new_viewer(user_id, now());
        let end = now() + Duration::days(28);
        e.apply_membership(&grant(user_id, MembershipTier::Basic, end), now());

        let mut g = grant(user_id, MembershipTier::Basic, end);
        g.period_end = None;
        assert_eq!(e.apply_membership(&g, now()), MembershipChange::Unchanged);
        assert_eq!(e.membership_expires_at, Some(end));
    }

    #[test]
    fn test_downgrade_is_idempotent() {
        let user_id = Uuid::new_v4();
        let mut e = UserEntitlement::new_viewer(user_id, now());
        e.apply_membership(
            &grant(user_id, MembershipTier::Premium, now() + Duration::days(30)),
            now(),
        );

        let first = e.downgrade_to_viewer(None, now(), now());
        assert_eq!(
            first,
            DowngradeOutcome::Downgraded {
                previous_tier: MembershipTier::Premium
            }
        );
        assert_eq!(e.membership_tier, MembershipTier::Viewer);
        assert!(e.payment_subscription_ref.is_none());
        assert!(e.membership_expires_at.is_none());
        // Customer ref survives so a later checkout reuses it
        assert_eq!(e.payment_customer_ref.as_deref(), Some("cus_123"));

        let second = e.downgrade_to_viewer(None, now(), now());
        assert_eq!(second, DowngradeOutcome::AlreadyViewer);
    }

    #[test]
    fn test_downgrade_for_other_subscription_is_ignored() {
        let user_id = Uuid::new_v4();
        let mut e = UserEntitlement::new_viewer(user_id, now());
        e.apply_membership(
            &grant(user_id, MembershipTier::Basic, now() + Duration::days(30)),
            now(),
        );

        let outcome = e.downgrade_to_viewer(Some("sub_old"), now(), now());
        assert_eq!(outcome, DowngradeOutcome::SubscriptionMismatch);
        assert_eq!(e.membership_tier, MembershipTier::Basic);
    }

    #[test]
    fn test_record_upload_side_effects() {
        let mut e = UserEntitlement::new_viewer(Uuid::new_v4(), now());
        e.membership_tier = MembershipTier::Basic;
        e.paid_upload_credits = 1;

        e.record_upload(CostType::Free, now());
        assert_eq!(e.free_uploads_used, 1);

        e.record_upload(CostType::PaidCredit, now());
        assert_eq!(e.paid_upload_credits, 0);

        e.record_upload(CostType::PaidCharge, now());
        e.record_upload(CostType::Blocked, now());
        assert_eq!(e.free_uploads_used, 1);
        assert_eq!(e.paid_upload_credits, 0);
    }

    #[test]
    fn test_premium_free_upload_does_not_count() {
        let mut e = UserEntitlement::new_viewer(Uuid::new_v4(), now());
        e.membership_tier = MembershipTier::Premium;
        e.record_upload(CostType::Free, now());
        assert_eq!(e.free_uploads_used, 0);
    }
}
