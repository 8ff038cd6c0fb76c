//! Upload quota evaluation
//!
//! Pure functions over a [`UserEntitlement`]: nothing here touches the
//! ledger. The ledger re-runs [`evaluate`] under its row lock when an upload
//! is committed, so the answer shown to the user and the answer applied
//! cannot drift apart.

use mediamart_shared::{cents_to_display, CostType, MembershipTier};
use serde::Serialize;
use time::OffsetDateTime;

use crate::entitlement::UserEntitlement;

/// Outcome of a quota check. BLOCKED is a normal result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaEvaluation {
    pub allowed: bool,
    pub cost_type: CostType,
    pub amount_due_cents: i64,
}

impl QuotaEvaluation {
    fn free() -> Self {
        Self {
            allowed: true,
            cost_type: CostType::Free,
            amount_due_cents: 0,
        }
    }

    fn credit() -> Self {
        Self {
            allowed: true,
            cost_type: CostType::PaidCredit,
            amount_due_cents: 0,
        }
    }

    fn charge(amount_due_cents: i64) -> Self {
        Self {
            allowed: true,
            cost_type: CostType::PaidCharge,
            amount_due_cents,
        }
    }

    fn blocked() -> Self {
        Self {
            allowed: false,
            cost_type: CostType::Blocked,
            amount_due_cents: 0,
        }
    }

    pub fn amount_due(&self) -> f64 {
        cents_to_display(self.amount_due_cents)
    }
}

/// Free uploads left in the current period, `None` when unlimited
pub fn free_uploads_remaining(entitlement: &UserEntitlement, now: OffsetDateTime) -> Option<u32> {
    entitlement
        .membership_tier
        .free_uploads()
        .map(|allowance| allowance.saturating_sub(entitlement.effective_free_uploads_used(now)))
}

/// Decide whether an upload may proceed and how it is paid for.
///
/// Rules, first match wins: PREMIUM is always free; remaining free
/// allowance is free; a held credit is spent; VIEWER is blocked; everyone
/// else pays the plan's per-upload price.
pub fn evaluate(entitlement: &UserEntitlement, now: OffsetDateTime) -> QuotaEvaluation {
    let tier = entitlement.membership_tier;

    if tier == MembershipTier::Premium {
        return QuotaEvaluation::free();
    }

    if free_uploads_remaining(entitlement, now).is_some_and(|remaining| remaining > 0) {
        return QuotaEvaluation::free();
    }

    if entitlement.paid_upload_credits > 0 {
        return QuotaEvaluation::credit();
    }

    match tier.per_upload_cost_cents() {
        Some(cost) if tier != MembershipTier::Viewer => QuotaEvaluation::charge(cost),
        _ => QuotaEvaluation::blocked(),
    }
}

/// Read-only quota projection served to the UI
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub tier: MembershipTier,
    pub free_uploads_used: u32,
    /// `None` when unlimited
    pub free_uploads_remaining: Option<u32>,
    pub paid_upload_credits: u32,
    pub cost_per_upload_cents: Option<i64>,
    pub cost_per_upload: Option<f64>,
    pub can_upload: bool,
    pub status_type: CostType,
    #[serde(with = "time::serde::rfc3339")]
    pub free_uploads_reset_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub membership_expires_at: Option<OffsetDateTime>,
}

impl QuotaStatus {
    pub fn project(entitlement: &UserEntitlement, now: OffsetDateTime) -> Self {
        let evaluation = evaluate(entitlement, now);
        let tier = entitlement.membership_tier;
        let cost = tier.per_upload_cost_cents();

        Self {
            tier,
            free_uploads_used: entitlement.effective_free_uploads_used(now),
            free_uploads_remaining: free_uploads_remaining(entitlement, now),
            paid_upload_credits: entitlement.paid_upload_credits,
            cost_per_upload_cents: cost,
            cost_per_upload: cost.map(cents_to_display),
            can_upload: evaluation.allowed,
            status_type: evaluation.cost_type,
            free_uploads_reset_at: entitlement.free_uploads_reset_at,
            membership_expires_at: entitlement.membership_expires_at,
        }
    }
}
