//! Ledger Invariants Module
//!
//! Runnable consistency checks over the ledger. They can be run after any
//! webhook replay or manual repair to confirm the ledger is still coherent.
//!
//! ## Design Principles
//!
//! 1. **Backend-agnostic**: checks read through [`LedgerStore`], so the
//!    in-memory and Postgres ledgers are held to the same rules
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mediamart_shared::{MembershipTier, PurchaseStatus};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::entitlement::UserEntitlement;
use crate::error::BillingResult;
use crate::purchases::{PurchaseRecord, DELETE_AFTER_DAYS, REMINDER_THRESHOLDS};
use crate::store::LedgerStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Purchase involved, when the check is per purchase
    pub purchase_id: Option<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Buyer access or billing is wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS: [&str; 7] = [
    "completed_has_deadline",
    "deadline_matches_completion",
    "incomplete_has_no_expiry",
    "reminder_thresholds_valid",
    "media_sold_once",
    "free_uploads_within_allowance",
    "viewer_has_no_subscription",
];

fn purchase_violation(
    invariant: &str,
    purchase: &PurchaseRecord,
    description: String,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        user_ids: vec![purchase.buyer_id],
        purchase_id: Some(purchase.id),
        description,
        context: serde_json::json!({
            "status": purchase.status.as_str(),
            "completed_at": purchase.completed_at,
            "delete_after": purchase.delete_after,
            "reminders_sent": purchase.reminders_sent,
            "asset_deleted_at": purchase.asset_deleted_at,
        }),
        severity,
    }
}

fn entitlement_violation(
    invariant: &str,
    entitlement: &UserEntitlement,
    description: String,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        user_ids: vec![entitlement.user_id],
        purchase_id: None,
        description,
        context: serde_json::json!({
            "membership_tier": entitlement.membership_tier.as_str(),
            "free_uploads_used": entitlement.free_uploads_used,
            "paid_upload_credits": entitlement.paid_upload_credits,
            "payment_subscription_ref": entitlement.payment_subscription_ref,
        }),
        severity,
    }
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    store: Arc<dyn LedgerStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let purchases = self.store.list_purchases().await?;
        let entitlements = self.store.list_entitlements().await?;

        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(Self::evaluate(name, &purchases, &entitlements));
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed = checks_failed,
                "Ledger invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        if !CHECKS.contains(&name) {
            return Ok(vec![]);
        }
        let purchases = self.store.list_purchases().await?;
        let entitlements = self.store.list_entitlements().await?;
        Ok(Self::evaluate(name, &purchases, &entitlements))
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    fn evaluate(
        name: &str,
        purchases: &[PurchaseRecord],
        entitlements: &[UserEntitlement],
    ) -> Vec<InvariantViolation> {
        match name {
            "completed_has_deadline" => check_completed_has_deadline(purchases),
            "deadline_matches_completion" => check_deadline_matches_completion(purchases),
            "incomplete_has_no_expiry" => check_incomplete_has_no_expiry(purchases),
            "reminder_thresholds_valid" => check_reminder_thresholds(purchases),
            "media_sold_once" => check_media_sold_once(purchases),
            "free_uploads_within_allowance" => check_free_uploads_within_allowance(entitlements),
            "viewer_has_no_subscription" => check_viewer_has_no_subscription(entitlements),
            _ => vec![],
        }
    }
}

/// Invariant 1: every completed purchase has a deletion deadline
///
/// Without one the asset is never swept and the buyer keeps access forever.
fn check_completed_has_deadline(purchases: &[PurchaseRecord]) -> Vec<InvariantViolation> {
    purchases
        .iter()
        .filter(|p| {
            p.status == PurchaseStatus::Completed
                && (p.completed_at.is_none() || p.delete_after.is_none())
        })
        .map(|p| {
            purchase_violation(
                "completed_has_deadline",
                p,
                "Completed purchase is missing completed_at or delete_after".to_string(),
                ViolationSeverity::Critical,
            )
        })
        .collect()
}

/// Invariant 2: deadline is exactly ten days after completion
fn check_deadline_matches_completion(purchases: &[PurchaseRecord]) -> Vec<InvariantViolation> {
    let window = Duration::days(DELETE_AFTER_DAYS);
    purchases
        .iter()
        .filter_map(|p| match (p.status, p.completed_at, p.delete_after) {
            (PurchaseStatus::Completed, Some(completed), Some(deadline))
                if deadline != completed + window =>
            {
                Some(purchase_violation(
                    "deadline_matches_completion",
                    p,
                    format!(
                        "delete_after is {} from completion, expected {} days",
                        deadline - completed,
                        DELETE_AFTER_DAYS
                    ),
                    ViolationSeverity::High,
                ))
            }
            _ => None,
        })
        .collect()
}

/// Invariant 3: only completed purchases carry expiration state
fn check_incomplete_has_no_expiry(purchases: &[PurchaseRecord]) -> Vec<InvariantViolation> {
    purchases
        .iter()
        .filter(|p| {
            p.status != PurchaseStatus::Completed
                && (p.completed_at.is_some()
                    || p.delete_after.is_some()
                    || !p.reminders_sent.is_empty()
                    || p.asset_deleted_at.is_some())
        })
        .map(|p| {
            purchase_violation(
                "incomplete_has_no_expiry",
                p,
                format!("{} purchase carries expiration fields", p.status),
                ViolationSeverity::High,
            )
        })
        .collect()
}

/// Invariant 4: reminders are only ever recorded at 7, 3 and 1 days
fn check_reminder_thresholds(purchases: &[PurchaseRecord]) -> Vec<InvariantViolation> {
    purchases
        .iter()
        .filter(|p| {
            p.reminders_sent
                .iter()
                .any(|t| !REMINDER_THRESHOLDS.contains(t))
        })
        .map(|p| {
            purchase_violation(
                "reminder_thresholds_valid",
                p,
                format!("Unexpected reminder thresholds {:?}", p.reminders_sent),
                ViolationSeverity::Medium,
            )
        })
        .collect()
}

/// Invariant 7: a media asset has at most one completed purchase
///
/// A second completed sale shares the first buyer's asset and loses it on
/// the first buyer's deadline.
fn check_media_sold_once(purchases: &[PurchaseRecord]) -> Vec<InvariantViolation> {
    let mut by_media: HashMap<Uuid, Vec<&PurchaseRecord>> = HashMap::new();
    for purchase in purchases
        .iter()
        .filter(|p| p.status == PurchaseStatus::Completed)
    {
        by_media.entry(purchase.media_id).or_default().push(purchase);
    }

    by_media
        .into_values()
        .filter(|sales| sales.len() > 1)
        .flat_map(|sales| {
            let count = sales.len();
            sales.into_iter().map(move |p| {
                purchase_violation(
                    "media_sold_once",
                    p,
                    format!("Media {} has {} completed purchases", p.media_id, count),
                    ViolationSeverity::Critical,
                )
            })
        })
        .collect()
}

/// Invariant 5: free uploads used never exceed the tier allowance
fn check_free_uploads_within_allowance(entitlements: &[UserEntitlement]) -> Vec<InvariantViolation> {
    entitlements
        .iter()
        .filter_map(|e| {
            let allowance = e.membership_tier.free_uploads()?;
            (e.free_uploads_used > allowance).then(|| {
                entitlement_violation(
                    "free_uploads_within_allowance",
                    e,
                    format!(
                        "{} used {} free uploads, allowance is {}",
                        e.membership_tier, e.free_uploads_used, allowance
                    ),
                    ViolationSeverity::High,
                )
            })
        })
        .collect()
}

/// Invariant 6: a VIEWER holds no subscription reference
///
/// A leftover reference would let a stale cancellation match a later
/// subscription.
fn check_viewer_has_no_subscription(entitlements: &[UserEntitlement]) -> Vec<InvariantViolation> {
    entitlements
        .iter()
        .filter(|e| {
            e.membership_tier == MembershipTier::Viewer && e.payment_subscription_ref.is_some()
        })
        .map(|e| {
            entitlement_violation(
                "viewer_has_no_subscription",
                e,
                "Viewer still holds a subscription reference".to_string(),
                ViolationSeverity::Medium,
            )
        })
        .collect()
}
