//! Common types used across MediaMart

use serde::{Deserialize, Serialize};

/// Length of a free-upload quota period, in days.
pub const QUOTA_PERIOD_DAYS: i64 = 30;

// =============================================================================
// Enums
// =============================================================================

/// Membership tier held by a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MembershipTier {
    #[default]
    Viewer,
    Basic,
    Advanced,
    Premium,
}

impl MembershipTier {
    /// Free uploads included per quota period.
    /// `None` means unlimited (Premium).
    pub fn free_uploads(&self) -> Option<u32> {
        match self {
            Self::Viewer => Some(0),
            Self::Basic => Some(5),
            Self::Advanced => Some(20),
            Self::Premium => None,
        }
    }

    /// Price of a single upload once the free allowance is used up.
    /// `None` for tiers without a paid path (Viewer) or without a charge (Premium).
    pub fn per_upload_cost_cents(&self) -> Option<i64> {
        match self {
            Self::Viewer => None,
            Self::Basic => Some(100),
            Self::Advanced => Some(50),
            Self::Premium => None,
        }
    }

    /// Whether this tier is backed by a paid subscription
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Viewer)
    }

    /// Ordering used to tell upgrades from downgrades
    pub fn rank(&self) -> u8 {
        match self {
            Self::Viewer => 0,
            Self::Basic => 1,
            Self::Advanced => 2,
            Self::Premium => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Basic => "basic",
            Self::Advanced => "advanced",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for MembershipTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MembershipTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "viewer" | "free" => Ok(Self::Viewer),
            "basic" => Ok(Self::Basic),
            "advanced" => Ok(Self::Advanced),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Invalid membership tier: {}", s)),
        }
    }
}

/// How an upload is paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CostType {
    /// Covered by the plan's free allowance (or unlimited plan)
    Free,
    /// Consumes one pre-purchased upload credit
    PaidCredit,
    /// Requires an external payment before publishing
    PaidCharge,
    /// No path to upload on the current plan
    Blocked,
}

impl CostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::PaidCredit => "PAID_CREDIT",
            Self::PaidCharge => "PAID_CHARGE",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for CostType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Purchase lifecycle status. PENDING moves to COMPLETED or FAILED, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PurchaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid purchase status: {}", s)),
        }
    }
}

/// Convert integer cents into the decimal amount shown to users
pub fn cents_to_display(cents: i64) -> f64 {
    cents as f64 / 100.0
}
