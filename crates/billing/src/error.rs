//! Billing error types

use thiserror::Error;

/// Result type for billing and ledger operations
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors surfaced by the billing core.
///
/// Outcomes that are not failures (stale replays, blocked uploads, failed
/// notification delivery) are modelled as values, not as variants here.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Subscription required: {0}")]
    SubscriptionRequired(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Gateway(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

impl BillingError {
    /// Whether the gateway may profitably redeliver the event that caused this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::Gateway(_) | BillingError::Internal(_)
        )
    }
}
