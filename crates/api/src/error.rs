//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mediamart_billing::{BillingError, QuotaEvaluation};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Upload blocked on the current plan
    #[error("Upload not available on current plan")]
    QuotaBlocked(QuotaEvaluation),

    #[error("Subscription required: {0}")]
    SubscriptionRequired(String),

    #[error("Payment provider unavailable")]
    Gateway(String),

    #[error("Database error")]
    Database(String),

    #[error("Internal error")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidSignature => ApiError::InvalidSignature,
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::InvalidInput(msg) | BillingError::InvalidTier(msg) => {
                ApiError::Validation(msg)
            }
            BillingError::SubscriptionRequired(msg) => ApiError::SubscriptionRequired(msg),
            BillingError::Gateway(msg) => ApiError::Gateway(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) | BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Authentication required".to_string(),
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "Insufficient permissions".to_string(),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg.clone()),
            ApiError::InvalidSignature => (
                StatusCode::BAD_REQUEST,
                "invalid_signature",
                "Webhook signature verification failed".to_string(),
            ),
            ApiError::QuotaBlocked(_) => (
                StatusCode::PAYMENT_REQUIRED,
                "upload_blocked",
                "Upgrade your membership or buy upload credits to publish".to_string(),
            ),
            ApiError::SubscriptionRequired(msg) => {
                (StatusCode::CONFLICT, "subscription_required", msg.clone())
            }
            ApiError::Gateway(detail) => {
                tracing::error!(error = %detail, "Payment gateway call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "gateway_error",
                    "Payment provider unavailable, try again".to_string(),
                )
            }
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "error": error,
            "message": message,
        });
        if let ApiError::QuotaBlocked(evaluation) = &self {
            body["evaluation"] = json!(evaluation);
        }

        (status, Json(body)).into_response()
    }
}
