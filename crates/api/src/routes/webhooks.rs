//! Payment gateway webhook endpoint

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use mediamart_billing::BillingError;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Receive a signed gateway event.
///
/// The raw body is verified before parsing. Outcomes that need no retry
/// (including stale replays and anomalies) are acknowledged with 200; only
/// transient failures return 5xx so the gateway redelivers.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
    else {
        tracing::warn!("Webhook received without signature header");
        return Err(ApiError::InvalidSignature);
    };

    match state.billing.webhooks.handle(&body, signature).await {
        Ok(outcome) => Ok(Json(json!({
            "received": true,
            "result": outcome,
        }))),
        Err(BillingError::InvalidSignature) => {
            tracing::warn!(body_len = body.len(), "Webhook signature rejected");
            Err(ApiError::InvalidSignature)
        }
        Err(e) => {
            tracing::error!(error = %e, "Webhook processing failed; gateway will retry");
            Err(e.into())
        }
    }
}
