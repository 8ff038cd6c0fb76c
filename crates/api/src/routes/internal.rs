//! Internal trigger endpoints called by the scheduler

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use mediamart_billing::SweepReport;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::{error::ApiResult, state::AppState};

fn cron_secret_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| bool::from(presented.as_bytes().ct_eq(expected.as_bytes())))
}

/// POST /internal/expiration-sweep
///
/// A wrong or missing cron secret is logged but does not stop the sweep.
pub async fn expiration_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SweepReport>> {
    if !cron_secret_matches(&headers, &state.config.cron_secret) {
        tracing::warn!(
            has_authorization = headers.contains_key(AUTHORIZATION),
            "Expiration sweep triggered without a valid cron secret"
        );
    }

    let report = state
        .billing
        .expiration
        .sweep(OffsetDateTime::now_utc())
        .await?;
    Ok(Json(report))
}
