//! Admin routes
//!
//! Protected by the `admin` role check. Webhook ledger inspection and replay,
//! plus ledger invariant checks.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use mediamart_billing::{
    EventStatus, InvariantCheckSummary, WebhookEventRecord, WebhookReplayResult,
};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayFailedQuery {
    pub max: Option<i64>,
}

/// GET /admin/webhooks
pub async fn list_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<EventStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let events = state.billing.webhooks.list_events(status, limit).await?;
    Ok(Json(events))
}

/// POST /admin/webhooks/{event_id}/replay
pub async fn replay_webhook_event(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    tracing::info!(
        admin_id = %auth_user.user_id,
        event_id = %event_id,
        "Admin webhook replay requested"
    );
    let result = state
        .billing
        .webhooks
        .replay_event(&event_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(result))
}

/// POST /admin/webhooks/replay-failed
pub async fn replay_failed_webhooks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ReplayFailedQuery>,
) -> ApiResult<Json<Vec<WebhookReplayResult>>> {
    tracing::info!(
        admin_id = %auth_user.user_id,
        max = ?query.max,
        "Admin bulk webhook replay requested"
    );
    let results = state
        .billing
        .webhooks
        .replay_all_failed(query.max, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(results))
}

/// GET /admin/invariants
pub async fn run_invariant_checks(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants().run_all_checks().await?;
    Ok(Json(summary))
}
