//! User-facing billing routes: quota, membership, checkout and uploads

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use mediamart_billing::{
    CheckoutSessionInfo, DowngradeOutcome, NewUpload, PurchaseCheckout, QuotaStatus,
    TierChangeOutcome, UploadOutcome,
};
use mediamart_shared::MembershipTier;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct TierRequest {
    pub tier: String,
}

impl TierRequest {
    fn parse(&self) -> ApiResult<MembershipTier> {
        self.tier.parse().map_err(ApiError::Validation)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreditPackRequest {
    pub credits: u32,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub media_id: Uuid,
}

/// GET /api/v1/quota
pub async fn get_quota(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<QuotaStatus>> {
    let status = state
        .billing
        .quota_status(auth_user.user_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(status))
}

/// POST /api/v1/membership/cancel
pub async fn cancel_membership(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<DowngradeOutcome>> {
    let outcome = state
        .billing
        .memberships
        .cancel(auth_user.user_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/membership/tier
pub async fn change_tier(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<TierRequest>,
) -> ApiResult<Json<TierChangeOutcome>> {
    let tier = request.parse()?;
    let outcome = state
        .billing
        .memberships
        .change_tier(auth_user.user_id, tier, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/membership/checkout
pub async fn subscription_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<TierRequest>,
) -> ApiResult<Json<CheckoutSessionInfo>> {
    let tier = request.parse()?;
    let session = state
        .billing
        .checkout
        .begin_subscription_checkout(auth_user.user_id, tier, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(session))
}

/// POST /api/v1/credits/checkout
pub async fn credit_pack_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<CreditPackRequest>,
) -> ApiResult<Json<CheckoutSessionInfo>> {
    let session = state
        .billing
        .checkout
        .begin_credit_pack_checkout(auth_user.user_id, request.credits, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(session))
}

/// POST /api/v1/uploads
///
/// 201 when published, 202 when waiting on an upload fee, 402 when blocked.
pub async fn begin_upload(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(upload): Json<NewUpload>,
) -> ApiResult<(StatusCode, Json<UploadOutcome>)> {
    let outcome = state
        .billing
        .checkout
        .begin_upload(auth_user.user_id, upload, OffsetDateTime::now_utc())
        .await?;

    match outcome {
        UploadOutcome::Blocked { evaluation } => Err(ApiError::QuotaBlocked(evaluation)),
        UploadOutcome::Published { .. } => Ok((StatusCode::CREATED, Json(outcome))),
        UploadOutcome::PaymentRequired { .. } => Ok((StatusCode::ACCEPTED, Json(outcome))),
    }
}

/// POST /api/v1/purchases
pub async fn begin_purchase(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<PurchaseRequest>,
) -> ApiResult<Json<PurchaseCheckout>> {
    let checkout = state
        .billing
        .checkout
        .begin_media_purchase(auth_user.user_id, request.media_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(checkout))
}
