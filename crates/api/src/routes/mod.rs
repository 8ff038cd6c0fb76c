//! API routes

pub mod admin;
pub mod billing;
pub mod internal;
pub mod webhooks;

#[cfg(test)]
mod tests;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // User routes (JWT)
    let user_routes = Router::new()
        .route("/quota", get(billing::get_quota))
        .route("/membership/cancel", post(billing::cancel_membership))
        .route("/membership/tier", post(billing::change_tier))
        .route("/membership/checkout", post(billing::subscription_checkout))
        .route("/credits/checkout", post(billing::credit_pack_checkout))
        .route("/uploads", post(billing::begin_upload))
        .route("/purchases", post(billing::begin_purchase))
        .route_layer(from_fn_with_state(auth_state.clone(), require_auth));

    // Admin routes (JWT, role=admin)
    let admin_routes = Router::new()
        .route("/webhooks", get(admin::list_webhook_events))
        .route("/webhooks/replay-failed", post(admin::replay_failed_webhooks))
        .route("/webhooks/{event_id}/replay", post(admin::replay_webhook_event))
        .route("/invariants", get(admin::run_invariant_checks))
        .route_layer(from_fn(require_admin))
        .route_layer(from_fn_with_state(auth_state, require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/payments", post(webhooks::payment_webhook))
        .route("/internal/expiration-sweep", post(internal::expiration_sweep))
        .nest("/api/v1", user_routes)
        .nest("/admin", admin_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
