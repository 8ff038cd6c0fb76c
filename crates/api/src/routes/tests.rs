//! Router tests against an in-memory ledger and recording fakes

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use mediamart_billing::signature::signature_header;
use mediamart_billing::testing::{FakeGateway, RecordingAssetStore, RecordingDispatcher};
use mediamart_billing::{
    BillingService, DispatchMode, InMemoryLedgerStore, LedgerStore, MediaAsset, MembershipGrant,
    PriceIds, UserEntitlement,
};
use mediamart_shared::MembershipTier;
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::{auth::JwtManager, config::Config, state::AppState};

const JWT_SECRET: &str = "router-test-jwt-secret";
const CRON_SECRET: &str = "router-test-cron-secret";
const WEBHOOK_SECRET: &str = "whsec_router";

struct TestApp {
    router: Router,
    store: Arc<InMemoryLedgerStore>,
    gateway: Arc<FakeGateway>,
}

fn test_app() -> TestApp {
    let store = Arc::new(InMemoryLedgerStore::new());
    let gateway = Arc::new(FakeGateway::new());
    let billing = BillingService::new(
        store.clone(),
        gateway.clone(),
        Arc::new(RecordingDispatcher::new()),
        Arc::new(RecordingAssetStore::new()),
        WEBHOOK_SECRET,
        PriceIds {
            basic: Some("price_basic".into()),
            advanced: Some("price_advanced".into()),
            premium: Some("price_premium".into()),
        },
        DispatchMode::Inline,
    );
    let state = AppState::with_billing(Config::for_tests(JWT_SECRET, CRON_SECRET), billing);
    TestApp {
        router: create_router(state),
        store,
        gateway,
    }
}

fn bearer(user_id: Uuid, role: &str) -> String {
    let token = JwtManager::new(JWT_SECRET)
        .issue_token(user_id, role, Duration::hours(1))
        .unwrap();
    format!("Bearer {}", token)
}

async fn send(
    app: &TestApp,
    method: Method,
    path: &str,
    auth: Option<String>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn make_basic(store: &InMemoryLedgerStore, user_id: Uuid) {
    let now = OffsetDateTime::now_utc();
    let grant = MembershipGrant {
        user_id,
        tier: MembershipTier::Basic,
        period_end: Some(now + Duration::days(30)),
        customer_ref: Some("cus_route".into()),
        subscription_ref: Some("sub_route".into()),
        observed_at: now - Duration::days(1),
    };
    store.apply_membership(&grant, now).await.unwrap();
}

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_quota_requires_auth() {
    let app = test_app();
    let (status, body) = send(&app, Method::GET, "/api/v1/quota", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn test_quota_for_new_user_is_viewer() {
    let app = test_app();
    let user_id = Uuid::new_v4();
    let (status, body) = send(
        &app,
        Method::GET,
        "/api/v1/quota",
        Some(bearer(user_id, "user")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "VIEWER");
    assert_eq!(body["can_upload"], false);
    assert_eq!(body["status_type"], "BLOCKED");
}

#[tokio::test]
async fn test_blocked_upload_is_payment_required() {
    let app = test_app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/uploads",
        Some(bearer(Uuid::new_v4(), "user")),
        Some(json!({ "title": "Sunset", "storage_key": "u/s.jpg", "price_cents": 300 })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "upload_blocked");
    assert_eq!(body["evaluation"]["cost_type"], "BLOCKED");
}

#[tokio::test]
async fn test_basic_upload_publishes_then_charges() {
    let app = test_app();
    let user_id = Uuid::new_v4();
    make_basic(&app.store, user_id).await;
    let upload = json!({ "title": "Harbor", "storage_key": "u/h.jpg", "price_cents": 500 });

    for _ in 0..5 {
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/uploads",
            Some(bearer(user_id, "user")),
            Some(upload.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "published");
    }

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/uploads",
        Some(bearer(user_id, "user")),
        Some(upload),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "payment_required");
    assert_eq!(body["evaluation"]["amount_due_cents"], 100);
    assert!(body["session"]["url"].is_string());
}

#[tokio::test]
async fn test_tier_change_without_subscription_conflicts() {
    let app = test_app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/membership/tier",
        Some(bearer(Uuid::new_v4(), "user")),
        Some(json!({ "tier": "premium" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "subscription_required");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/membership/tier",
        Some(bearer(Uuid::new_v4(), "user")),
        Some(json!({ "tier": "platinum" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_twice() {
    let app = test_app();
    let user_id = Uuid::new_v4();
    make_basic(&app.store, user_id).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/membership/cancel",
        Some(bearer(user_id, "user")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "downgraded");

    let (_, body) = send(
        &app,
        Method::POST,
        "/api/v1/membership/cancel",
        Some(bearer(user_id, "user")),
        None,
    )
    .await;
    assert_eq!(body["outcome"], "already_viewer");
    assert_eq!(app.gateway.cancelled().await, vec!["sub_route".to_string()]);
}

#[tokio::test]
async fn test_purchase_unknown_media_is_not_found() {
    let app = test_app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/purchases",
        Some(bearer(Uuid::new_v4(), "user")),
        Some(json!({ "media_id": Uuid::new_v4() })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_purchase_returns_checkout_url() {
    let app = test_app();
    let media = MediaAsset {
        id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        title: "Pier".into(),
        storage_key: "m/pier.jpg".into(),
        price_cents: 700,
        is_sold: false,
        published_at: OffsetDateTime::now_utc(),
        deleted_at: None,
    };
    app.store.insert_media(&media).await.unwrap();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/purchases",
        Some(bearer(Uuid::new_v4(), "user")),
        Some(json!({ "media_id": media.id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["amount_cents"], 700);
    assert_eq!(body["session_id"], "cs_test_1");
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let app = test_app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/payments")
        .header("Stripe-Signature", "t=1,v1=deadbeef")
        .body(Body::from(r#"{"id":"evt_x"}"#))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.store.get_event("evt_x").await.unwrap().is_none());

    let unsigned = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/payments")
        .body(Body::from(r#"{"id":"evt_y"}"#))
        .unwrap();
    let response = app.router.clone().oneshot(unsigned).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_grants_credits_once() {
    let app = test_app();
    let user_id = Uuid::new_v4();
    let body = json!({
        "id": "evt_credits",
        "type": "checkout.session.completed",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": { "object": {
            "id": "cs_credits",
            "payment_status": "paid",
            "metadata": {
                "checkout_type": "upload_credits",
                "user_id": user_id.to_string(),
                "credits": "3"
            }
        }}
    })
    .to_string();

    for expected in ["applied", "duplicate"] {
        let header =
            signature_header(body.as_bytes(), OffsetDateTime::now_utc().unix_timestamp(), WEBHOOK_SECRET)
                .unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/payments")
            .header("Stripe-Signature", header)
            .body(Body::from(body.clone()))
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["result"]["outcome"], expected);
    }

    let e: UserEntitlement = app.store.get_entitlement(user_id).await.unwrap().unwrap();
    assert_eq!(e.paid_upload_credits, 3);
}

#[tokio::test]
async fn test_sweep_runs_with_or_without_secret() {
    let app = test_app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/internal/expiration-sweep",
        Some(format!("Bearer {}", CRON_SECRET)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["expired"], 0);

    let (status, _) = send(&app, Method::POST, "/internal/expiration-sweep", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = test_app();
    let (status, _) = send(
        &app,
        Method::GET,
        "/admin/invariants",
        Some(bearer(Uuid::new_v4(), "user")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        Method::GET,
        "/admin/invariants",
        Some(bearer(Uuid::new_v4(), "admin")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
}

#[tokio::test]
async fn test_admin_replay_unknown_event_is_not_found() {
    let app = test_app();
    let (status, _) = send(
        &app,
        Method::POST,
        "/admin/webhooks/evt_missing/replay",
        Some(bearer(Uuid::new_v4(), "admin")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::GET,
        "/admin/webhooks?status=error",
        Some(bearer(Uuid::new_v4(), "admin")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}
