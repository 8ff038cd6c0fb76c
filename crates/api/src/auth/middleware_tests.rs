//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Bearer token extraction (missing, malformed, valid)
//! - Role-based access control for admin routes

#[cfg(test)]
mod tests {
    use super::super::jwt::JwtManager;
    use super::super::middleware::*;
    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware::{from_fn, from_fn_with_state},
        routing::get,
        Extension, Router,
    };
    use time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    fn app() -> Router {
        let auth_state = AuthState {
            jwt_manager: JwtManager::new(SECRET),
        };
        let admin = Router::new()
            .route("/admin/ping", get(|| async { "admin" }))
            .layer(from_fn(require_admin));
        Router::new()
            .route(
                "/me",
                get(|Extension(user): Extension<AuthUser>| async move { user.user_id.to_string() }),
            )
            .merge(admin)
            .layer(from_fn_with_state(auth_state, require_auth))
    }

    fn token(role: &str) -> (Uuid, String) {
        let user_id = Uuid::new_v4();
        let token = JwtManager::new(SECRET)
            .issue_token(user_id, role, Duration::hours(1))
            .unwrap();
        (user_id, token)
    }

    async fn get_with(path: &str, auth: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder().uri(path);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        let response = app()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let (status, body) = get_with("/me", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Authentication required"));
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_rejected() {
        let (status, body) = get_with("/me", Some("Basic dXNlcjpwYXNz")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Invalid authentication format"));
    }

    #[tokio::test]
    async fn test_valid_token_sets_auth_user() {
        let (user_id, token) = token("user");
        let (status, body) = get_with("/me", Some(&format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, user_id.to_string());
    }

    #[tokio::test]
    async fn test_admin_route_requires_admin_role() {
        let (_, user_token) = token("user");
        let (status, _) = get_with("/admin/ping", Some(&format!("Bearer {}", user_token))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, admin_token) = token(ADMIN_ROLE);
        let (status, body) =
            get_with("/admin/ping", Some(&format!("Bearer {}", admin_token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "admin");
    }

    #[test]
    fn test_is_admin() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            role: "user".into(),
        };
        assert!(!user.is_admin());
        let admin = AuthUser {
            role: ADMIN_ROLE.into(),
            ..user
        };
        assert!(admin.is_admin());
    }
}
