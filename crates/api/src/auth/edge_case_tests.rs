//! Edge Case Tests for Authentication
//!
//! Tests boundary conditions in JWT handling:
//! - Expiry around the validation leeway
//! - Algorithm confusion
//! - Missing or malformed claims

#[cfg(test)]
mod jwt_tests {
    use super::super::jwt::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    const TEST_SECRET: &str = "edge-case-secret-for-jwt-tests";

    // =========================================================================
    // Token expired 30s ago - still valid inside the 60s leeway
    // =========================================================================
    #[test]
    fn test_expired_within_leeway_is_valid() {
        let jwt = JwtManager::new(TEST_SECRET);
        let token = jwt
            .issue_token(Uuid::new_v4(), "user", Duration::seconds(-30))
            .expect("Should generate token");
        assert!(jwt.validate_token(&token).is_ok());
    }

    // =========================================================================
    // Token expired 5 minutes ago - rejected as expired
    // =========================================================================
    #[test]
    fn test_expired_beyond_leeway_is_rejected() {
        let jwt = JwtManager::new(TEST_SECRET);
        let token = jwt
            .issue_token(Uuid::new_v4(), "user", Duration::minutes(-5))
            .expect("Should generate token");
        assert!(matches!(jwt.validate_token(&token), Err(JwtError::Expired)));
    }

    // =========================================================================
    // Same secret, different HMAC algorithm - rejected
    // =========================================================================
    #[test]
    fn test_other_algorithm_rejected() {
        let claims = json!({
            "sub": Uuid::new_v4(),
            "role": "admin",
            "exp": (OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp(),
        });
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();

        let result = JwtManager::new(TEST_SECRET).validate_token(&token);
        assert!(matches!(result, Err(JwtError::Invalid)));
    }

    // =========================================================================
    // No subject claim - rejected
    // =========================================================================
    #[test]
    fn test_missing_subject_rejected() {
        let claims = json!({
            "role": "user",
            "exp": (OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp(),
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();

        assert!(JwtManager::new(TEST_SECRET).validate_token(&token).is_err());
    }

    // =========================================================================
    // Subject that is not a UUID - rejected
    // =========================================================================
    #[test]
    fn test_non_uuid_subject_rejected() {
        let claims = json!({
            "sub": "user-42",
            "exp": (OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp(),
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();

        assert!(JwtManager::new(TEST_SECRET).validate_token(&token).is_err());
    }

    // =========================================================================
    // Role claim absent - defaults to plain user
    // =========================================================================
    #[test]
    fn test_missing_role_defaults_to_user() {
        let claims = json!({
            "sub": Uuid::new_v4(),
            "exp": (OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp(),
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();

        let claims = JwtManager::new(TEST_SECRET).validate_token(&token).unwrap();
        assert_eq!(claims.role, "user");
    }
}
