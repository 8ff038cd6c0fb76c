//! Payment webhook signature verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=...]`. The MAC is
//! HMAC-SHA256 over `"<t>.<raw body>"` keyed with the endpoint secret.
//! Several `v1` entries may be present while a secret is being rotated;
//! any one matching is enough.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signed timestamp
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

fn signing_key(secret: &str) -> &[u8] {
    secret.strip_prefix("whsec_").unwrap_or(secret).as_bytes()
}

fn mac_for(payload: &[u8], timestamp: i64, secret: &str) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(signing_key(secret))
        .map_err(|e| BillingError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Hex signature for a payload, as the gateway would compute it
pub fn compute_signature(payload: &[u8], timestamp: i64, secret: &str) -> BillingResult<String> {
    mac_for(payload, timestamp, secret).map(hex::encode)
}

/// Full signature header value for a payload
pub fn signature_header(payload: &[u8], timestamp: i64, secret: &str) -> BillingResult<String> {
    Ok(format!(
        "t={},v1={}",
        timestamp,
        compute_signature(payload, timestamp, secret)?
    ))
}

/// Verify a signature header against the raw request body.
///
/// Must run before anything in the body is trusted.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::InvalidSignature
    })?;

    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::InvalidSignature);
    }

    let skew = (now.unix_timestamp() - timestamp).abs();
    if skew > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now.unix_timestamp(),
            skew = skew,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::InvalidSignature);
    }

    let expected = mac_for(payload, timestamp, secret)?;
    let matched = candidates.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|provided| bool::from(provided.as_slice().ct_eq(expected.as_slice())))
            .unwrap_or(false)
    });

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::InvalidSignature);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;

    fn at(ts: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(ts).unwrap()
    }

    #[test]
    fn test_valid_signature_accepted() {
        let header = signature_header(BODY, 1_700_000_000, SECRET).unwrap();
        assert!(verify_signature(BODY, &header, SECRET, at(1_700_000_030)).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let header = signature_header(BODY, 1_700_000_000, SECRET).unwrap();
        let tampered = br#"{"id":"evt_1","type":"checkout.session.completed","x":1}"#;
        assert!(matches!(
            verify_signature(tampered, &header, SECRET, at(1_700_000_000)),
            Err(BillingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let header = signature_header(BODY, 1_700_000_000, SECRET).unwrap();
        assert!(verify_signature(BODY, &header, SECRET, at(1_700_000_301)).is_err());
        assert!(verify_signature(BODY, &header, SECRET, at(1_700_000_300)).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = signature_header(BODY, 1_700_000_000, "whsec_other").unwrap();
        assert!(verify_signature(BODY, &header, SECRET, at(1_700_000_000)).is_err());
    }

    #[test]
    fn test_prefix_is_stripped_from_secret() {
        let with_prefix = compute_signature(BODY, 1, "whsec_abc").unwrap();
        let without = compute_signature(BODY, 1, "abc").unwrap();
        assert_eq!(with_prefix, without);
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let good = compute_signature(BODY, 1_700_000_000, SECRET).unwrap();
        let header = format!("t=1700000000,v1={},v1={}", "00".repeat(32), good);
        assert!(verify_signature(BODY, &header, SECRET, at(1_700_000_000)).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let now = at(1_700_000_000);
        for header in ["", "t=abc,v1=00", "v1=00", "t=1700000000", "t=1700000000,v1=zz"] {
            assert!(
                verify_signature(BODY, header, SECRET, now).is_err(),
                "header {:?} should be rejected",
                header
            );
        }
    }
}
