//! Access token inspection.
//!
//! Tokens are opaque to the session layer except for the `exp` claim in
//! the JWT payload, which drives proactive renewal. Signatures are not
//! verified here; that is the server's job.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Claims {
    /// Seconds since the Unix epoch
    exp: Option<f64>,
}

/// Decode the `exp` claim of a JWT access token.
///
/// Returns `None` when the token isn't a JWT or carries no expiry.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    // Some issuers pad their segments even though RFC 7515 says not to
    let bytes = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Access token payload is not base64url");
            return None;
        }
    };
    let claims: Claims = match serde_json::from_slice(&bytes) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "Access token payload is not JSON");
            return None;
        }
    };
    let millis = (claims.exp? * 1000.0) as i64;
    DateTime::from_timestamp_millis(millis)
}

/// Expiry as epoch milliseconds, the form the dashboard keeps in state
pub fn token_expiry_millis(token: &str) -> Option<i64> {
    token_expiry(token).map(|t| t.timestamp_millis())
}

/// A token with no readable expiry is treated as still valid; the server
/// will reject it with a 401 if it isn't.
pub fn is_expired_at(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expiry.map(|exp| exp <= now).unwrap_or(false)
}

#[cfg(test)]
pub(crate) fn make_jwt(exp: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD
        .encode(format!(r#"{{"id":"65f0c1","exp":{}}}"#, exp.timestamp()).as_bytes());
    format!("{}.{}.signature", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_token_expiry_reads_exp_claim() {
        let exp = DateTime::from_timestamp(1_900_000_000, 0).unwrap();
        let token = make_jwt(exp);
        assert_eq!(token_expiry(&token), Some(exp));
        assert_eq!(token_expiry_millis(&token), Some(1_900_000_000_000));
    }

    #[test]
    fn test_token_expiry_not_a_jwt() {
        assert_eq!(token_expiry("opaque-token"), None);
        assert_eq!(token_expiry("a.!!!.c"), None);
        let no_json = format!("h.{}.s", URL_SAFE_NO_PAD.encode(b"not json"));
        assert_eq!(token_expiry(&no_json), None);
    }

    #[test]
    fn test_token_expiry_without_exp() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"id":"1"}"#);
        assert_eq!(token_expiry(&format!("h.{}.s", payload)), None);
    }

    #[test]
    fn test_is_expired_at() {
        let now = Utc::now();
        assert!(is_expired_at(Some(now - Duration::seconds(1)), now));
        assert!(!is_expired_at(Some(now + Duration::minutes(10)), now));
        assert!(!is_expired_at(None, now));
    }
}
