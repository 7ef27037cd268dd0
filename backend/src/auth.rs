//! Shared-secret authentication for the HTTP ingest edge (§4.E).
//!
//! Deliberately minimal: per-user identity and third-party OAuth/JWT
//! verification are out of scope for this service (see §1, Non-goals) — a
//! single opaque key compared against one configured header is all the
//! ingest path needs.

use axum::http::HeaderMap;

use crate::error::ClientError;

const API_KEY_HEADER: &str = "x-api-key";

/// `expected` is `None` when `INGEST_API_KEY` is unset — ingest is open in
/// that case, and the caller is responsible for warning about it once at
/// startup (see `main`).
pub fn check_ingest_auth(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ClientError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let provided = headers.get(API_KEY_HEADER).and_then(|value| value.to_str().ok());

    match provided {
        Some(provided) if constant_time_eq(provided.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(ClientError::Unauthorized),
    }
}

/// Compares the whole buffer rather than short-circuiting on the first
/// mismatch, so response timing doesn't leak how much of the key matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_key(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_str(key).unwrap());
        headers
    }

    #[test]
    fn open_ingest_allows_any_request() {
        assert!(check_ingest_auth(None, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn matching_key_is_authorized() {
        let headers = headers_with_key("s3cret");
        assert!(check_ingest_auth(Some("s3cret"), &headers).is_ok());
    }

    #[test]
    fn missing_or_wrong_key_is_rejected() {
        assert!(check_ingest_auth(Some("s3cret"), &HeaderMap::new()).is_err());
        let headers = headers_with_key("wrong");
        assert!(check_ingest_auth(Some("s3cret"), &headers).is_err());
    }
}
