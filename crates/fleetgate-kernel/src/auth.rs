//! Inbound API-key authentication.
//!
//! OpenAI-style clients and the native surface send
//! `Authorization: Bearer <key>`; Anthropic-style clients send
//! `x-api-key: <key>`. An empty key list disables the check.

use axum::http::HeaderMap;

/// Constant-time byte comparison, so key checks do not leak length-prefix
/// timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn key_matches(keys: &[String], presented: &str) -> bool {
    keys.iter()
        .any(|key| constant_time_eq(key.as_bytes(), presented.as_bytes()))
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Bearer-token check for the OpenAI and native surfaces.
pub fn check_bearer(headers: &HeaderMap, keys: &[String]) -> bool {
    if keys.is_empty() {
        return true;
    }
    let Some(auth) = header_value(headers, "authorization") else {
        return false;
    };
    let token = auth.strip_prefix("Bearer ").unwrap_or("");
    key_matches(keys, token)
}

/// `x-api-key` check for the Anthropic surface.
pub fn check_x_api_key(headers: &HeaderMap, keys: &[String]) -> bool {
    if keys.is_empty() {
        return true;
    }
    header_value(headers, "x-api-key")
        .map(|presented| key_matches(keys, presented))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn keys() -> Vec<String> {
        vec!["sk-test-123".to_string()]
    }

    #[test]
    fn bearer_accepts_exact_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-test-123"));
        assert!(check_bearer(&headers, &keys()));

        headers.insert("authorization", HeaderValue::from_static("Bearer wrong"));
        assert!(!check_bearer(&headers, &keys()));
    }

    #[test]
    fn bearer_rejects_missing_or_unprefixed_header() {
        let mut headers = HeaderMap::new();
        assert!(!check_bearer(&headers, &keys()));

        headers.insert("authorization", HeaderValue::from_static("sk-test-123"));
        assert!(!check_bearer(&headers, &keys()));
    }

    #[test]
    fn x_api_key_is_separate_from_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-test-123"));
        assert!(check_x_api_key(&headers, &keys()));
        assert!(!check_bearer(&headers, &keys()));
    }

    #[test]
    fn bearer_ignores_other_credential_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("sk-test-123"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-test-123"));
        assert!(!check_bearer(&headers, &keys()));
    }

    #[test]
    fn empty_key_list_disables_auth() {
        let headers = HeaderMap::new();
        assert!(check_bearer(&headers, &[]));
        assert!(check_x_api_key(&headers, &[]));
    }
}
