//! URL and header rewrite rules shared by the server and the in-page agent.
//!
//! The agent talks to one default upstream host. When the upstream hands out
//! absolute URLs (redirects, resumable-upload endpoints), the server rewrites
//! them to its own authority and smuggles the original host in a
//! `__proxy_host__` query parameter so the next client call routes correctly.

use std::collections::HashMap;

use url::Url;

/// Query parameter carrying the real upstream host across a rewritten URL.
pub const PROXY_HOST_PARAM: &str = "__proxy_host__";

/// Request headers the agent must drop before fetching; the browser supplies
/// its own values and several of these are forbidden in page context anyway.
pub const REQUEST_HEADER_STRIP: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "origin",
    "referer",
    "user-agent",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-dest",
];

/// Response headers the relay must rewrite to preserve upstream routing.
const REWRITTEN_RESPONSE_HEADERS: &[&str] = &["location", "x-goog-upload-url"];

/// Remove the `__proxy_host__` parameter from a URL or path, returning the
/// cleaned string and the extracted host override, if any.
pub fn split_proxy_host(raw: &str) -> (String, Option<String>) {
    let (mut parsed, relative) = match Url::parse(raw) {
        Ok(url) => (url, false),
        Err(_) => {
            // Path-only input; parse against a throwaway base.
            match Url::parse("http://relay.invalid").and_then(|base| base.join(raw)) {
                Ok(url) => (url, true),
                Err(_) => return (raw.to_string(), None),
            }
        }
    };

    let mut host = None;
    let remaining: Vec<(String, String)> = parsed
        .query_pairs()
        .filter_map(|(k, v)| {
            if k == PROXY_HOST_PARAM {
                host = Some(v.to_string());
                None
            } else {
                Some((k.to_string(), v.to_string()))
            }
        })
        .collect();

    if host.is_none() {
        return (raw.to_string(), None);
    }

    if remaining.is_empty() {
        parsed.set_query(None);
    } else {
        parsed
            .query_pairs_mut()
            .clear()
            .extend_pairs(remaining.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    let cleaned = if relative {
        let mut s = parsed.path().to_string();
        if let Some(q) = parsed.query() {
            s.push('?');
            s.push_str(q);
        }
        s
    } else {
        parsed.to_string()
    };
    (cleaned, host)
}

/// Rewrite an absolute upstream URL to this server's authority, appending
/// the original host as `__proxy_host__`. Relative values pass through
/// untouched (they already resolve against the relay).
pub fn rewrite_upstream_redirect(value: &str, own_authority: &str) -> String {
    let parsed = match Url::parse(value) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
        _ => return value.to_string(),
    };
    let Some(host) = parsed.host_str() else {
        return value.to_string();
    };

    let mut rewritten = format!("http://{}{}", own_authority, parsed.path());
    let mut sep = '?';
    if let Some(query) = parsed.query() {
        rewritten.push(sep);
        rewritten.push_str(query);
        sep = '&';
    }
    rewritten.push(sep);
    rewritten.push_str(PROXY_HOST_PARAM);
    rewritten.push('=');
    rewritten.push_str(host);
    rewritten
}

/// Strip relay-breaking response headers: the CORS allow-set (the relay sets
/// its own) and `content-length` (the body may be re-encoded downstream).
pub fn sanitize_response_headers(headers: &mut HashMap<String, String>) {
    headers.retain(|name, _| {
        let name = name.to_ascii_lowercase();
        name != "content-length" && !name.starts_with("access-control-allow-")
    });
}

/// Apply the full relay-side header pass: sanitize, then rewrite redirect
/// and upload-target headers to preserve the upstream host hint.
pub fn rewrite_relay_headers(headers: &mut HashMap<String, String>, own_authority: &str) {
    sanitize_response_headers(headers);
    for (name, value) in headers.iter_mut() {
        if REWRITTEN_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            *value = rewrite_upstream_redirect(value, own_authority);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_extracts_and_removes_override() {
        let (clean, host) =
            split_proxy_host("/upload/v1beta/files?uploadType=resumable&__proxy_host__=googleapis.com");
        assert_eq!(host.as_deref(), Some("googleapis.com"));
        assert_eq!(clean, "/upload/v1beta/files?uploadType=resumable");
    }

    #[test]
    fn split_without_override_is_identity() {
        let (clean, host) = split_proxy_host("/v1beta/models?pageSize=5");
        assert!(host.is_none());
        assert_eq!(clean, "/v1beta/models?pageSize=5");
    }

    #[test]
    fn redirect_rewrite_round_trips() {
        let rewritten =
            rewrite_upstream_redirect("https://googleapis.com/foo?x=1", "127.0.0.1:2048");
        assert_eq!(
            rewritten,
            "http://127.0.0.1:2048/foo?x=1&__proxy_host__=googleapis.com"
        );

        let (clean, host) = split_proxy_host(&rewritten);
        assert_eq!(host.as_deref(), Some("googleapis.com"));
        assert_eq!(clean, "http://127.0.0.1:2048/foo?x=1");
    }

    #[test]
    fn relative_location_is_untouched() {
        assert_eq!(
            rewrite_upstream_redirect("/v1beta/files/abc", "127.0.0.1:2048"),
            "/v1beta/files/abc"
        );
    }

    #[test]
    fn sanitize_strips_cors_and_length() {
        let mut headers = HashMap::from([
            ("Content-Length".to_string(), "42".to_string()),
            ("access-control-allow-origin".to_string(), "*".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]);
        sanitize_response_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn relay_pass_rewrites_upload_url() {
        let mut headers = HashMap::from([(
            "x-goog-upload-url".to_string(),
            "https://googleapis.com/upload/v1beta/files?upload_id=9".to_string(),
        )]);
        rewrite_relay_headers(&mut headers, "127.0.0.1:2048");
        let value = &headers["x-goog-upload-url"];
        assert!(value.starts_with("http://127.0.0.1:2048/upload/v1beta/files"));
        assert!(value.contains("__proxy_host__=googleapis.com"));
    }
}
