//! Header merge policy.
//!
//! Outbound requests are built from an allow-list, never by copying the
//! inbound map and deleting entries. Responses pass through except for a fixed
//! deny-list and hop-by-hop headers.

use axum::http::{
    header::{
        ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, ACCESS_CONTROL_ALLOW_CREDENTIALS,
        ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
        ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, AUTHORIZATION, CACHE_CONTROL,
        COOKIE, ORIGIN, USER_AGENT,
    },
    HeaderMap, HeaderName, HeaderValue,
};

/// Client headers copied verbatim to every upstream, token service included.
pub const FORWARDED_REQUEST_HEADERS: [HeaderName; 4] =
    [USER_AGENT, ACCEPT, ACCEPT_LANGUAGE, ACCEPT_ENCODING];

/// Object-store signature header. Passed through untouched when present.
pub const X_AMZ_CONTENT_SHA256: HeaderName = HeaderName::from_static("x-amz-content-sha256");

/// Upstream response headers that never reach the client.
pub const STRIPPED_RESPONSE_HEADERS: [&str; 4] = [
    "content-security-policy",
    "content-security-policy-report-only",
    "clear-site-data",
    "x-frame-options",
];

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

pub const ALLOWED_METHODS: &str = "GET,POST,PUT,PATCH,TRACE,DELETE,HEAD,OPTIONS";
pub const PREFLIGHT_MAX_AGE: &str = "1728000";

/// How the `Authorization` header of an outbound request is decided.
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// A token acquired by the broker; any client credential is discarded.
    Brokered(HeaderValue),
    /// Generic registry traffic: the client's own header, if any, is kept.
    ClientPassthrough,
    /// Non-registry targets and redirect follows: never send credentials.
    Stripped,
}

/// Headers for a request to the token service. No credentials, no cookies.
pub fn token_request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in FORWARDED_REQUEST_HEADERS.iter() {
        if let Some(value) = inbound.get(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    out.entry(ACCEPT).or_insert(HeaderValue::from_static("*/*"));
    out.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    out
}

/// Headers for a request to a registry or passthrough upstream.
///
/// The `Host` header is left to the HTTP client, which derives it from the
/// target URL.
pub fn outbound_headers(inbound: &HeaderMap, auth: &AuthMode) -> HeaderMap {
    let mut out = token_request_headers(inbound);

    if let Some(sha) = inbound.get(&X_AMZ_CONTENT_SHA256) {
        out.insert(X_AMZ_CONTENT_SHA256, sha.clone());
    }

    match auth {
        AuthMode::Brokered(value) => {
            out.insert(AUTHORIZATION, value.clone());
        }
        AuthMode::ClientPassthrough => {
            if let Some(value) = inbound.get(AUTHORIZATION) {
                out.insert(AUTHORIZATION, value.clone());
            }
        }
        AuthMode::Stripped => {}
    }

    out
}

/// Removes the deny-listed and hop-by-hop headers from an upstream response.
///
/// `transfer-encoding` is dropped as well: the body is re-framed by our own
/// HTTP server.
pub fn strip_response_headers(headers: &mut HeaderMap) {
    for name in STRIPPED_RESPONSE_HEADERS
        .iter()
        .chain(HOP_BY_HOP_HEADERS.iter())
        .chain(std::iter::once(&"transfer-encoding"))
    {
        headers.remove(*name);
    }
}

/// The `Origin` to echo back when the request carried credentials.
pub fn credentialed_origin(inbound: &HeaderMap) -> Option<HeaderValue> {
    let origin = inbound.get(ORIGIN)?;
    if inbound.contains_key(AUTHORIZATION) || inbound.contains_key(COOKIE) {
        Some(origin.clone())
    } else {
        None
    }
}

/// Sets the CORS headers on a response.
///
/// With `origin` set, that origin is echoed and credentials are allowed;
/// otherwise any origin may read the response.
pub fn apply_cors(headers: &mut HeaderMap, origin: Option<&HeaderValue>) {
    match origin {
        Some(origin) => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        None => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            headers.remove(ACCESS_CONTROL_ALLOW_CREDENTIALS);
        }
    }
    headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static("*"));
}

/// Headers answering a CORS preflight locally.
pub fn preflight_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers, None);
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(PREFLIGHT_MAX_AGE),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_static("docker/27.0.3"));
        h.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.oci.image.index.v1+json"),
        );
        h.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-token"));
        h.insert(COOKIE, HeaderValue::from_static("session=abc"));
        h.insert("x-amz-content-sha256", HeaderValue::from_static("UNSIGNED-PAYLOAD"));
        h.insert("x-custom", HeaderValue::from_static("dropped"));
        h
    }

    #[test]
    fn token_headers_never_carry_credentials() {
        let out = token_request_headers(&inbound());
        assert!(out.get(AUTHORIZATION).is_none());
        assert!(out.get(COOKIE).is_none());
        assert!(out.get("x-amz-content-sha256").is_none());
        assert_eq!(out[USER_AGENT], "docker/27.0.3");
        assert_eq!(out[CACHE_CONTROL], "max-age=0");
    }

    #[test]
    fn accept_defaults_to_wildcard() {
        let out = token_request_headers(&HeaderMap::new());
        assert_eq!(out[ACCEPT], "*/*");
    }

    #[test]
    fn brokered_token_replaces_client_authorization() {
        let auth = AuthMode::Brokered(HeaderValue::from_static("Bearer brokered"));
        let out = outbound_headers(&inbound(), &auth);
        assert_eq!(out[AUTHORIZATION], "Bearer brokered");
        assert_eq!(out.get_all(AUTHORIZATION).iter().count(), 1);
        assert_eq!(out["x-amz-content-sha256"], "UNSIGNED-PAYLOAD");
        assert!(out.get("x-custom").is_none());
        assert!(out.get(COOKIE).is_none());
    }

    #[test]
    fn passthrough_keeps_client_authorization() {
        let out = outbound_headers(&inbound(), &AuthMode::ClientPassthrough);
        assert_eq!(out[AUTHORIZATION], "Bearer client-token");
    }

    #[test]
    fn stripped_mode_drops_authorization() {
        let out = outbound_headers(&inbound(), &AuthMode::Stripped);
        assert!(out.get(AUTHORIZATION).is_none());
        assert_eq!(out["x-amz-content-sha256"], "UNSIGNED-PAYLOAD");
    }

    #[test]
    fn response_deny_list_is_applied() {
        let mut h = HeaderMap::new();
        h.insert("content-security-policy", HeaderValue::from_static("default-src 'none'"));
        h.insert(
            "content-security-policy-report-only",
            HeaderValue::from_static("default-src 'none'"),
        );
        h.insert("clear-site-data", HeaderValue::from_static("\"*\""));
        h.insert("x-frame-options", HeaderValue::from_static("DENY"));
        h.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        h.insert("docker-content-digest", HeaderValue::from_static("sha256:abc"));

        strip_response_headers(&mut h);

        assert_eq!(h.len(), 1);
        assert_eq!(h["docker-content-digest"], "sha256:abc");
    }

    #[test]
    fn credentialed_requests_echo_origin() {
        let mut h = inbound();
        assert!(credentialed_origin(&h).is_none());

        h.insert(ORIGIN, HeaderValue::from_static("https://ui.example"));
        let origin = credentialed_origin(&h);

        let mut out = HeaderMap::new();
        apply_cors(&mut out, origin.as_ref());
        assert_eq!(out[ACCESS_CONTROL_ALLOW_ORIGIN], "https://ui.example");
        assert_eq!(out[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(out[ACCESS_CONTROL_EXPOSE_HEADERS], "*");
    }

    #[test]
    fn preflight_advertises_methods() {
        let h = preflight_headers();
        assert_eq!(h[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(h[ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
        assert_eq!(h[ACCESS_CONTROL_MAX_AGE], PREFLIGHT_MAX_AGE);
    }
}
