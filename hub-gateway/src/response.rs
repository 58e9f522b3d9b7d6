//! Rewrites upstream responses so clients keep talking to the gateway.

use axum::http::{
    header::{CACHE_CONTROL, LOCATION, WWW_AUTHENTICATE},
    HeaderMap, HeaderValue,
};
use axum::response::Response;
use tracing::debug;
use url::Url;

use crate::headers::{apply_cors, strip_response_headers};
use crate::path::host_with_port;
use crate::proxy::ProxyOutcome;

/// What happens to `Cache-Control` on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Successful responses get `public, max-age=<secs>`.
    Override { max_age_secs: u64 },
    /// Keep whatever upstream sent.
    Preserve,
}

#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// `scheme://host[:port]` the client used to reach the gateway
    pub public_origin: String,
    /// `host[:port]` the request was routed to
    pub upstream_host: String,
    /// Token service origin as it appears in auth challenges
    pub auth_origin: String,
    /// Origin to echo for credentialed requests
    pub cors_origin: Option<HeaderValue>,
    pub cache: CachePolicy,
}

pub fn rewrite_response(outcome: ProxyOutcome, ctx: &RewriteContext) -> Response {
    let ProxyOutcome {
        status,
        mut headers,
        body,
        final_url,
        hops,
    } = outcome;

    strip_response_headers(&mut headers);
    rewrite_challenges(&mut headers, &ctx.auth_origin, &ctx.public_origin);
    rewrite_location(&mut headers, &ctx.upstream_host, &ctx.public_origin);
    apply_cors(&mut headers, ctx.cors_origin.as_ref());

    if let CachePolicy::Override { max_age_secs } = ctx.cache {
        if status.is_success() {
            if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={max_age_secs}")) {
                headers.insert(CACHE_CONTROL, value);
            }
        }
    }

    debug!(
        status = status.as_u16(),
        final_url = %final_url,
        hops,
        "Returning upstream response"
    );

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Points every `WWW-Authenticate` realm at the gateway instead of the
/// token service.
fn rewrite_challenges(headers: &mut HeaderMap, auth_origin: &str, public_origin: &str) {
    if auth_origin.is_empty() || !headers.contains_key(WWW_AUTHENTICATE) {
        return;
    }

    let rewritten: Vec<HeaderValue> = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .map(|value| match value.to_str() {
            Ok(text) if text.contains(auth_origin) => {
                HeaderValue::from_str(&text.replace(auth_origin, public_origin))
                    .unwrap_or_else(|_| value.clone())
            }
            _ => value.clone(),
        })
        .collect();

    headers.remove(WWW_AUTHENTICATE);
    for value in rewritten {
        headers.append(WWW_AUTHENTICATE, value);
    }
}

/// Moves an absolute `Location` on the upstream host onto the gateway origin.
fn rewrite_location(headers: &mut HeaderMap, upstream_host: &str, public_origin: &str) {
    let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let Ok(url) = Url::parse(location) else {
        return;
    };
    if !host_with_port(&url).is_some_and(|host| host.eq_ignore_ascii_case(upstream_host)) {
        return;
    }

    let mut rewritten = format!("{}{}", public_origin.trim_end_matches('/'), url.path());
    if let Some(query) = url.query() {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(LOCATION, value);
    }
}
