//! The single request handler behind every path and method.
//!
//! Order of decisions for one request:
//!
//! 1. Blocked user agents get the static decoy page.
//! 2. CORS preflights are answered locally.
//! 3. The resolver picks the upstream, the path rewriter picks the target.
//! 4. Protected registry calls get a brokered token.
//! 5. The executor fetches, the response rewriter finishes the reply.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{
    header::{ACCESS_CONTROL_REQUEST_HEADERS, HOST, LOCATION, USER_AGENT},
    HeaderMap, HeaderValue, Method, StatusCode,
};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};
use url::{form_urlencoded, Url};

use crate::config::Landing;
use crate::decoy::{render_landing_page, LandingKind};
use crate::error::{GatewayError, GatewayResult};
use crate::headers::{
    apply_cors, credentialed_origin, outbound_headers, preflight_headers, token_request_headers,
    AuthMode,
};
use crate::path::{host_with_port, plan, Dispatch};
use crate::policy;
use crate::proxy::OutboundRequest;
use crate::resolver::resolve;
use crate::response::{rewrite_response, CachePolicy, RewriteContext};
use crate::state::AppState;

/// Axum fallback handler.
pub async fn handle(State(state): State<AppState>, request: Request) -> Response {
    match dispatch(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Routing hints carried in the query string.
#[derive(Debug, Default, PartialEq, Eq)]
struct RouteHints {
    ns: Option<String>,
    hubhost: Option<String>,
}

impl RouteHints {
    fn from_query(query: Option<&str>) -> Self {
        let mut hints = Self::default();
        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "ns" => hints.ns = Some(value.into_owned()),
                "hubhost" => hints.hubhost = Some(value.into_owned()),
                _ => {}
            }
        }
        hints
    }
}

async fn dispatch(state: &AppState, request: Request) -> GatewayResult<Response> {
    let config = state.config.as_ref();
    let (parts, body) = request.into_parts();
    let inbound = &parts.headers;

    let user_agent = inbound
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if policy::should_block(user_agent, &config.blocked_user_agents) {
        info!(user_agent = %user_agent, path = %parts.uri.path(), "Blocked user agent");
        return Ok(landing_page(LandingKind::Nginx));
    }

    if parts.method == Method::OPTIONS && inbound.contains_key(ACCESS_CONTROL_REQUEST_HEADERS) {
        return Ok((StatusCode::OK, preflight_headers()).into_response());
    }

    let request_host = request_host(inbound, &parts.uri);
    let hints = RouteHints::from_query(parts.uri.query());
    let decision = resolve(
        &request_host,
        hints.ns.as_deref(),
        hints.hubhost.as_deref(),
        config,
    );

    let path = parts.uri.path();
    let target = plan(
        path,
        parts.uri.query(),
        &decision,
        policy::is_browser(user_agent),
        config,
    )?;
    debug!(path = %path, upstream = %decision.upstream_host, dispatch = %target, "Planned request");

    let ctx = RewriteContext {
        public_origin: format!("{}://{}", config.public_scheme, request_host),
        upstream_host: target
            .target_host()
            .unwrap_or_else(|| decision.upstream_host.clone()),
        auth_origin: config.auth_origin(),
        cors_origin: credentialed_origin(inbound),
        cache: CachePolicy::Override {
            max_age_secs: config.cache_max_age_secs,
        },
    };

    let body = streamed_body(&parts.method, body);

    let (url, headers, cache) = match target {
        Dispatch::Landing => return landing(state, inbound, ctx).await,
        Dispatch::Token { url } => (url, token_request_headers(inbound), CachePolicy::Preserve),
        Dispatch::Registry { url, repository } => {
            let grant = state.broker.acquire_token(&repository, inbound).await?;
            let auth = AuthMode::Brokered(grant.authorization()?);
            (url, outbound_headers(inbound, &auth), ctx.cache)
        }
        Dispatch::Passthrough { url } => {
            (url, outbound_headers(inbound, &AuthMode::Stripped), ctx.cache)
        }
        Dispatch::Upstream { url } => (
            url,
            outbound_headers(inbound, &AuthMode::ClientPassthrough),
            ctx.cache,
        ),
    };

    let mut outbound = OutboundRequest::new(parts.method.clone(), url, headers);
    if let Some(body) = body {
        outbound = outbound.with_body(body);
    }

    let outcome = state.executor.forward(outbound, &ctx.upstream_host).await?;
    info!(
        method = %parts.method,
        path = %path,
        upstream = %ctx.upstream_host,
        status = outcome.status.as_u16(),
        hops = outcome.hops,
        "Proxied request"
    );

    Ok(rewrite_response(outcome, &RewriteContext { cache, ..ctx }))
}

/// Answers `/` under a decoy display mode according to the configured landing.
async fn landing(
    state: &AppState,
    inbound: &HeaderMap,
    ctx: RewriteContext,
) -> GatewayResult<Response> {
    match &state.config.landing {
        Landing::Search => Ok(landing_page(LandingKind::Search)),
        Landing::Nginx => Ok(landing_page(LandingKind::Nginx)),
        Landing::Redirect { url } => {
            let location = HeaderValue::from_str(url)
                .map_err(|e| GatewayError::InvalidUrl(format!("{url}: {e}")))?;
            let mut response = (StatusCode::FOUND, [(LOCATION, location)]).into_response();
            apply_cors(response.headers_mut(), None);
            Ok(response)
        }
        Landing::Url { url } => {
            let url = Url::parse(url)
                .map_err(|e| GatewayError::InvalidUrl(format!("{url}: {e}")))?;
            let host = host_with_port(&url)
                .ok_or_else(|| GatewayError::InvalidUrl(url.to_string()))?;
            let request = OutboundRequest::new(
                Method::GET,
                url,
                outbound_headers(inbound, &AuthMode::Stripped),
            );
            let outcome = state.executor.forward(request, &host).await?;
            Ok(rewrite_response(
                outcome,
                &RewriteContext {
                    upstream_host: host,
                    ..ctx
                },
            ))
        }
    }
}

fn landing_page(kind: LandingKind) -> Response {
    let mut response = render_landing_page(kind).into_response();
    apply_cors(response.headers_mut(), None);
    response
}

/// `Host` header, falling back to the request-target authority.
fn request_host(headers: &HeaderMap, uri: &axum::http::Uri) -> String {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Request bodies are forwarded for every method except GET and HEAD.
fn streamed_body(method: &Method, body: Body) -> Option<reqwest::Body> {
    if *method == Method::GET || *method == Method::HEAD {
        return None;
    }
    Some(reqwest::Body::wrap_stream(body.into_data_stream()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_hints_are_read_from_query() {
        let hints = RouteHints::from_query(Some("ns=ghcr.io&n=10&hubhost=quay.example"));
        assert_eq!(hints.ns.as_deref(), Some("ghcr.io"));
        assert_eq!(hints.hubhost.as_deref(), Some("quay.example"));
        assert_eq!(RouteHints::from_query(None), RouteHints::default());
    }

    #[test]
    fn host_header_wins_over_authority() {
        let uri: axum::http::Uri = "http://internal:8080/v2/".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(request_host(&headers, &uri), "internal:8080");

        headers.insert(HOST, HeaderValue::from_static("mirror.example"));
        assert_eq!(request_host(&headers, &uri), "mirror.example");

        let bare: axum::http::Uri = "/v2/".parse().unwrap();
        assert_eq!(request_host(&HeaderMap::new(), &bare), "localhost");
    }

    #[test]
    fn bodies_are_skipped_for_get_and_head() {
        assert!(streamed_body(&Method::GET, Body::empty()).is_none());
        assert!(streamed_body(&Method::HEAD, Body::empty()).is_none());
        assert!(streamed_body(&Method::PUT, Body::from("x")).is_some());
    }
}
