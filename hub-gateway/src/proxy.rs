//! Outbound fetches with streamed bodies and an explicit redirect loop.
//!
//! The HTTP client never follows redirects on its own. [`ProxyExecutor::forward`]
//! inspects the first response: a redirect to another host (object storage,
//! a CDN) is chased internally so the client only ever talks to the gateway.
//! Redirects back to the upstream itself, and relative ones, are returned to
//! the client for the response rewriter to handle.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::path::host_with_port;

/// Shared client used for every upstream and token-service fetch.
///
/// The read timeout bounds each wait for body bytes after the headers
/// arrived, so a stalled stream errors instead of holding the client open.
pub fn build_http_client(config: &GatewayConfig) -> GatewayResult<Client> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.request_timeout())
        .user_agent(concat!("hub-gateway/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {e}")))
}

/// A fully decided outbound request.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// Sent only on the first fetch; redirect follows carry no body.
    pub body: Option<reqwest::Body>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url, headers: HeaderMap) -> Self {
        Self {
            method,
            url,
            headers,
            body: None,
        }
    }

    pub fn with_body(mut self, body: reqwest::Body) -> Self {
        self.body = Some(body);
        self
    }
}

/// The last upstream response, body still streaming.
pub struct ProxyOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
    pub final_url: Url,
    /// Number of redirects followed to get here.
    pub hops: usize,
}

impl std::fmt::Debug for ProxyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOutcome")
            .field("status", &self.status)
            .field("final_url", &self.final_url.as_str())
            .field("hops", &self.hops)
            .finish_non_exhaustive()
    }
}

pub struct ProxyExecutor {
    client: Client,
    request_timeout: Duration,
    max_redirects: usize,
}

impl ProxyExecutor {
    pub fn new(client: Client, config: &GatewayConfig) -> Self {
        Self::with_limits(client, config.request_timeout(), config.max_redirects)
    }

    pub fn with_limits(client: Client, request_timeout: Duration, max_redirects: usize) -> Self {
        Self {
            client,
            request_timeout,
            max_redirects,
        }
    }

    /// Sends `request` and returns the response the client should see.
    ///
    /// `upstream_host` is the `host[:port]` the request was routed to; an
    /// absolute `Location` naming any other host is followed here, at most
    /// `max_redirects` times.
    pub async fn forward(
        &self,
        request: OutboundRequest,
        upstream_host: &str,
    ) -> GatewayResult<ProxyOutcome> {
        let OutboundRequest {
            method,
            url,
            mut headers,
            body,
        } = request;

        let response = self
            .send(method.clone(), url.clone(), headers.clone(), body, upstream_host)
            .await?;

        let mut current_url = url;
        let mut response = response;
        let mut hops = 0;

        while let Some(next) = self.next_location(&response, &current_url, upstream_host, hops) {
            if hops == self.max_redirects {
                warn!(
                    upstream = %upstream_host,
                    location = %next,
                    hops,
                    "Redirect limit reached"
                );
                return Err(GatewayError::ProxyLoop {
                    limit: self.max_redirects,
                    location: next.to_string(),
                });
            }

            hops += 1;
            headers.remove(header::AUTHORIZATION);
            let host = host_with_port(&next).unwrap_or_default();
            debug!(location = %next, hops, "Following redirect");

            response = self
                .send(method.clone(), next.clone(), headers.clone(), None, &host)
                .await?;
            current_url = next;
        }

        if hops > 0 {
            info!(
                upstream = %upstream_host,
                final_url = %current_url,
                hops,
                status = response.status().as_u16(),
                "Redirect chain resolved"
            );
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = Body::from_stream(response.bytes_stream());

        Ok(ProxyOutcome {
            status,
            headers,
            body,
            final_url: current_url,
            hops,
        })
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<reqwest::Body>,
        host: &str,
    ) -> GatewayResult<reqwest::Response> {
        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        tokio::time::timeout(self.request_timeout, builder.send())
            .await
            .map_err(|_| GatewayError::UpstreamTimeout {
                host: host.to_string(),
            })?
            .map_err(|e| {
                warn!(upstream = %host, error = %e, "Upstream fetch failed");
                GatewayError::from_transport(host, e)
            })
    }

    /// The URL to fetch next, if `response` is a redirect this executor owns.
    ///
    /// On the first response only cross-host absolute locations qualify; once
    /// inside a chain every location is followed.
    fn next_location(
        &self,
        response: &reqwest::Response,
        current: &Url,
        upstream_host: &str,
        hops: usize,
    ) -> Option<Url> {
        if !response.status().is_redirection() {
            return None;
        }
        let raw = response.headers().get(header::LOCATION)?.to_str().ok()?;

        if hops == 0 {
            let absolute = Url::parse(raw).ok()?;
            let host = host_with_port(&absolute)?;
            if host.eq_ignore_ascii_case(upstream_host) {
                return None;
            }
            return Some(absolute);
        }

        current.join(raw).ok()
    }
}
