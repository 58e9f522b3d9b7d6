//! Upstream selection from the request host and the `ns` / `hubhost` hints.

use tracing::{debug, warn};

use crate::config::{GatewayConfig, Landing};

/// How the gateway presents itself for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Explicit upstream requested; behave as a pure registry API.
    PassthroughApi,
    /// Serve the search front end at `/`.
    DecoySearch,
    /// Serve a static landing page at `/`.
    DecoyStatic,
}

impl DisplayMode {
    pub fn is_decoy(self) -> bool {
        !matches!(self, DisplayMode::PassthroughApi)
    }
}

/// Which input decided the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceSource {
    QueryNs,
    QueryHubhost,
    HostPrefix,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub upstream_host: String,
    pub display_mode: DisplayMode,
    pub namespace_source: NamespaceSource,
}

/// Picks the upstream registry for one request. Never fails.
///
/// `request_host` may include a port. `ns` values outside the configured
/// allowlist are ignored unless `allow_any_upstream` is set.
pub fn resolve(
    request_host: &str,
    ns: Option<&str>,
    hubhost: Option<&str>,
    config: &GatewayConfig,
) -> RouteDecision {
    if let Some(ns) = ns.map(str::trim).filter(|ns| !ns.is_empty()) {
        let host = if ns == "docker.io" {
            config.default_upstream.clone()
        } else {
            ns.to_string()
        };

        if config.is_allowed_upstream(&host) {
            return RouteDecision {
                upstream_host: host,
                display_mode: DisplayMode::PassthroughApi,
                namespace_source: NamespaceSource::QueryNs,
            };
        }
        warn!(ns = %ns, "Ignoring ns outside the upstream allowlist");
    }

    let hubhost = hubhost.map(str::trim).filter(|h| !h.is_empty());
    let effective = hubhost.unwrap_or(request_host);
    let prefix = first_label(effective);

    let display_mode = match config.landing {
        Landing::Nginx => DisplayMode::DecoyStatic,
        _ => DisplayMode::DecoySearch,
    };

    let decision = match config.aliases.get(&prefix) {
        Some(host) => RouteDecision {
            upstream_host: host.clone(),
            display_mode,
            namespace_source: if hubhost.is_some() {
                NamespaceSource::QueryHubhost
            } else {
                NamespaceSource::HostPrefix
            },
        },
        None => RouteDecision {
            upstream_host: config.default_upstream.clone(),
            display_mode,
            namespace_source: NamespaceSource::Default,
        },
    };

    debug!(
        host = %effective,
        upstream = %decision.upstream_host,
        source = ?decision.namespace_source,
        "Resolved upstream"
    );
    decision
}

/// Lowercased first DNS label, port removed.
fn first_label(host: &str) -> String {
    let without_port = match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    };
    without_port
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}
