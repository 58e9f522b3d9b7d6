//! # Gateway Configuration
//!
//! [`GatewayConfig`] is built once at startup and shared read-only (behind an
//! `Arc`) by every request. Nothing in it changes while the server runs.
//!
//! Defaults are embedded from `config.json` next to this crate's manifest. A
//! JSON file with the same shape may replace them, and three environment
//! variables are applied on top:
//!
//! - `UA`: extra blocked user-agent fragments, merged after the defaults
//! - `URL302`: answer `/` with a 302 to this URL
//! - `URL`: `nginx` serves the static decoy page, anything else is fetched
//!   and served as the landing page
//!
//! ```rust,no_run
//! use hub_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::load_or_default("gateway.json")?.with_env();
//! config.validate()?;
//! # Ok::<(), hub_gateway::GatewayError>(())
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GatewayError, GatewayResult};
use crate::policy;

/// What `/` serves under a decoy display mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Landing {
    /// Registry search front end.
    Search,
    /// Stock web-server welcome page.
    Nginx,
    /// Fetch this URL and serve its response.
    Url { url: String },
    /// Answer with a 302 to this URL.
    Redirect { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// TCP/TLS connect timeout for every outbound fetch
    pub connect_secs: u64,
    /// Time allowed until response headers arrive, per fetch
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            request_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// First host label -> upstream registry host
    pub aliases: BTreeMap<String, String>,
    /// Upstream used when nothing else matches
    pub default_upstream: String,
    /// Origin of the token service, e.g. `https://auth.docker.io`
    pub auth_url: String,
    /// `service` parameter sent with brokered token requests
    pub auth_service: String,
    /// Legacy v1 index service host
    pub index_host: String,
    /// Web host backing the search front end
    pub hub_web_host: String,
    /// Scheme used to reach upstream hosts
    #[serde(default = "default_scheme")]
    pub upstream_scheme: String,
    /// Scheme clients use to reach this gateway
    #[serde(default = "default_scheme")]
    pub public_scheme: String,
    pub landing: Landing,
    pub blocked_user_agents: Vec<String>,
    /// Accept any `ns` value as upstream host. Off by default.
    #[serde(default)]
    pub allow_any_upstream: bool,
    /// Hosts accepted from `ns` besides the alias targets and the default
    #[serde(default)]
    pub extra_allowed_upstreams: Vec<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    pub max_redirects: usize,
    /// `max-age` set on successful proxied responses
    pub cache_max_age_secs: u64,
    /// Upper bound on how long a brokered token is reused; 0 disables caching
    pub token_cache_ttl_secs: u64,
}

fn default_scheme() -> String {
    "https".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        serde_json::from_str(include_str!("../config.json"))
            .expect("Failed to parse embedded config.json")
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let raw = fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise use the embedded defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Applies `UA`, `URL302` and `URL` from the process environment.
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `UA`, `URL302` and `URL` from an arbitrary source.
    ///
    /// `URL302` wins over `URL` when both are set.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(extra) = lookup("UA") {
            for ua in policy::parse_blocklist(&extra) {
                if !self.blocked_user_agents.contains(&ua) {
                    self.blocked_user_agents.push(ua);
                }
            }
        }

        let redirect = lookup("URL302").filter(|v| !v.trim().is_empty());
        let home = lookup("URL").filter(|v| !v.trim().is_empty());

        if let Some(url) = redirect {
            self.landing = Landing::Redirect {
                url: url.trim().to_string(),
            };
        } else if let Some(url) = home {
            self.landing = if url.trim().eq_ignore_ascii_case("nginx") {
                Landing::Nginx
            } else {
                Landing::Url {
                    url: url.trim().to_string(),
                }
            };
        }

        self
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.default_upstream.trim().is_empty() {
            return Err(GatewayError::Config(
                "default_upstream must not be empty".to_string(),
            ));
        }
        Url::parse(&self.auth_url)
            .map_err(|e| GatewayError::Config(format!("auth_url {:?}: {e}", self.auth_url)))?;
        if self.max_redirects == 0 {
            return Err(GatewayError::Config(
                "max_redirects must be at least 1".to_string(),
            ));
        }
        for scheme in [&self.upstream_scheme, &self.public_scheme] {
            if scheme != "http" && scheme != "https" {
                return Err(GatewayError::Config(format!(
                    "unsupported scheme {scheme:?}"
                )));
            }
        }
        if let Landing::Url { url } | Landing::Redirect { url } = &self.landing {
            Url::parse(url)
                .map_err(|e| GatewayError::Config(format!("landing url {url:?}: {e}")))?;
        }
        Ok(())
    }

    /// `scheme://host[:port]` of the token service, as it appears in
    /// upstream `WWW-Authenticate` challenges.
    pub fn auth_origin(&self) -> String {
        match Url::parse(&self.auth_url) {
            Ok(url) => url.origin().ascii_serialization(),
            Err(_) => self.auth_url.trim_end_matches('/').to_string(),
        }
    }

    /// Whether `host` may be selected through the `ns` query parameter.
    pub fn is_allowed_upstream(&self, host: &str) -> bool {
        if self.allow_any_upstream {
            return true;
        }
        let host = host.to_ascii_lowercase();
        host == self.default_upstream
            || self.aliases.values().any(|h| *h == host)
            || self.extra_allowed_upstreams.iter().any(|h| *h == host)
    }

    /// Builds `upstream_scheme://host` + `path_and_query`.
    pub fn upstream_url(&self, host: &str, path_and_query: &str) -> GatewayResult<Url> {
        let raw = format!("{}://{}{}", self.upstream_scheme, host, path_and_query);
        Url::parse(&raw).map_err(|e| GatewayError::InvalidUrl(format!("{raw}: {e}")))
    }

    /// Builds a URL on the token service from an inbound path and query.
    pub fn auth_service_url(&self, path_and_query: &str) -> GatewayResult<Url> {
        let raw = format!("{}{}", self.auth_url.trim_end_matches('/'), path_and_query);
        Url::parse(&raw).map_err(|e| GatewayError::InvalidUrl(format!("{raw}: {e}")))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn token_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.token_cache_ttl_secs)
    }

    pub fn is_docker_hub(&self, host: &str) -> bool {
        host.eq_ignore_ascii_case(&self.default_upstream)
    }
}
