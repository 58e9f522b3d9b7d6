//! Registry path classification and rewriting.
//!
//! [`plan`] applies the routing rules in order and returns a [`Dispatch`]
//! naming the target URL and how the request must be treated:
//!
//! 1. `/` under a decoy display mode is answered locally.
//! 2. Any path containing `/token` goes to the token service.
//! 3. `/v1/...` (search, repositories, everything else) goes to the index
//!    service.
//! 4. `/v2/<name>/<resource>/<ref>` with a bare `<name>` gains the `library/`
//!    namespace on Docker Hub.
//! 5. Protected registry calls (manifests, blobs, tags) get a brokered token.
//!
//! A search query `q=library/<x>` loses its `library/` prefix on every target.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use url::{form_urlencoded, Url};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::resolver::{DisplayMode, RouteDecision};

static REPOSITORY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/v2/(.+?)/(manifests|blobs|tags)/(.*)$").expect("valid repository regex")
});

static BARE_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/v2/([^/]+)/(manifests|blobs|tags)/([^/]+)$").expect("valid bare name regex")
});

const LIBRARY_PREFIX: &str = "library/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Manifests,
    Blobs,
    Tags,
    TagsList,
    Token,
    Other,
}

/// A request path in registry terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPath {
    pub api_version: ApiVersion,
    /// Empty for `/v2/`, `/token` and paths outside a repository.
    pub repository: String,
    pub resource: Resource,
    pub reference: String,
}

impl RegistryPath {
    /// Classifies `path`. Returns `None` for paths outside the registry API.
    pub fn parse(path: &str) -> Option<Self> {
        let api_version = if path.starts_with("/v1/") {
            ApiVersion::V1
        } else {
            ApiVersion::V2
        };

        if path.contains("/token") {
            return Some(Self {
                api_version,
                repository: String::new(),
                resource: Resource::Token,
                reference: String::new(),
            });
        }

        match api_version {
            ApiVersion::V1 => Some(Self {
                api_version,
                repository: path
                    .strip_prefix("/v1/repositories/")
                    .map(|rest| rest.trim_end_matches('/').to_string())
                    .unwrap_or_default(),
                resource: Resource::Other,
                reference: String::new(),
            }),
            ApiVersion::V2 if path == "/v2" || path.starts_with("/v2/") => {
                let Some(caps) = REPOSITORY_REGEX.captures(path) else {
                    return Some(Self {
                        api_version,
                        repository: String::new(),
                        resource: Resource::Other,
                        reference: String::new(),
                    });
                };
                let reference = caps[3].to_string();
                let resource = match &caps[2] {
                    "manifests" => Resource::Manifests,
                    "blobs" => Resource::Blobs,
                    _ if reference == "list" => Resource::TagsList,
                    _ => Resource::Tags,
                };
                Some(Self {
                    api_version,
                    repository: caps[1].to_string(),
                    resource,
                    reference,
                })
            }
            ApiVersion::V2 => None,
        }
    }

    /// Whether this call needs a brokered token.
    pub fn is_protected(&self) -> bool {
        matches!(
            self.resource,
            Resource::Manifests | Resource::Blobs | Resource::Tags | Resource::TagsList
        )
    }
}

/// Where a request goes and under which credential policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Answer with landing content; never reaches an upstream.
    Landing,
    /// Token service passthrough.
    Token { url: Url },
    /// Protected registry call; the broker supplies the credential.
    Registry { url: Url, repository: String },
    /// Non-registry host (index service, web host). Credentials stripped.
    Passthrough { url: Url },
    /// Any other registry traffic. Client credentials pass through.
    Upstream { url: Url },
}

impl Dispatch {
    pub fn url(&self) -> Option<&Url> {
        match self {
            Dispatch::Landing => None,
            Dispatch::Token { url }
            | Dispatch::Registry { url, .. }
            | Dispatch::Passthrough { url }
            | Dispatch::Upstream { url } => Some(url),
        }
    }

    /// Host of the target URL, including a non-default port.
    pub fn target_host(&self) -> Option<String> {
        self.url().and_then(host_with_port)
    }
}

impl fmt::Display for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Landing => write!(f, "landing"),
            Dispatch::Token { url } => write!(f, "token {url}"),
            Dispatch::Registry { url, repository } => write!(f, "registry {repository} {url}"),
            Dispatch::Passthrough { url } => write!(f, "passthrough {url}"),
            Dispatch::Upstream { url } => write!(f, "upstream {url}"),
        }
    }
}

/// `host[:port]` of `url`.
pub fn host_with_port(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Prefixes a bare repository name with `library/`.
///
/// Only `/v2/<name>/<manifests|blobs|tags>/<ref>` with a single-segment name
/// is rewritten; namespaced names are returned unchanged.
pub fn apply_library_namespace(path: &str) -> String {
    match BARE_NAME_REGEX.captures(path) {
        Some(caps) => format!("/v2/{LIBRARY_PREFIX}{}/{}/{}", &caps[1], &caps[2], &caps[3]),
        None => path.to_string(),
    }
}

/// Strips one leading `library/` from the `q` search parameter.
///
/// `q=library/` on its own is left as is. Queries without a matching `q`
/// are returned byte-for-byte.
pub fn rewrite_search_query(query: &str) -> String {
    let needs_rewrite = form_urlencoded::parse(query.as_bytes()).any(|(key, value)| {
        key == "q" && value.starts_with(LIBRARY_PREFIX) && value != LIBRARY_PREFIX
    });
    if !needs_rewrite {
        return query.to_string();
    }

    let mut out = form_urlencoded::Serializer::new(String::new());
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key == "q" && value != LIBRARY_PREFIX {
            let stripped = value.strip_prefix(LIBRARY_PREFIX).unwrap_or(&*value);
            out.append_pair(&key, stripped);
        } else {
            out.append_pair(&key, &value);
        }
    }
    out.finish()
}

/// Decides the target of one request.
///
/// `path` is the inbound path, `query` the raw query string without `?`.
pub fn plan(
    path: &str,
    query: Option<&str>,
    decision: &RouteDecision,
    is_browser: bool,
    config: &GatewayConfig,
) -> GatewayResult<Dispatch> {
    if path == "/" && decision.display_mode.is_decoy() {
        return Ok(Dispatch::Landing);
    }

    let suffix = match query.filter(|q| !q.is_empty()) {
        Some(q) => format!("?{}", rewrite_search_query(q)),
        None => String::new(),
    };

    if path.contains("/token") {
        let url = config.auth_service_url(&format!("{path}{suffix}"))?;
        return Ok(Dispatch::Token { url });
    }

    if path.starts_with("/v1/") {
        let url = config.upstream_url(&config.index_host, &format!("{path}{suffix}"))?;
        return Ok(Dispatch::Passthrough { url });
    }

    let docker_hub = config.is_docker_hub(&decision.upstream_host);
    let path = if docker_hub {
        apply_library_namespace(path)
    } else {
        path.to_string()
    };

    if is_protected_path(&path) {
        let repository = RegistryPath::parse(&path)
            .map(|p| p.repository)
            .unwrap_or_default();
        if repository.is_empty() {
            return Err(GatewayError::InvalidPath(path));
        }
        let url = config.upstream_url(&decision.upstream_host, &format!("{path}{suffix}"))?;
        return Ok(Dispatch::Registry { url, repository });
    }

    if is_browser
        && docker_hub
        && decision.display_mode == DisplayMode::DecoySearch
        && !path.starts_with("/v2/")
    {
        let url = config.upstream_url(&config.hub_web_host, &format!("{path}{suffix}"))?;
        return Ok(Dispatch::Passthrough { url });
    }

    let url = config.upstream_url(&decision.upstream_host, &format!("{path}{suffix}"))?;
    Ok(Dispatch::Upstream { url })
}

fn is_protected_path(path: &str) -> bool {
    path.starts_with("/v2/")
        && (path.contains("/manifests/")
            || path.contains("/blobs/")
            || path.contains("/tags/")
            || path.ends_with("/tags/list"))
}
