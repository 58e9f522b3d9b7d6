//! Pull-token brokering against the registry token service.
//!
//! The broker asks the fixed token service for an anonymous token scoped to
//! exactly one repository with the `pull` action, and hands it back as a
//! [`TokenGrant`]. Grants may be reused for a short time through a
//! [`TokenCache`]; a miss racing with another request for the same repository
//! simply fetches twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::headers::token_request_headers;

/// Seconds shaved off a token's advertised lifetime before caching it.
const EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

/// `repository:<repository>:pull`
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{repository}:pull")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub repository: String,
    pub scope: String,
}

impl TokenKey {
    pub fn pull(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
            scope: pull_scope(repository),
        }
    }
}

/// A bearer token for one repository's pull scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub repository: String,
    pub scope: String,
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

impl TokenGrant {
    pub fn key(&self) -> TokenKey {
        TokenKey {
            repository: self.repository.clone(),
            scope: self.scope.clone(),
        }
    }

    /// `Bearer <token>` as a header value.
    pub fn authorization(&self) -> GatewayResult<HeaderValue> {
        HeaderValue::from_str(&format!("Bearer {}", self.token)).map_err(|_| {
            GatewayError::AuthUpstream("token contains characters invalid in a header".to_string())
        })
    }
}

/// Short-lived grant storage keyed by `(repository, scope)`.
#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get(&self, key: &TokenKey) -> Option<TokenGrant>;
    async fn put(&self, grant: TokenGrant, ttl: Duration);
}

struct CachedGrant {
    grant: TokenGrant,
    expires_at: Instant,
}

/// In-process [`TokenCache`]. Expired entries are dropped on write.
#[derive(Default)]
pub struct MemoryTokenCache {
    entries: RwLock<HashMap<TokenKey, CachedGrant>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn get(&self, key: &TokenKey) -> Option<TokenGrant> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.grant.clone())
    }

    async fn put(&self, grant: TokenGrant, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, cached| cached.expires_at > now);
        entries.insert(
            grant.key(),
            CachedGrant {
                grant,
                expires_at: now + ttl,
            },
        );
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct TokenBroker {
    client: Client,
    auth_url: String,
    service: String,
    timeout: Duration,
    cache: Option<Arc<dyn TokenCache>>,
    cache_ttl: Duration,
}

impl TokenBroker {
    pub fn new(client: Client, config: &GatewayConfig, cache: Option<Arc<dyn TokenCache>>) -> Self {
        Self {
            client,
            auth_url: config.auth_url.trim_end_matches('/').to_string(),
            service: config.auth_service.clone(),
            timeout: config.request_timeout(),
            cache,
            cache_ttl: config.token_cache_ttl(),
        }
    }

    fn token_url(&self, scope: &str) -> GatewayResult<Url> {
        let mut url = Url::parse(&format!("{}/token", self.auth_url))
            .map_err(|e| GatewayError::Config(format!("auth_url {:?}: {e}", self.auth_url)))?;
        url.query_pairs_mut()
            .append_pair("service", &self.service)
            .append_pair("scope", scope);
        Ok(url)
    }

    /// Returns a pull token for `repository`.
    ///
    /// Only User-Agent and the Accept family are taken from `passthrough`;
    /// client credentials never reach the token service.
    pub async fn acquire_token(
        &self,
        repository: &str,
        passthrough: &HeaderMap,
    ) -> GatewayResult<TokenGrant> {
        let key = TokenKey::pull(repository);

        if let Some(cache) = self.cache_enabled() {
            if let Some(grant) = cache.get(&key).await {
                debug!(repository = %repository, "Using cached registry token");
                return Ok(grant);
            }
        }

        let url = self.token_url(&key.scope)?;
        debug!(url = %url, "Requesting registry token");

        let request = self
            .client
            .get(url)
            .headers(token_request_headers(passthrough))
            .send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| GatewayError::AuthUpstream("token service timed out".to_string()))?
            .map_err(|e| {
                warn!(error = %e, "Failed to reach token service");
                GatewayError::AuthUpstream(format!("token service unreachable: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::AuthUpstream(format!(
                "token service returned {status}"
            )));
        }

        let body: TokenResponse = tokio::time::timeout(self.timeout, response.json())
            .await
            .map_err(|_| GatewayError::AuthUpstream("token body timed out".to_string()))?
            .map_err(|e| GatewayError::AuthUpstream(format!("unparsable token response: {e}")))?;

        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::AuthUpstream("token response had no token".to_string()))?;

        let grant = TokenGrant {
            repository: key.repository,
            scope: key.scope,
            token,
            issued_at: Utc::now(),
        };
        info!(repository = %repository, scope = %grant.scope, "Obtained registry token");

        if let Some(cache) = self.cache_enabled() {
            let ttl = match body.expires_in {
                Some(secs) => self
                    .cache_ttl
                    .min(Duration::from_secs(secs.saturating_sub(EXPIRY_SAFETY_MARGIN_SECS))),
                None => self.cache_ttl,
            };
            if !ttl.is_zero() {
                cache.put(grant.clone(), ttl).await;
            }
        }

        Ok(grant)
    }

    fn cache_enabled(&self) -> Option<&Arc<dyn TokenCache>> {
        self.cache.as_ref().filter(|_| !self.cache_ttl.is_zero())
    }
}
