//! # Application State
//!
//! [`AppState`] bundles the read-only configuration with the two shared
//! workers every request uses: the [`TokenBroker`] and the [`ProxyExecutor`].
//! Both hold the same `reqwest::Client`, so connection pools are shared.
//!
//! ```rust,no_run
//! use hub_gateway::{config::GatewayConfig, state::AppState};
//!
//! let state = AppState::new(GatewayConfig::default())?;
//! # Ok::<(), hub_gateway::GatewayError>(())
//! ```

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::proxy::{build_http_client, ProxyExecutor};
use crate::token::{MemoryTokenCache, TokenBroker, TokenCache};

/// Cheap to clone; everything lives behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub broker: Arc<TokenBroker>,
    pub executor: Arc<ProxyExecutor>,
}

impl AppState {
    /// Builds the HTTP client, an in-memory token cache and both workers.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let cache: Arc<dyn TokenCache> = Arc::new(MemoryTokenCache::new());
        Self::with_cache(config, Some(cache))
    }

    /// Like [`AppState::new`] with a caller-chosen token cache, or none.
    pub fn with_cache(
        config: GatewayConfig,
        cache: Option<Arc<dyn TokenCache>>,
    ) -> GatewayResult<Self> {
        let client = build_http_client(&config)?;
        let broker = TokenBroker::new(client.clone(), &config, cache);
        let executor = ProxyExecutor::new(client, &config);

        Ok(Self {
            config: Arc::new(config),
            broker: Arc::new(broker),
            executor: Arc::new(executor),
        })
    }
}
