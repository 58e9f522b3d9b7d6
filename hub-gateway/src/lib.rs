//! # Hub Gateway
//!
//! A stateless edge gateway in front of public container registries. Clients
//! pull through a single origin; the gateway picks the upstream registry,
//! rewrites repository paths, brokers anonymous pull tokens and streams
//! upstream responses back with rewritten headers.
//!
//! ## Key Modules
//!
//! - [`resolver`]: upstream selection from host prefix and query hints
//! - [`path`]: path classification, `library/` rewriting and dispatch planning
//! - [`token`]: pull-token brokering and caching
//! - [`proxy`]: outbound fetches with a bounded redirect loop
//! - [`response`]: challenge, location, CORS and cache rewriting
//! - [`gateway`]: the fallback handler tying the above together
//! - [`config`]: startup configuration and environment overrides
//! - [`error`]: the error taxonomy and its HTTP mapping

pub mod config;
pub mod decoy;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod path;
pub mod policy;
pub mod proxy;
pub mod resolver;
pub mod response;
pub mod server;
pub mod state;
pub mod token;

#[cfg(test)]
mod test_support;

pub use config::{GatewayConfig, Landing};
pub use error::{ErrorCode, GatewayError, GatewayResult};
pub use resolver::{resolve, DisplayMode, NamespaceSource, RouteDecision};
pub use server::{build_router, run_server, run_server_with_shutdown};
pub use state::AppState;
pub use token::{MemoryTokenCache, TokenBroker, TokenCache, TokenGrant};

pub const SERVICE_NAME: &str = "hub-gateway";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
