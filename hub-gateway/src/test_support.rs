//! Helpers shared by unit tests that need a live HTTP peer.

use axum::Router;
use tokio::net::TcpListener;

use crate::config::GatewayConfig;

/// Serves `app` on an ephemeral loopback port and returns its base URL.
pub async fn spawn_app(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Embedded defaults, reaching upstreams over plain HTTP.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        upstream_scheme: "http".to_string(),
        ..GatewayConfig::default()
    }
}
