//! HTTP server for the gateway.
//!
//! There are no routes of our own: every method and path lands in
//! [`gateway::handle`] through the router fallback.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::GatewayConfig;
use crate::gateway;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .fallback(gateway::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the gateway with optional graceful shutdown
pub async fn run_server_with_shutdown(
    config: GatewayConfig,
    addr: SocketAddr,
    shutdown_receiver: Option<oneshot::Receiver<()>>,
) -> Result<()> {
    info!(addr = %addr, upstream = %config.default_upstream, "Starting hub gateway");

    let state = AppState::new(config).context("Failed to initialize gateway state")?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    serve(listener, state, shutdown_receiver).await
}

/// Run the gateway in the foreground until the process is stopped
pub async fn run_server(config: GatewayConfig, addr: SocketAddr) -> Result<()> {
    run_server_with_shutdown(config, addr, None).await
}

/// Serves on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown_receiver: Option<oneshot::Receiver<()>>,
) -> Result<()> {
    let app = build_router(state);
    let local = listener.local_addr().context("Listener has no local address")?;
    info!("Hub gateway listening on {}", local);

    match shutdown_receiver {
        Some(shutdown_rx) => {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                    info!("Received shutdown signal, stopping hub gateway gracefully");
                })
                .await
                .context("Server failed")?;
        }
        None => {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    tokio::signal::ctrl_c().await.ok();
                    info!("Interrupted, stopping hub gateway");
                })
                .await
                .context("Server failed")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_config;
    use std::time::Duration;

    #[tokio::test]
    async fn shuts_down_on_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(test_config()).unwrap();
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(serve(listener, state, Some(rx)));

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = run_server(test_config(), addr).await.unwrap_err();
        assert!(err.to_string().contains("Failed to bind"));
    }
}
