//! Standalone gateway CLI binary

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hub_gateway::{run_server, GatewayConfig, DEFAULT_HOST, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "hub-gateway")]
#[command(about = "Container registry edge gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway in the foreground
    Start {
        /// Host to bind to
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,

        /// Port to bind to
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// JSON configuration file; embedded defaults when absent
        #[arg(long, default_value = "gateway.json")]
        config: PathBuf,
    },

    /// Print the effective configuration after environment overrides
    CheckConfig {
        /// JSON configuration file; embedded defaults when absent
        #[arg(long, default_value = "gateway.json")]
        config: PathBuf,
    },
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    let config = GatewayConfig::load_or_default(path)
        .with_context(|| format!("Failed to load {}", path.display()))?
        .with_env();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = hub_logging::init_from_env();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { host, port, config } => {
            let config = load_config(&config)?;
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("Invalid socket address {host}:{port}"))?;
            run_server(config, addr).await
        }

        Commands::CheckConfig { config } => {
            let config = load_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
