//! mcpbridge - authenticated bridge to remote MCP servers
//!
#![doc = "Main entry point for the mcpbridge binary."]

use std::sync::Arc;

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcpbridge::cli::{Cli, Commands};
use mcpbridge::config::BridgeConfig;
use mcpbridge::manager::SessionManager;
use mcpbridge::server;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Load before tracing so the file and env can select JSON output.
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = BridgeConfig::load(config_path, &cli)?;

    init_tracing(config.json_logs);
    tracing::debug!("Using configuration from {}", config_path);

    config.validate()?;

    match cli.command {
        Commands::Serve { .. } => {
            tracing::info!("Starting bridge");
            let manager = Arc::new(SessionManager::from_config(&config).await?);
            server::serve(manager, &config.server.host, config.server.port).await?;
            Ok(())
        }
        Commands::Check => {
            let servers = config.server_configs()?;
            println!("Configuration OK: {}", config_path);
            println!(
                "Listening on {}:{}",
                config.server.host, config.server.port
            );
            if servers.is_empty() {
                println!("No servers configured");
            }
            for server in servers {
                println!(
                    "  {:<24} {:<16} {:<28} {}",
                    server.name,
                    server.transport.as_str(),
                    server.auth.auth_type().as_str(),
                    server.url
                );
            }
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcpbridge=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
