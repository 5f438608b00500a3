//! Command-line interface definition for mcpbridge
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to run the bridge and to check a configuration.

use clap::{Parser, Subcommand};

/// mcpbridge - authenticated bridge to remote MCP servers
///
/// Exposes a set of remote Model Context Protocol servers over a plain
/// HTTP API, handling OAuth and session management on the caller's behalf.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcpbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for mcpbridge
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the HTTP bridge
    Serve {
        /// Override the listen address from config
        #[arg(long)]
        host: Option<String>,

        /// Override the listen port from config
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Load and validate the configuration, then list the configured servers
    Check,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            json_logs: false,
            command: Commands::Serve {
                host: None,
                port: None,
            },
        }
    }
}
