mod commands;

use std::net::IpAddr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Types
// ============================================================================

/// Convobridge - reliable bridge between a chat transport and a helpdesk console
#[derive(Parser, Debug)]
#[command(version = convobridge::build_info::VERSION, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "convobridge.yaml", global = true)]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge and its HTTP API (default)
    Serve {
        /// Host to bind to (overrides config file)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate the configuration file and print a summary
    CheckConfig {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { host, port }) => commands::serve::run(&cli.config, host, port).await,
        Some(Commands::CheckConfig { format }) => commands::check::run(&cli.config, &format).await,
        None => commands::serve::run(&cli.config, None, None).await,
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
