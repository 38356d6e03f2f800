//! CLI entrypoint for the call runtime binary.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::RuntimeConfig;
use crate::persistence::LoggingPersistence;
use crate::server::{self, ServerState};

#[derive(Parser)]
#[command(name = "call-runtime")]
#[command(about = "Real-time AI voice-agent call runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the carrier WebSocket + campaign control server (default).
    Serve {
        /// Address to bind the HTTP/WebSocket server on.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to bind the HTTP/WebSocket server on.
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Load configuration and print it (secrets redacted) without starting the server.
    ConfigShow,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve { host: "0.0.0.0".to_string(), port: 8080 }) {
        Commands::Serve { host, port } => serve(&host, port).await,
        Commands::ConfigShow => config_show(),
    }
}

async fn serve(host: &str, port: u16) -> Result<()> {
    let config = RuntimeConfig::load()?;
    let persistence = Arc::new(LoggingPersistence);
    let state = ServerState::new(config, persistence);
    server::start(host, port, state).await
}

fn config_show() -> Result<()> {
    let config = RuntimeConfig::load()?;
    let mut redacted = config.clone();
    redacted.model_gateway.api_key = redacted.model_gateway.api_key.map(|_| "***".to_string());
    redacted.carrier.carrier_a_auth_token = redacted.carrier.carrier_a_auth_token.map(|_| "***".to_string());
    redacted.carrier.carrier_b_api_key = redacted.carrier.carrier_b_api_key.map(|_| "***".to_string());
    println!("{}", toml::to_string_pretty(&redacted)?);
    Ok(())
}
