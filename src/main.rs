//! Real-time call runtime binary entrypoint.

use call_runtime::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // tokio-tungstenite's rustls-tls backend needs a process-wide crypto
    // provider installed once before the first `wss://` connect to the
    // model gateway.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("call_runtime=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    cli::run().await
}
