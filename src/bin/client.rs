use clap::Parser;

use burrow::client::{Client, ClientOptions};
use burrow::{config, logging};

#[derive(Debug, Parser)]
#[command(
    name = "client",
    version,
    about = "Reverse tunnel agent: exposes local backends through a gateway"
)]
struct Cli {
    /// Identifier this agent registers under; must match the gateway's
    /// listener configs.
    #[arg(long, env = "BURROW_CLIENT_ID")]
    client_id: String,

    /// Gateway tunnel address, host:port.
    #[arg(long, env = "BURROW_SERVER_ADDR")]
    server_addr: String,

    /// Log level (trace|debug|info|warn|error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init(&config::LoggingConfig {
        level: cli.log_level.clone(),
        ..Default::default()
    })?;

    let client = Client::new(ClientOptions {
        client_id: cli.client_id,
        server_addr: cli.server_addr,
    })?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("client: shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    client.run(shutdown_rx).await
}
