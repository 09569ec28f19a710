use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "gateway",
    version,
    about = "Public-facing reverse tunnel gateway"
)]
struct Cli {
    /// Path to the gateway config file (YAML).
    #[arg(short = 'c', long = "config", env = "BURROW_CONFIG")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    burrow::app::run(cli.config).await
}
