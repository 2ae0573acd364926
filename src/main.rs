use clap::Parser;
use mcp_broker::config;
use mcp_broker::registry::{BrokerRegistry, INIT_TIMEOUT};
use mcp_broker::server::{self, BrokerServer, DEFAULT_HOST, DEFAULT_PORT};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "mcp-broker",
    version,
    about = "Local MCP tool broker: aggregates tool providers behind a loopback TCP protocol"
)]
struct Cli {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Provider configuration file; defaults to ./mcp_config.json
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let providers = match config::load_providers(cli.config.as_deref()) {
        Ok(providers) => providers,
        Err(err) => {
            error!(%err, "Failed to load broker configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(count = providers.len(), "Loaded provider configuration");

    let registry = Arc::new(BrokerRegistry::initialize_all(providers, INIT_TIMEOUT).await);

    let broker = match BrokerServer::bind(registry, &cli.host, cli.port).await {
        Ok(broker) => broker,
        Err(err) => {
            error!(%err, "Failed to bind broker listener");
            return ExitCode::FAILURE;
        }
    };
    broker.log_startup_summary();
    broker.run_until(server::shutdown_signal()).await;
    ExitCode::SUCCESS
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
