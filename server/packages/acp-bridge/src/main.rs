use std::path::PathBuf;
use std::time::Duration;

use acp_bridge::provider::ProviderRegistry;
use acp_bridge::{
    duration_from_env_ms, run_server, BridgeConfig, COMMANDS_WAIT_ENV, DEFAULT_PORT,
    REQUEST_TIMEOUT_ENV,
};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "acp-bridge")]
#[command(about = "Loopback HTTP bridge to ACP agent subprocesses", version)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Working directory for agents, sessions and terminals.
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Path to a provider registry JSON file.
    #[arg(long, conflicts_with = "providers_json")]
    providers: Option<PathBuf>,

    /// Provider registry as an inline JSON document.
    #[arg(long)]
    providers_json: Option<String>,

    #[arg(long)]
    rpc_timeout_ms: Option<u64>,

    #[arg(long)]
    commands_wait_ms: Option<u64>,
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "acp-bridge failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let registry = match (&cli.providers, &cli.providers_json) {
        (Some(path), _) => ProviderRegistry::from_file(path)?,
        (None, Some(blob)) => ProviderRegistry::from_blob(blob)?,
        (None, None) => ProviderRegistry::default(),
    };
    if registry.is_empty() {
        tracing::warn!("no providers configured; only inline providers can be used");
    }

    let defaults = BridgeConfig::default();
    let config = BridgeConfig {
        host: cli.host,
        port: cli.port,
        project_root: cli.project_root.unwrap_or(defaults.project_root),
        request_timeout: cli
            .rpc_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| duration_from_env_ms(REQUEST_TIMEOUT_ENV, defaults.request_timeout)),
        commands_wait: cli
            .commands_wait_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| duration_from_env_ms(COMMANDS_WAIT_ENV, defaults.commands_wait)),
        ..defaults
    };
    tracing::info!(
        project_root = %config.project_root.display(),
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        providers = registry.iter().count(),
        "starting acp-bridge"
    );

    run_server(config, registry).await?;
    Ok(())
}
