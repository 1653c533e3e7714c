use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tcp_relay::{config::Config, config::ConfigOverrides, logging, Server};

/// How long in-flight connections get to drain after Ctrl-C
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Transparent TCP relay with PROXY protocol header injection
#[derive(Parser)]
#[command(name = "tcp-relay")]
#[command(about = "Relay TCP connections to a fixed upstream with an optional PROXY header")]
struct Cli {
    /// Path to an optional YAML configuration file
    #[arg(long, default_value = "config/relay.yml")]
    config: PathBuf,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).await?;
    config.apply_overrides(cli.overrides)?;

    logging::init_logging(
        &config.log_level,
        config.log_to_file,
        config.log_file_path.as_deref(),
    )?;

    let server = Server::new(config.relay_config()?);
    if let Some(header) = config.proxy_header()? {
        tracing::info!(
            "Injecting PROXY v{} header {} -> {}",
            u8::from(header.version),
            header.source,
            header.destination
        );
    }

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Signal handler error: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    if let Err(e) = server.listen_and_serve().await {
        tracing::error!("{}", e);
        return Err(e).context("Relay stopped");
    }

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, server.wait_for_connections())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timeout exceeded, dropping remaining connections");
    }
    tracing::info!("All connections closed");

    Ok(())
}
