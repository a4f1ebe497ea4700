use std::path::PathBuf;

use citygate_gateway::{Config, Gateway};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "citygate-gateway")]
#[command(about = "Citygate IoT gateway")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "citygate-gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,citygate_gateway=info,citygate_rpc=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(
        tcp_addr = %config.server.tcp_addr,
        udp_addr = %config.server.udp_addr,
        mqtt_enabled = config.mqtt.enabled,
        "Starting citygate-gateway"
    );

    let gateway = Gateway::bind(config).await?;
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                cancel_for_signal.cancel();
            }
            Err(e) => warn!(error = %e, "Could not listen for Ctrl+C"),
        }
    });

    gateway.run(cancel).await?;

    info!("citygate-gateway shut down complete");
    Ok(())
}
