use std::path::PathBuf;

use citygate_bridge::config::Config;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "citygate-bridge")]
#[command(about = "Citygate actuator bridge")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "citygate-bridge.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,citygate_bridge=info,citygate_rpc=info".to_owned());
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

    let listener = TcpListener::bind(config.server.rpc_addr).await?;
    info!(
        rpc_addr = %config.server.rpc_addr,
        device_timeout_secs = config.device.timeout_secs,
        "Starting citygate-bridge"
    );

    let server = citygate_bridge::server(listener, config.device.timeout());
    let cancel = CancellationToken::new();

    tokio::select! {
        _ = server.serve(cancel.clone()) => {
            info!("RPC server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
        }
    }

    info!("citygate-bridge shut down complete");
    Ok(())
}
