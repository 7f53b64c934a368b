//! relayd: chat relay daemon.
//!
//! Serves a [`ChatPipeline`](chatrelay::ChatPipeline) over HTTP so assistant
//! frontends can share one cache and one upstream budget.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatrelay::server::{self, Config, Secrets};

/// Chat relay daemon.
#[derive(Parser)]
#[command(name = "relayd")]
#[command(version = chatrelay::PKG_VERSION)]
#[command(about = "Caching chat relay for hosted inference APIs")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "CHATRELAY_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Override the listen address from the config file.
    #[arg(short, long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatrelay=info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let secrets = Secrets::load()?;

    let pipeline = server::build_pipeline(&config, &secrets).await?;

    let address = args.address.unwrap_or_else(|| config.server.address.clone());
    let addr: SocketAddr = address.parse().map_err(|e| {
        chatrelay::RelayError::Configuration(format!("Invalid address {address}: {e}"))
    })?;

    info!(
        version = chatrelay::PKG_VERSION,
        %addr,
        provider = pipeline.provider_name(),
        default_model = pipeline.default_model(),
        "relayd starting"
    );

    let app = server::router(Arc::new(pipeline));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
