use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use presence_cluster::{ClusterConfig, ClusterMetrics, ClusterState, TcpTransport, serve};

/// Run one directory or service node of the presence cluster.
#[derive(Parser, Debug)]
#[command(name = "presence-node", version, about)]
struct Args {
    /// JSON configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept cluster calls and pipes on. Defaults to
    /// `0.0.0.0:<port>` from the configuration.
    #[arg(short, long)]
    listen: Option<String>,
}

fn init_logging(config: &ClusterConfig) {
    let default = if config.logging { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(false)
        .init();
}

async fn run(args: Args) -> presence_cluster::Result<()> {
    let config = match &args.config {
        Some(path) => ClusterConfig::load(path)?,
        None => ClusterConfig::default(),
    };
    init_logging(&config);

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.port));
    let listener = TcpListener::bind(&listen).await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        %listen,
        host = %config.self_host(),
        "starting presence node"
    );

    let metrics = Arc::new(ClusterMetrics::new());
    let transport = Arc::new(TcpTransport::new(metrics.clone()));
    let state = ClusterState::new(config, transport, metrics, None);
    state.start();

    let server = tokio::spawn(serve(listener, state.clone()));
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    state.shutdown();
    match server.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "listener task failed");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        // Logging may not be up yet when the configuration is rejected.
        eprintln!("presence-node: {e}");
        std::process::exit(1);
    }
}
