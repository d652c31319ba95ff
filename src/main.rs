use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use iroh_metrics::core::Metric;
use rask::config::Config;
use rask::metrics::Metrics;
use rask::server::run_until_ctrl_c;

#[derive(Parser, Debug)]
#[clap(name = "rask", version, about = "Peer-to-peer file synchronization daemon")]
struct Cli {
    /// Path to the config file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Override the bind address from the config file
    #[clap(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Cli::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    init_metrics_collection(config.metrics_addr);
    run_until_ctrl_c(config).await
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn init_metrics_collection(metrics_addr: Option<SocketAddr>) {
    iroh_metrics::core::Core::init(|reg, metrics| {
        metrics.insert(Metrics::new(reg));
    });

    // doesn't start the server if the address is None
    if let Some(metrics_addr) = metrics_addr {
        tokio::spawn(async move {
            if let Err(err) = iroh_metrics::metrics::start_metrics_server(metrics_addr).await {
                eprintln!("failed to start metrics server: {err}");
            }
        });
    }
}
