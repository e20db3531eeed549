// crossbar binary entry point: load the cluster file, start one executor
// and listener per cluster, run until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use crossbar::config::Config;
use crossbar::executor::Executor;
use crossbar::server;

#[derive(Parser, Debug)]
#[command(name = "crossbar", about = "Multi-protocol cache proxy")]
struct Args {
    /// Path to the cluster configuration file.
    #[arg(long, short = 'c', default_value = "crossbar.toml")]
    config: PathBuf,

    /// Log filter when RUST_LOG is unset, e.g. `info` or `crossbar=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = Config::load(&args.config).context("loading configuration")?;
    let mut executors = Vec::new();
    for cluster in config.clusters {
        let cluster = Arc::new(cluster);
        let executor = Executor::start(Arc::clone(&cluster))
            .with_context(|| format!("starting cluster {}", cluster.name))?;
        executors.push(Arc::clone(&executor));
        tokio::spawn(async move {
            let name = cluster.name.clone();
            if let Err(err) = server::run(cluster, executor).await {
                tracing::error!(cluster = %name, error = %err, "listener failed");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    for executor in &executors {
        executor.close();
    }
    Ok(())
}
