//! Netium embed - run or probe a configuration from the command line

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use netium_embed::app::serve_metrics;
use netium_embed::bridge::{CoreManager, LatencyProber, ProbeOptions, TracingSink};
use netium_embed::config::set_env;
use netium_embed::error::Result;

#[derive(Parser)]
#[command(name = "netium-embed", version, about = "Embeddable Netium core")]
struct Cli {
    /// Engine environment override, repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", global = true)]
    env: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a configuration and run until Ctrl+C
    Run {
        #[arg(short, long)]
        config: PathBuf,

        /// Serve Prometheus metrics on this address
        #[arg(long, value_name = "ADDR")]
        metrics: Option<SocketAddr>,
    },
    /// Measure round trip latency through a configuration
    Ping {
        #[arg(short, long)]
        config: PathBuf,

        /// Probe URL; defaults to a 204 endpoint
        #[arg(long)]
        url: Option<String>,

        /// Overall request timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// Print library and core versions
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    for pair in &cli.env {
        match pair.split_once('=') {
            Some((key, value)) => set_env(key, value),
            None => {
                eprintln!("Ignoring malformed --env '{}', expected KEY=VALUE", pair);
            }
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Version => {
            println!("{}", CoreManager::version());
            Ok(())
        }
        Command::Run { config, metrics } => rt.block_on(run(&config, metrics)),
        Command::Ping {
            config,
            url,
            timeout,
        } => rt.block_on(ping(&config, url.as_deref().unwrap_or(""), timeout)),
    }
}

async fn run(path: &Path, metrics: Option<SocketAddr>) -> Result<()> {
    let raw = tokio::fs::read(path).await?;

    info!("Netium embed v{} starting...", env!("CARGO_PKG_VERSION"));
    let manager = CoreManager::new();
    manager.start(&raw, &TracingSink).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let metrics_task = match metrics {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            Some(tokio::spawn(serve_metrics(listener, shutdown_tx.subscribe())))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let _ = shutdown_tx.send(());
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    manager.stop().await?;

    info!("Goodbye!");
    Ok(())
}

async fn ping(path: &Path, url: &str, timeout: Option<u64>) -> Result<()> {
    let raw = tokio::fs::read(path).await?;

    let mut options = ProbeOptions::default();
    if let Some(secs) = timeout {
        options.request_timeout = Duration::from_secs(secs);
    }

    let prober = LatencyProber::new(options);
    let result = prober.measure(&raw, url).await;
    match result.error {
        None => {
            println!("{} ms", result.elapsed_ms);
            Ok(())
        }
        Some(e) => {
            error!("Probe failed: {}", e);
            println!("{}", result.elapsed_ms);
            Err(e)
        }
    }
}

