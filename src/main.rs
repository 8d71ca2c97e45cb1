//! logfed: hour-sharded log ingestion and federated search
//!
//! `logfed serve` runs one application instance, `logfed proxy` runs the
//! sharding proxy in front of several instances.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logfed::{
    config::{Config, LogFormat, QueueBackend, SearchMode},
    daemon::Daemon,
    proxy::{ProxyServer, ShardingProxy},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "logfed")]
#[command(about = "Hour-sharded log ingestion and federated full-text search")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "logfed.toml")]
    config: PathBuf,

    /// Verbosity level (overrides logging.level)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an application instance (HTTP API, queue, processor, index)
    Serve {
        /// Listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Shard path prefix
        #[arg(long)]
        base_prefix: Option<PathBuf>,

        /// Retention window in hours
        #[arg(long)]
        retention_hours: Option<u64>,

        /// Queue backend
        #[arg(long, value_enum)]
        queue: Option<QueueBackend>,

        /// NATS server URL (implies the nats backend)
        #[arg(long)]
        nats_url: Option<String>,
    },

    /// Run the sharding proxy
    Proxy {
        /// Listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Backend base URL; repeat for each backend
        #[arg(short, long = "backend")]
        backends: Vec<String>,

        /// How broadcast search responses are combined
        #[arg(long, value_enum)]
        search_mode: Option<SearchMode>,
    },

    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(default_value = "logfed.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    init_logging(&config, cli.verbose)?;

    if !cli.config.exists() && !matches!(cli.command, Commands::Init { .. }) {
        warn!(
            "Config file {} not found, using defaults",
            cli.config.display()
        );
    }

    let result = match cli.command {
        Commands::Serve {
            listen,
            base_prefix,
            retention_hours,
            queue,
            nats_url,
        } => {
            if let Some(addr) = listen {
                config.http.listen_addr = addr;
            }
            if let Some(prefix) = base_prefix {
                config.index.base_prefix = prefix;
            }
            if let Some(hours) = retention_hours {
                config.index.retention_hours = hours;
            }
            if let Some(backend) = queue {
                config.queue.backend = backend;
            }
            if let Some(url) = nats_url {
                config.queue.nats.url = url;
                config.queue.backend = QueueBackend::Nats;
            }
            serve(config).await
        }
        Commands::Proxy {
            listen,
            backends,
            search_mode,
        } => {
            if let Some(addr) = listen {
                config.proxy.listen_addr = addr;
            }
            if !backends.is_empty() {
                config.proxy.backends = backends;
            }
            if let Some(mode) = search_mode {
                config.proxy.search_mode = mode;
            }
            run_proxy(config).await
        }
        Commands::Init { path, force } => init_config(path, force),
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn init_logging(config: &Config, verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.logging.format {
        LogFormat::Text => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .json()
                .with_env_filter(filter)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    config.validate()?;
    info!("Starting logfed on {}", config.http.listen_addr);

    let daemon = Daemon::start(config).await?;
    daemon.run().await.context("Daemon shutdown failed")
}

async fn run_proxy(config: Config) -> Result<()> {
    config.validate()?;
    if config.proxy.backends.is_empty() {
        anyhow::bail!("No proxy backends configured; pass --backend or set proxy.backends");
    }

    let proxy = Arc::new(ShardingProxy::new(&config.proxy)?);
    let server = ProxyServer::new(config.proxy.listen_addr.clone(), proxy);
    let listener = server.bind().await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut handle = tokio::spawn(server.serve(listener, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
        result = &mut handle => {
            return result.context("Proxy task failed").and_then(|r| r);
        }
    }

    let _ = shutdown_tx.send(());
    tokio::time::timeout(config.http.shutdown_deadline(), handle)
        .await
        .context("Proxy did not stop before the shutdown deadline")?
        .context("Proxy task failed")?
}

fn init_config(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }

    let config = Config::default();
    std::fs::write(&path, config.to_toml()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Wrote default configuration to {}", path.display());
    println!();
    println!("Next steps:");
    println!("  logfed serve --config {}", path.display());
    println!("  logfed proxy --backend http://127.0.0.1:8080 --backend http://127.0.0.1:8081");
    Ok(())
}
