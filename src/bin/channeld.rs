//! channeld - channel lease service
//!
//! Command-line interface for the channel lease service:
//! - Serve the HTTP API with the background expiry sweep
//! - Inspect, sweep and compact a journaled store offline
//!
//! # Examples
//!
//! ```bash
//! # Start server
//! channeld serve --bind 0.0.0.0 --port 8080
//!
//! # Run one expiry sweep against the data directory (service stopped)
//! channeld sweep
//!
//! # List stored leases
//! channeld channels
//! ```

use channel_lease::config::{AppConfig, StorageBackend};
use channel_lease::server::{build_coordinator, run};
use channel_lease::storage::{ChannelStore, JournalStore, RecyclePool, SequenceAllocator};
use channel_lease::SystemClock;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Channel lease & index recycling service
#[derive(Parser, Debug)]
#[command(name = "channeld")]
#[command(version = channel_lease::VERSION)]
#[command(about = "Channel lease & index recycling service", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "CHANNELD_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory of the journaled store
    #[arg(long, global = true, env = "CHANNELD_DATA")]
    data_dir: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, env = "CHANNELD_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Log to stdout only
    #[arg(long, global = true)]
    no_file_log: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the lease service
    Serve(ServeArgs),

    /// Run one expiry sweep against the store (fails while the service holds the data dir)
    Sweep,

    /// Print every stored channel (fails while the service holds the data dir)
    Channels,

    /// Rewrite the journal as a snapshot (fails while the service holds the data dir)
    Compact,

    /// Show version
    Version,
}

/// Server arguments
#[derive(Args, Debug)]
struct ServeArgs {
    /// HTTP bind address
    #[arg(short, long, env = "CHANNELD_BIND")]
    bind: Option<String>,

    /// HTTP port
    #[arg(short, long, env = "CHANNELD_PORT")]
    port: Option<u16>,

    /// Keep leases in memory only
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);

    setup_logging(&config, &cli)?;

    match cli.command {
        Commands::Serve(args) => serve_command(config, args).await,
        Commands::Sweep => sweep_command(config).await,
        Commands::Channels => channels_command(config).await,
        Commands::Compact => compact_command(config),
        Commands::Version => {
            println!("channeld {}", channel_lease::VERSION);
            Ok(())
        }
    }
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.log_dir {
        config.log.log_dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(config: &AppConfig, cli: &Cli) -> anyhow::Result<()> {
    let log = &config.log;

    let level = if log.debug_mode {
        tracing::Level::DEBUG
    } else {
        log.level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO)
    };
    let ansi = !cli.no_color && (log.debug_mode || !log.json);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if log.json {
        layers.push(fmt::layer().json().with_writer(std::io::stdout).boxed());
    } else {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(ansi)
                .pretty()
                .boxed(),
        );
    }

    if !cli.no_file_log {
        std::fs::create_dir_all(&log.log_dir)?;
        let file_appender = RollingFileAppender::new(
            Rotation::DAILY,
            &log.log_dir,
            format!("{}.log", log.app_name),
        );
        layers.push(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    Ok(())
}

async fn serve_command(mut config: AppConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        config.server.http_addr = bind;
    }
    if let Some(port) = args.port {
        config.server.http_port = port;
    }
    if args.memory {
        config.storage.backend = StorageBackend::Memory;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    run(config, shutdown).await
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = token.cancelled() => return,
    }

    info!("Shutdown signal received");
    token.cancel();
}

fn require_journal(config: &AppConfig) -> anyhow::Result<()> {
    if config.storage.backend == StorageBackend::Memory {
        anyhow::bail!("The memory backend keeps no state between runs; nothing to operate on");
    }
    Ok(())
}

async fn sweep_command(config: AppConfig) -> anyhow::Result<()> {
    require_journal(&config)?;

    let coordinator = build_coordinator(&config, Arc::new(SystemClock))?;
    let report = coordinator.sweep().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn channels_command(config: AppConfig) -> anyhow::Result<()> {
    require_journal(&config)?;

    let store = JournalStore::open(&config.storage.data_dir)?;
    let now = chrono::Utc::now();
    let channels = store.list_all().await?;

    println!("{:>6}  {:<32}  {:<25}  {}", "INDEX", "ID", "EXPIRES AT", "STATE");
    for channel in &channels {
        println!(
            "{:>6}  {:<32}  {:<25}  {}",
            channel.index,
            channel.id,
            channel.expires_at.to_rfc3339(),
            if channel.is_expired(now) { "expired" } else { "active" }
        );
    }

    println!();
    println!("channels:    {}", channels.len());
    println!("recyclable:  {:?}", store.recyclable().await?);
    println!(
        "sequence:    {}",
        store.current_sequence(&config.lease.sequence_name).await?
    );

    Ok(())
}

fn compact_command(config: AppConfig) -> anyhow::Result<()> {
    require_journal(&config)?;

    let store = JournalStore::open(&config.storage.data_dir)?;
    store.compact()?;
    info!(path = ?store.journal_path(), "Journal compacted");
    Ok(())
}
