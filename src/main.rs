use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use spanharvest::config::Config;
use spanharvest::deliver::HttpDeliverer;
use spanharvest::export::health::HealthMetrics;
use spanharvest::pipeline::Pipeline;

/// Streaming span aggregation and harvest pipeline.
#[derive(Parser)]
#[command(name = "spanharvest", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("spanharvest {}", version::full());
        return Ok(());
    }

    // Config is required for a pipeline run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing; the CLI flag wins over the config file.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(log_level).with_context(|| format!("invalid log level: {log_level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting spanharvest",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // Signal handling: first SIGINT/SIGTERM cancels everything.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }

        signal_cancel.cancel();
    });

    let health = if cfg.health.enabled {
        let health = Arc::new(HealthMetrics::new().context("building health metrics")?);
        health.start(&cfg.health.addr, cancel.child_token()).await?;
        Some(health)
    } else {
        None
    };

    let deliverer = Arc::new(HttpDeliverer::new(&cfg.delivery, health.clone())?);
    let mut pipeline = Pipeline::new(&cfg.pipeline, deliverer, health.clone());
    let feed = pipeline
        .take_feed()
        .context("taking the pipeline feed sender")?;
    pipeline.start()?;

    spawn_stdin_feed(feed, cancel.clone());

    // Run until a signal arrives or the feed is lost.
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        res = pipeline.wait() => res,
    };

    cancel.cancel();
    pipeline.shutdown().await?;
    if let Some(health) = &health {
        health.stop();
    }

    info!("spanharvest stopped");
    result
}

/// Forwards line-delimited records from stdin to the pipeline feed.
///
/// This is the process's message-bus adapter boundary: any bus consumer can
/// pipe records in, one JSON record per line. When stdin closes, the feed
/// sender drops and the pipeline treats the feed as lost.
fn spawn_stdin_feed(feed: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,

                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            continue;
                        }
                        if feed.send(line.into_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        info!("feed input closed");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "reading feed input");
                        return;
                    }
                }
            }
        }
    });
}
