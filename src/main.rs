use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetsync::{agent, config};
use tracing_subscriber::{fmt, EnvFilter};

/// Telemetry ingestion and model consolidation for virtualization control
/// planes.
///
/// Serves the HTTP ingestion endpoints and runs the metric, event, datamap
/// and discovery drains until SIGINT or SIGTERM.
#[derive(Parser)]
#[command(name = "fleetsync", about)]
struct Cli {
    /// YAML config file. When omitted the built-in defaults apply: listen on
    /// `:8242` with log-only delivery and no static targets.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// tracing filter directive, e.g. `info` or `fleetsync::queue=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the release, commit and platform, then exit.
    Version,
}

/// Build metadata. The commit comes from the GIT_COMMIT env var at compile
/// time.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// `<release> (commit: <sha>, <os>/<arch>)`
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

    if let Some(Command::Version) = &cli.command {
        println!("fleetsync {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Without a config file the defaults apply: log-only delivery and no
    // static targets.
    let cfg = match &cli.config {
        Some(path) => config::Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = config::Config::default();
            cfg.validate()?;
            cfg
        }
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        config = ?cli.config,
        "starting fleetsync",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

/// Starts the agent, blocks until the first shutdown signal, then stops the
/// server before the drains so the final flush sees every accepted request.
async fn run(cfg: config::Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    let _ = shutdown_rx.await;
    agent.stop().await?;

    tracing::info!("fleetsync stopped");

    Ok(())
}
