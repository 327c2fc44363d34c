use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::{self, SharedClock};
use crate::config::{Config, SinkMode, SinksConfig};
use crate::health::HealthMetrics;
use crate::pipeline::Pipeline;
use crate::scheduler::Scheduler;
use crate::server::Server;
use crate::sink::http::HttpExporter;
use crate::sink::log::LogExporter;
use crate::sink::Exporter;

/// Agent orchestrates all components: pipeline, delivery backend, HTTP
/// server and drain scheduler.
pub struct Agent {
    cfg: Config,
    pipeline: Arc<Pipeline>,
    exporter: Arc<Exporter>,
    server: Option<Server>,
    scheduler: Option<Scheduler>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent on the system clock.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_clock(cfg, clock::system())
    }

    /// Creates a new Agent reading time from `clock`.
    pub fn with_clock(cfg: Config, clock: SharedClock) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);
        let pipeline = Arc::new(Pipeline::new(cfg.pipeline_settings(), clock, health));
        let exporter = Arc::new(build_exporter(&cfg.sinks).context("creating exporter")?);

        Ok(Self {
            cfg,
            pipeline,
            exporter,
            server: None,
            scheduler: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the shared pipeline.
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Start all components. Returns the address the server bound to.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let started = Instant::now();

        // 1. Push static target configuration.
        for (target, target_cfg) in &self.cfg.targets {
            self.pipeline
                .apply_config(target, target_cfg)
                .with_context(|| format!("applying static config for {target}"))?;
        }
        info!(targets = self.cfg.targets.len(), "static configuration applied");

        // 2. Start the ingestion server.
        let server = Server::new(&self.cfg.server.addr, Arc::clone(&self.pipeline));
        let addr = server.start().await.context("starting ingestion server")?;
        self.server = Some(server);

        // 3. Start the drain scheduler.
        self.scheduler = Some(Scheduler::start(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.exporter),
            &self.cfg.scheduler,
            self.cfg.sinks.call_timeout,
            self.cancel.child_token(),
        ));

        info!(
            exporter = self.exporter.name(),
            addr = %addr,
            elapsed = ?started.elapsed(),
            "fleetsync started",
        );

        Ok(addr)
    }

    /// Stop ingestion, flush what is queued and shut down.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop accepting new telemetry first.
        if let Some(server) = &self.server {
            if let Err(e) = server.stop().await {
                error!(error = %e, "error stopping ingestion server");
            }
        }

        // Signal all background tasks to stop and wait for the final flush.
        self.cancel.cancel();
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.stop().await;
        }

        Ok(())
    }
}

/// Builds the configured delivery backend.
fn build_exporter(cfg: &SinksConfig) -> Result<Exporter> {
    match cfg.mode {
        SinkMode::Http => Ok(Exporter::Http(HttpExporter::new(cfg.http.clone())?)),
        SinkMode::Log => Ok(Exporter::Log(LogExporter::new())),
    }
}
