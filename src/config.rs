use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::discovery::DiscoveryRule;
use crate::pipeline::PipelineSettings;
use crate::queue::QueueTuning;
use crate::registry::TargetConfig;
use crate::scheduler::Task;

/// Top-level configuration for the fleetsync collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Ingestion and diagnostics HTTP server.
    #[serde(default)]
    pub server: ServerConfig,

    /// Drain task intervals.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Default consolidation queue tuning for targets without their own.
    #[serde(default)]
    pub queue: QueueTuning,

    /// Sub-resource discovery.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Delivery backends.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Target systems pushed at startup, keyed by target system id.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":8242".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Drain task intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Default: 60s.
    #[serde(default = "default_task_interval", with = "humantime_serde")]
    pub metric_flush_interval: Duration,

    /// Default: 60s.
    #[serde(default = "default_task_interval", with = "humantime_serde")]
    pub event_flush_interval: Duration,

    /// Default: 60s.
    #[serde(default = "default_task_interval", with = "humantime_serde")]
    pub datamap_flush_interval: Duration,

    /// Default: 60s.
    #[serde(default = "default_task_interval", with = "humantime_serde")]
    pub discovery_interval: Duration,
}

impl SchedulerConfig {
    /// Returns the configured interval of `task`.
    pub fn interval(&self, task: Task) -> Duration {
        match task {
            Task::MetricFlush => self.metric_flush_interval,
            Task::EventFlush => self.event_flush_interval,
            Task::DatamapFlush => self.datamap_flush_interval,
            Task::SubresourceDiscovery => self.discovery_interval,
        }
    }
}

/// Sub-resource discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// How long an unmatched candidate is retried. Default: 20m.
    #[serde(default = "default_discovery_horizon", with = "humantime_serde")]
    pub horizon: Duration,

    /// Matching rules, tried in order. Default: one rule for vNICs.
    #[serde(default = "default_discovery_rules")]
    pub rules: Vec<DiscoveryRule>,
}

/// Selects the delivery backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    Http,
    #[default]
    Log,
}

/// Delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinksConfig {
    /// Backend to deliver to. Default: log.
    #[serde(default)]
    pub mode: SinkMode,

    /// Upper bound on one collaborator call. Default: 30s.
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,

    /// HTTP backend configuration.
    #[serde(default)]
    pub http: HttpSinkConfig,
}

/// HTTP backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSinkConfig {
    /// Endpoint receiving one metric write per request.
    #[serde(default)]
    pub metrics_url: String,

    /// Endpoint receiving one event per request.
    #[serde(default)]
    pub events_url: String,

    /// Endpoint receiving one model batch per request.
    #[serde(default)]
    pub model_url: String,

    /// Custom HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Enable HTTP keep-alive. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_addr() -> String {
    ":8242".to_string()
}

fn default_task_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_discovery_horizon() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_discovery_rules() -> Vec<DiscoveryRule> {
    vec![DiscoveryRule::default()]
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

// --- Default trait implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            queue: QueueTuning::default(),
            discovery: DiscoveryConfig::default(),
            sinks: SinksConfig::default(),
            targets: BTreeMap::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            metric_flush_interval: default_task_interval(),
            event_flush_interval: default_task_interval(),
            datamap_flush_interval: default_task_interval(),
            discovery_interval: default_task_interval(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            horizon: default_discovery_horizon(),
            rules: default_discovery_rules(),
        }
    }
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            mode: SinkMode::default(),
            call_timeout: default_call_timeout(),
            http: HttpSinkConfig::default(),
        }
    }
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            metrics_url: String::new(),
            events_url: String::new(),
            model_url: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            request_timeout: default_request_timeout(),
            keep_alive: true,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.is_empty() {
            bail!("server.addr is required");
        }

        for task in Task::ALL {
            if self.scheduler.interval(task).is_zero() {
                bail!("scheduler interval for {} must be positive", task.name());
            }
        }

        validate_tuning("queue", &self.queue)?;

        if self.discovery.horizon.is_zero() {
            bail!("discovery.horizon must be positive");
        }
        for (i, rule) in self.discovery.rules.iter().enumerate() {
            if rule.meter_prefix.is_empty() {
                bail!("discovery.rules[{i}].meter_prefix is required");
            }
            if rule.parent_kind.is_empty() {
                bail!("discovery.rules[{i}].parent_kind is required");
            }
            if rule.child_id_prefix.is_empty() {
                bail!("discovery.rules[{i}].child_id_prefix is required");
            }
        }

        if self.sinks.call_timeout.is_zero() {
            bail!("sinks.call_timeout must be positive");
        }

        if self.sinks.mode == SinkMode::Http {
            let http = &self.sinks.http;
            if http.metrics_url.is_empty() {
                bail!("sinks.http.metrics_url is required when mode is http");
            }
            if http.events_url.is_empty() {
                bail!("sinks.http.events_url is required when mode is http");
            }
            if http.model_url.is_empty() {
                bail!("sinks.http.model_url is required when mode is http");
            }
            if http.request_timeout.is_zero() {
                bail!("sinks.http.request_timeout must be positive");
            }

            let compression = http.compression.as_str();
            match compression {
                "none" | "" | "gzip" | "zstd" | "zlib" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        for (name, target) in &self.targets {
            if name.is_empty() {
                bail!("target system id must not be empty");
            }
            validate_tuning(&format!("targets.{name}.queue"), &target.queue)?;
            for ds in &target.datasources {
                if ds.resource_id.is_empty() {
                    bail!("targets.{name}: datasource resource_id is required");
                }
            }
        }

        Ok(())
    }

    /// Pipeline settings derived from this configuration.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            default_tuning: self.queue,
            discovery_rules: self.discovery.rules.clone(),
            discovery_horizon: self.discovery.horizon,
        }
    }
}

fn validate_tuning(prefix: &str, tuning: &QueueTuning) -> Result<()> {
    tuning.validate().map_err(|e| anyhow!("{prefix}.{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DatasourceConfig;

    fn valid_config() -> Config {
        Config {
            sinks: SinksConfig {
                mode: SinkMode::Http,
                http: HttpSinkConfig {
                    metrics_url: "http://localhost:8080/metrics".to_string(),
                    events_url: "http://localhost:8080/events".to_string(),
                    model_url: "http://localhost:8080/model".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.server.addr, ":8242");
        assert_eq!(cfg.scheduler.datamap_flush_interval, Duration::from_secs(60));
        assert_eq!(cfg.queue.shortlived, Duration::from_secs(40));
        assert_eq!(cfg.queue.delete_blacklist, Duration::from_secs(600));
        assert_eq!(cfg.queue.update_consolidate, Duration::from_secs(40));
        assert_eq!(cfg.discovery.horizon, Duration::from_secs(1200));
        assert_eq!(cfg.discovery.rules.len(), 1);
        assert_eq!(cfg.sinks.mode, SinkMode::Log);
        assert_eq!(cfg.sinks.http.compression, "gzip");
        assert!(cfg.sinks.http.keep_alive);
    }

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().expect("defaults should validate");
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().expect("should be valid");
    }

    #[test]
    fn test_http_mode_requires_urls() {
        let mut cfg = valid_config();
        cfg.sinks.http.model_url.clear();
        let err = cfg.validate().expect_err("missing model_url");
        assert!(err.to_string().contains("model_url"));
    }

    #[test]
    fn test_invalid_compression() {
        let mut cfg = valid_config();
        cfg.sinks.http.compression = "brotli".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut cfg = valid_config();
        cfg.scheduler.event_flush_interval = Duration::ZERO;
        let err = cfg.validate().expect_err("zero interval");
        assert!(err.to_string().contains("event-flush"));
    }

    #[test]
    fn test_zero_update_consolidate_allowed() {
        let mut cfg = valid_config();
        cfg.queue.update_consolidate = Duration::ZERO;
        cfg.validate().expect("immediate update release is allowed");
    }

    #[test]
    fn test_oversized_queue_window_rejected() {
        let mut cfg = valid_config();
        cfg.queue.delete_blacklist = Duration::from_secs(365 * 24 * 60 * 60);
        let err = cfg.validate().expect_err("window too long");
        assert!(err
            .to_string()
            .starts_with("queue.delete_blacklist must be at most"));
    }

    #[test]
    fn test_target_datasource_requires_resource_id() {
        let mut cfg = valid_config();
        cfg.targets.insert(
            "cloud1".to_string(),
            TargetConfig {
                datasources: vec![DatasourceConfig {
                    resource_id: String::new(),
                    component: "server-1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
server:
  addr: "127.0.0.1:9000"
scheduler:
  metric_flush_interval: 10s
queue:
  shortlived: 5s
  delete_blacklist: 1m
  update_consolidate: 0s
discovery:
  horizon: 5m
sinks:
  mode: http
  call_timeout: 3s
  http:
    metrics_url: "http://sink/metrics"
    events_url: "http://sink/events"
    model_url: "http://sink/model"
    compression: zstd
    headers:
      Authorization: "Bearer token"
targets:
  cloud1:
    event_types:
      - compute.instance.create.end
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        cfg.validate().expect("valid config");

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.server.addr, "127.0.0.1:9000");
        assert_eq!(cfg.scheduler.metric_flush_interval, Duration::from_secs(10));
        assert_eq!(cfg.scheduler.event_flush_interval, Duration::from_secs(60));
        assert_eq!(cfg.queue.shortlived, Duration::from_secs(5));
        assert_eq!(cfg.queue.update_consolidate, Duration::ZERO);
        assert_eq!(cfg.discovery.horizon, Duration::from_secs(300));
        assert_eq!(cfg.discovery.rules[0].meter_prefix, "network.");
        assert_eq!(cfg.sinks.mode, SinkMode::Http);
        assert_eq!(cfg.sinks.call_timeout, Duration::from_secs(3));
        assert_eq!(cfg.sinks.http.compression, "zstd");
        assert_eq!(
            cfg.sinks.http.headers.get("Authorization").map(String::as_str),
            Some("Bearer token")
        );
        assert_eq!(
            cfg.targets["cloud1"].event_types,
            vec!["compute.instance.create.end".to_string()]
        );

        let settings = cfg.pipeline_settings();
        assert_eq!(settings.default_tuning.shortlived, Duration::from_secs(5));
        assert_eq!(settings.discovery_horizon, Duration::from_secs(300));
    }
}
