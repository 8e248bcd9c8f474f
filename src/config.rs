use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the spanharvest pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Aggregation and harvest scheduling.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Downstream delivery endpoints.
    pub delivery: DeliveryConfig,

    /// Prometheus health metrics server.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Which incoming credential field becomes the destination key for a
/// pipeline variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialField {
    LicenseKey,
    InsightsKey,
}

/// Aggregation and harvest scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// How often accumulated state is cut and delivered. Default: 10s.
    #[serde(default = "default_harvest_period", with = "humantime_serde")]
    pub harvest_period: Duration,

    /// How soon to re-check after a timer expiry found the store empty.
    /// Default: 1s.
    #[serde(default = "default_idle_recheck", with = "humantime_serde")]
    pub idle_recheck: Duration,

    /// Ingest feed channel capacity. Default: 65536.
    #[serde(default = "default_feed_buffer")]
    pub feed_buffer: usize,

    /// Tag names eligible to become metric identity attributes, in match
    /// order. Tags outside this list are dropped at ingest.
    #[serde(default)]
    pub attribute_whitelist: Vec<String>,

    /// Credential field keying metric-variant destinations.
    /// Default: insights_key.
    #[serde(default = "default_metric_credential")]
    pub metric_credential: CredentialField,

    /// Credential field keying span-variant destinations.
    /// Default: license_key.
    #[serde(default = "default_span_credential")]
    pub span_credential: CredentialField,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            harvest_period: default_harvest_period(),
            idle_recheck: default_idle_recheck(),
            feed_buffer: default_feed_buffer(),
            attribute_whitelist: Vec::new(),
            metric_credential: default_metric_credential(),
            span_credential: default_span_credential(),
        }
    }
}

/// Downstream delivery endpoints and transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Metric summaries endpoint (insights-key destinations).
    pub metric_endpoint: String,

    /// Span pass-through endpoint (license-key destinations).
    pub span_endpoint: String,

    /// Per-request timeout. A timed-out delivery counts as failed and the
    /// batch is retried next cycle. Default: 10s.
    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Whether to serve health metrics. Default: true.
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    /// Listen address for `/metrics` and `/healthz`. Default: 127.0.0.1:9102.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.harvest_period.is_zero() {
            bail!("pipeline.harvest_period must be > 0");
        }
        if self.pipeline.idle_recheck.is_zero() {
            bail!("pipeline.idle_recheck must be > 0");
        }
        if self.pipeline.idle_recheck > self.pipeline.harvest_period {
            bail!("pipeline.idle_recheck must not exceed pipeline.harvest_period");
        }
        if self.pipeline.feed_buffer == 0 {
            bail!("pipeline.feed_buffer must be > 0");
        }

        let mut seen = HashSet::new();
        for name in &self.pipeline.attribute_whitelist {
            if !seen.insert(name.as_str()) {
                bail!("pipeline.attribute_whitelist has duplicate entry {name:?}");
            }
        }

        if self.delivery.metric_endpoint.is_empty() {
            bail!("delivery.metric_endpoint is required");
        }
        if self.delivery.span_endpoint.is_empty() {
            bail!("delivery.span_endpoint is required");
        }
        if self.delivery.timeout.is_zero() {
            bail!("delivery.timeout must be > 0");
        }

        if self.health.enabled {
            self.health
                .addr
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid health.addr {:?}", self.health.addr))?;
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_harvest_period() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_recheck() -> Duration {
    Duration::from_secs(1)
}

fn default_feed_buffer() -> usize {
    65536
}

fn default_metric_credential() -> CredentialField {
    CredentialField::InsightsKey
}

fn default_span_credential() -> CredentialField {
    CredentialField::LicenseKey
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_addr() -> String {
    "127.0.0.1:9102".to_string()
}
