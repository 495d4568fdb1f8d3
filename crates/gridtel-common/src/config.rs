//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_database_path() -> PathBuf {
    PathBuf::from("target/data/grid_data.sqlite3")
}

fn default_api_listen() -> SocketAddr {
    "0.0.0.0:8000".parse().expect("valid default api address")
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_owned(),
        "http://127.0.0.1:3000".to_owned(),
    ]
}

fn default_subscriber_capacity() -> usize {
    256
}

fn default_num_records() -> usize {
    10
}

fn default_max_batch() -> usize {
    10_000
}

fn default_anomaly_probability() -> f64 {
    0.1
}

fn default_report_endpoint() -> Url {
    Url::parse(
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent",
    )
    .expect("valid default report endpoint")
}

fn default_report_key_env() -> String {
    "GRIDTEL_REPORT_API_KEY".to_owned()
}

fn default_report_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9898"
        .parse()
        .expect("valid default metrics address")
}

/// Primary configuration object for the telemetry daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "GRIDTEL_CONFIG";

    /// Load configuration together with the effective source path, respecting the
    /// `GRIDTEL_CONFIG` override. Built-in defaults are used only when no candidate
    /// exists and `allow_defaults` is set.
    pub fn load_with_source<P: AsRef<Path>>(
        candidates: &[P],
        allow_defaults: bool,
    ) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        if allow_defaults {
            let config = AppConfig::default();
            config.validate()?;
            return Ok(LoadedAppConfig {
                config,
                source: None,
            });
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.broadcast.validate()?;
        self.ingest.validate()?;
        self.generator.validate()?;
        self.report.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
            cors_origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Messages queued per subscriber before it is considered stuck and dropped.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl BroadcastConfig {
    pub fn validate(&self) -> Result<()> {
        if self.subscriber_capacity == 0 {
            return Err(anyhow!("broadcast.subscriber_capacity must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Batch size used when `/generate` is called without `num_records`.
    #[serde(default = "default_num_records")]
    pub default_num_records: usize,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_num_records: default_num_records(),
            max_batch: default_max_batch(),
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch == 0 {
            return Err(anyhow!("ingest.max_batch must be at least 1"));
        }
        if self.default_num_records > self.max_batch {
            return Err(anyhow!(
                "ingest.default_num_records ({}) exceeds ingest.max_batch ({})",
                self.default_num_records,
                self.max_batch
            ));
        }
        Ok(())
    }
}

/// Closed interval `[min, max]` a generated value is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueBand {
    pub min: f64,
    pub max: f64,
}

impl ValueBand {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err(anyhow!(
                "generator band '{}' must satisfy min <= max (got {} .. {})",
                name,
                self.min,
                self.max
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Fixed seed for reproducible runs; entropy is used when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// JSON scenario replayed instead of random generation.
    #[serde(default)]
    pub scenario: Option<PathBuf>,
    #[serde(default = "default_anomaly_probability")]
    pub anomaly_probability: f64,
    #[serde(default = "GeneratorConfig::default_normal_voltage")]
    pub normal_voltage: ValueBand,
    #[serde(default = "GeneratorConfig::default_normal_current")]
    pub normal_current: ValueBand,
    #[serde(default = "GeneratorConfig::default_low_voltage")]
    pub anomalous_low_voltage: ValueBand,
    #[serde(default = "GeneratorConfig::default_high_voltage")]
    pub anomalous_high_voltage: ValueBand,
    #[serde(default = "GeneratorConfig::default_anomalous_current")]
    pub anomalous_current: ValueBand,
    #[serde(default = "GeneratorConfig::default_frequency")]
    pub frequency: ValueBand,
}

impl GeneratorConfig {
    fn default_normal_voltage() -> ValueBand {
        ValueBand::new(220.0, 240.0)
    }

    fn default_normal_current() -> ValueBand {
        ValueBand::new(5.0, 20.0)
    }

    fn default_low_voltage() -> ValueBand {
        ValueBand::new(210.0, 214.0)
    }

    fn default_high_voltage() -> ValueBand {
        ValueBand::new(246.0, 250.0)
    }

    fn default_anomalous_current() -> ValueBand {
        ValueBand::new(20.1, 30.0)
    }

    fn default_frequency() -> ValueBand {
        ValueBand::new(49.9, 50.1)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.anomaly_probability) {
            return Err(anyhow!(
                "generator.anomaly_probability must be within [0, 1] (got {})",
                self.anomaly_probability
            ));
        }
        self.normal_voltage.validate("normal_voltage")?;
        self.normal_current.validate("normal_current")?;
        self.anomalous_low_voltage.validate("anomalous_low_voltage")?;
        self.anomalous_high_voltage.validate("anomalous_high_voltage")?;
        self.anomalous_current.validate("anomalous_current")?;
        self.frequency.validate("frequency")?;
        Ok(())
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: None,
            scenario: None,
            anomaly_probability: default_anomaly_probability(),
            normal_voltage: Self::default_normal_voltage(),
            normal_current: Self::default_normal_current(),
            anomalous_low_voltage: Self::default_low_voltage(),
            anomalous_high_voltage: Self::default_high_voltage(),
            anomalous_current: Self::default_anomalous_current(),
            frequency: Self::default_frequency(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_endpoint")]
    pub endpoint: Url,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_report_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_report_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_report_endpoint(),
            api_key_env: default_report_key_env(),
            timeout: default_report_timeout(),
        }
    }
}

impl ReportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_key_env.trim().is_empty() {
            return Err(anyhow!("report.api_key_env must name an environment variable"));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("report.timeout must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve `/metrics` on a dedicated listener in addition to the API router.
    #[serde(default)]
    pub dedicated_listener: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            dedicated_listener: false,
            listen: default_metrics_listen(),
        }
    }
}
