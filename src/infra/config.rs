//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section and key is optional; missing values take the defaults below.

use crate::services::region_selector::MAX_MONITORED_REGIONS;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub client_id: String,
    pub client_secret: String,
    pub user_id: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            client_id: "dev-client".to_string(),
            client_secret: String::new(),
            user_id: "anonymous".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Hardware region cap (clamped to 1..=20)
    pub max_monitored_regions: usize,
    /// Flush a partial ranging pass after this long
    pub ranging_flush_timeout_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { max_monitored_regions: MAX_MONITORED_REGIONS, ranging_flush_timeout_ms: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub beacon_leave_delay_ms: u64,
    pub zone_change_delay_ms: u64,
    /// How long timers keep firing after the host goes to background
    pub background_grace_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self { beacon_leave_delay_ms: 10_000, zone_change_delay_ms: 10_000, background_grace_ms: 180_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub min_refire_interval_ms: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue_len: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { min_refire_interval_ms: 60_000, batch_size: 50, flush_interval_ms: 30_000, max_queue_len: 10_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub snapshot_file: String,
    pub site_file: String,
    /// JSONL file the file backend appends delivered events to
    pub events_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_file: "state/snapshot.json".to_string(),
            site_file: "config/site.json".to_string(),
            events_file: "state/delivered.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 30, prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human format
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub identity: IdentityConfig,
    pub monitoring: MonitoringConfig,
    pub scheduling: SchedulingConfig,
    pub delivery: DeliveryConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    client_id: String,
    client_secret: String,
    user_id: String,
    max_monitored_regions: usize,
    ranging_flush_timeout_ms: u64,
    beacon_leave_delay_ms: u64,
    zone_change_delay_ms: u64,
    background_grace_ms: u64,
    min_refire_interval_ms: u64,
    batch_size: usize,
    flush_interval_ms: u64,
    max_queue_len: usize,
    snapshot_file: String,
    site_file: String,
    events_file: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    log_json: bool,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        let TomlConfig { identity, monitoring, scheduling, delivery, storage, metrics, logging } =
            toml_config;
        Self {
            client_id: identity.client_id,
            client_secret: identity.client_secret,
            user_id: identity.user_id,
            max_monitored_regions: monitoring.max_monitored_regions.clamp(1, MAX_MONITORED_REGIONS),
            ranging_flush_timeout_ms: monitoring.ranging_flush_timeout_ms,
            beacon_leave_delay_ms: scheduling.beacon_leave_delay_ms,
            zone_change_delay_ms: scheduling.zone_change_delay_ms,
            background_grace_ms: scheduling.background_grace_ms,
            min_refire_interval_ms: delivery.min_refire_interval_ms,
            batch_size: delivery.batch_size.max(1),
            flush_interval_ms: delivery.flush_interval_ms.max(1),
            max_queue_len: delivery.max_queue_len.max(1),
            snapshot_file: storage.snapshot_file,
            site_file: storage.site_file,
            events_file: storage.events_file,
            metrics_interval_secs: metrics.interval_secs.max(1),
            prometheus_port: metrics.prometheus_port,
            log_json: logging.json,
            config_file: config_file.to_string(),
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, origin: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        Ok(Self::from_toml(toml_config, origin))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {e:#}. Using defaults.");
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn max_monitored_regions(&self) -> usize {
        self.max_monitored_regions
    }

    pub fn ranging_flush_timeout_ms(&self) -> u64 {
        self.ranging_flush_timeout_ms
    }

    pub fn beacon_leave_delay_ms(&self) -> u64 {
        self.beacon_leave_delay_ms
    }

    pub fn zone_change_delay_ms(&self) -> u64 {
        self.zone_change_delay_ms
    }

    pub fn background_grace_ms(&self) -> u64 {
        self.background_grace_ms
    }

    pub fn min_refire_interval_ms(&self) -> u64 {
        self.min_refire_interval_ms
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn flush_interval_ms(&self) -> u64 {
        self.flush_interval_ms
    }

    pub fn max_queue_len(&self) -> usize {
        self.max_queue_len
    }

    pub fn snapshot_file(&self) -> &str {
        &self.snapshot_file
    }

    pub fn site_file(&self) -> &str {
        &self.site_file
    }

    pub fn events_file(&self) -> &str {
        &self.events_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn log_json(&self) -> bool {
        self.log_json
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set both scheduler delays
    #[cfg(test)]
    pub fn with_delays(mut self, beacon_leave_ms: u64, zone_change_ms: u64) -> Self {
        self.beacon_leave_delay_ms = beacon_leave_ms;
        self.zone_change_delay_ms = zone_change_ms;
        self
    }

    /// Builder method for tests to set min_refire_interval_ms
    #[cfg(test)]
    pub fn with_min_refire_interval_ms(mut self, ms: u64) -> Self {
        self.min_refire_interval_ms = ms;
        self
    }

    /// Builder method for tests to set the region cap
    #[cfg(test)]
    pub fn with_max_monitored_regions(mut self, cap: usize) -> Self {
        self.max_monitored_regions = cap.clamp(1, MAX_MONITORED_REGIONS);
        self
    }

    /// Builder method for tests to set the background grace budget
    #[cfg(test)]
    pub fn with_background_grace_ms(mut self, ms: u64) -> Self {
        self.background_grace_ms = ms;
        self
    }
}
