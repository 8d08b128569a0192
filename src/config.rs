//! Gateway configuration (§11): a single TOML document loaded once at
//! startup and handed out through a process-global `OnceLock`, mirroring
//! the config idiom the rest of this codebase's sibling crates use.
//!
//! Load order: `IOT_GATEWAY_CONFIG` env var naming a file, then
//! `./iot_gateway.toml` in the working directory, then built-in defaults.
//! Unlike some sibling configs, this one does not track per-key provenance
//! or flag unknown keys — the surface here is flat enough that a plain
//! `#[serde(default)]` struct carries its own weight.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::monitor::Thresholds;
use crate::plugin::PluginManagerConfig;
use crate::rules::watcher::WatcherConfig;

const CONFIG_ENV_VAR: &str = "IOT_GATEWAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "iot_gateway.toml";

static GATEWAY_CONFIG: OnceLock<GatewayConfig> = OnceLock::new();

/// Installs the process-global config. Logs and keeps the existing value
/// rather than panicking if called twice.
pub fn init(config: GatewayConfig) {
    if GATEWAY_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring later call");
    }
}

/// Returns the process-global config.
///
/// # Panics
/// Panics if called before [`init`] — that is a startup bug, not a
/// recoverable condition.
pub fn get() -> &'static GatewayConfig {
    GATEWAY_CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

pub fn is_initialized() -> bool {
    GATEWAY_CONFIG.get().is_some()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub rules_dir: PathBuf,
    pub plugins_dir: PathBuf,
    pub hot_reload: HotReloadConfig,
    pub pipeline: PipelineSettings,
    pub aggregate_shards: usize,
    pub monitor: MonitorSettings,
    pub plugin_manager: PluginManagerSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from("rules"),
            plugins_dir: PathBuf::from("plugins"),
            hot_reload: HotReloadConfig::default(),
            pipeline: PipelineSettings::default(),
            aggregate_shards: 16,
            monitor: MonitorSettings::default(),
            plugin_manager: PluginManagerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    pub enabled: bool,
    pub graceful_fallback: bool,
    pub retry_interval_ms: u64,
    pub max_retries: u32,
    pub debounce_delay_ms: u64,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        let defaults = WatcherConfig::default();
        Self {
            enabled: defaults.enabled,
            graceful_fallback: defaults.graceful_fallback,
            retry_interval_ms: defaults.retry_interval.as_millis() as u64,
            max_retries: defaults.max_retries,
            debounce_delay_ms: defaults.debounce_delay.as_millis() as u64,
        }
    }
}

impl From<&HotReloadConfig> for WatcherConfig {
    fn from(c: &HotReloadConfig) -> Self {
        Self {
            enabled: c.enabled,
            graceful_fallback: c.graceful_fallback,
            retry_interval: Duration::from_millis(c.retry_interval_ms),
            max_retries: c.max_retries,
            debounce_delay: Duration::from_millis(c.debounce_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub num_workers: usize,
    pub queue_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let defaults = crate::pipeline::PipelineConfig::default();
        Self {
            num_workers: defaults.num_workers,
            queue_size: defaults.queue_size,
        }
    }
}

impl From<PipelineSettings> for crate::pipeline::PipelineConfig {
    fn from(s: PipelineSettings) -> Self {
        Self {
            num_workers: s.num_workers,
            queue_size: s.queue_size,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub ring_size: usize,
    pub health_interval_secs: u64,
    pub max_error_rate: f64,
    pub max_queue_length: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        Self {
            ring_size: 1000,
            health_interval_secs: 30,
            max_error_rate: thresholds.max_error_rate,
            max_queue_length: thresholds.max_queue_length,
        }
    }
}

impl MonitorSettings {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_error_rate: self.max_error_rate,
            max_queue_length: self.max_queue_length,
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManagerSettings {
    pub isp_grace_secs: u64,
    pub rescan_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub point_channel_capacity: usize,
}

impl Default for PluginManagerSettings {
    fn default() -> Self {
        let defaults = PluginManagerConfig::new(PathBuf::from("plugins"));
        Self {
            isp_grace_secs: defaults.isp_grace.as_secs(),
            rescan_interval_secs: defaults.rescan_interval.as_secs(),
            cache_ttl_secs: defaults.cache_ttl.as_secs(),
            point_channel_capacity: defaults.point_channel_capacity,
        }
    }
}

impl GatewayConfig {
    /// Loads per the env-var-then-local-file-then-defaults precedence,
    /// logging which source won.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            tracing::info!(path = %path, "loading gateway config from {CONFIG_ENV_VAR}");
            return Self::load_from_file(&path);
        }

        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            tracing::info!(path = %default_path.display(), "loading gateway config from default path");
            return Self::load_from_file(default_path);
        }

        tracing::warn!("no config file found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        (&self.hot_reload).into()
    }

    pub fn plugin_manager_config(&self) -> PluginManagerConfig {
        PluginManagerConfig {
            plugins_dir: self.plugins_dir.clone(),
            isp_grace: Duration::from_secs(self.plugin_manager.isp_grace_secs),
            rescan_interval: Duration::from_secs(self.plugin_manager.rescan_interval_secs),
            cache_ttl: Duration::from_secs(self.plugin_manager.cache_ttl_secs),
            point_channel_capacity: self.plugin_manager.point_channel_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml() {
        let config = GatewayConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: GatewayConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.rules_dir, config.rules_dir);
        assert_eq!(back.aggregate_shards, config.aggregate_shards);
    }

    #[test]
    fn load_from_file_reads_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iot_gateway.toml");
        std::fs::write(&path, "rules_dir = \"custom_rules\"\naggregate_shards = 4\n").unwrap();

        let config = GatewayConfig::load_from_file(&path).unwrap();
        assert_eq!(config.rules_dir, PathBuf::from("custom_rules"));
        assert_eq!(config.aggregate_shards, 4);
        // Unspecified fields still fall back to defaults.
        assert_eq!(config.pipeline.queue_size, PipelineSettings::default().queue_size);
    }

    #[test]
    fn load_from_file_reports_missing_path() {
        let err = GatewayConfig::load_from_file("/nonexistent/iot_gateway.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml = = =").unwrap();
        let err = GatewayConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
