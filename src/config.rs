//! Configuration management for nofail.
//!
//! Loads settings from `~/.config/nofail/config.toml` with environment overrides.
//! The `[[providers]]` tables form the whitelist.

use crate::health::BackoffPolicy;
use crate::router::{RouterConfig, RoutingMode};
use crate::whitelist::ProviderEntry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1337;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingModeKind {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: RoutingModeKind,
    /// Candidates dispatched at once in parallel mode.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    /// Overall deadline for one request across all attempts.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    #[serde(default = "default_filter")]
    pub filter: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// One whitelisted provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// OpenAI-compatible endpoint; providers without one need an adapter registered in code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the bearer key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

// Default value functions
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_true() -> bool { true }
fn default_fanout() -> usize { 2 }
fn default_failure_threshold() -> u32 { DEFAULT_FAILURE_THRESHOLD }
fn default_max_backoff_secs() -> u64 { DEFAULT_MAX_BACKOFF_SECS }
fn default_probe_interval_secs() -> u64 { DEFAULT_PROBE_INTERVAL_SECS }
fn default_probe_timeout_secs() -> u64 { DEFAULT_PROBE_TIMEOUT_SECS }
fn default_filter() -> String { "info".to_string() }
fn default_priority() -> i32 { 100 }
fn default_provider_timeout_secs() -> u64 { 30 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: RoutingModeKind::default(),
            fanout: default_fanout(),
            request_timeout_secs: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_probe_interval_secs(),
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_filter(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            priority: default_priority(),
            models: Vec::new(),
            timeout_secs: default_provider_timeout_secs(),
            enabled: default_true(),
            base_url: None,
            api_key_env: None,
        }
    }
}

impl RoutingConfig {
    pub fn router_config(&self) -> RouterConfig {
        let mode = match self.mode {
            RoutingModeKind::Sequential => RoutingMode::Sequential,
            RoutingModeKind::Parallel => RoutingMode::Parallel {
                fanout: self.fanout.max(1),
            },
        };
        RouterConfig {
            mode,
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl HealthConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            failure_threshold: self.failure_threshold.max(1),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl ProviderConfig {
    pub fn to_entry(&self) -> ProviderEntry {
        let entry = ProviderEntry::new(&self.id, self.priority)
            .with_models(self.models.iter().cloned())
            .with_timeout(Duration::from_secs(self.timeout_secs.max(1)));
        if self.enabled {
            entry
        } else {
            entry.disabled()
        }
    }

    /// Bearer key read from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

impl Config {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nofail")
            .join("config.toml")
    }

    /// Load config from the default path, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from a specific path. A missing file yields defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Load config from a file that must exist.
    pub fn load_existing(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(port) = env_parse("NOFAIL_PORT") {
            self.gateway.port = port;
        }
        if let Ok(mode) = std::env::var("NOFAIL_ROUTING_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "sequential" => self.routing.mode = RoutingModeKind::Sequential,
                "parallel" => self.routing.mode = RoutingModeKind::Parallel,
                other => tracing::warn!(mode = other, "ignoring unknown NOFAIL_ROUTING_MODE"),
            }
        }
        if let Some(fanout) = env_parse("NOFAIL_FANOUT") {
            self.routing.fanout = fanout;
        }
        if let Some(threshold) = env_parse("NOFAIL_FAILURE_THRESHOLD") {
            self.health.failure_threshold = threshold;
        }
        if let Some(interval) = env_parse("NOFAIL_PROBE_INTERVAL_SECS") {
            self.probe.interval_secs = interval;
        }
        self
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Whitelist entries in file order.
    pub fn whitelist_entries(&self) -> Vec<ProviderEntry> {
        self.providers.iter().map(ProviderConfig::to_entry).collect()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
