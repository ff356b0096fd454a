use crate::health::HealthState;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from rawwatch.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub watch: WatchConfig,
    pub health: HealthConfig,
    pub transport: TransportConfig,
    pub metadata: MetadataConfig,
    pub serve: ServeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub folder: PathBuf,
    pub extension: String,
    pub use_polling: bool,
    pub poll_interval_ms: u64,
    pub file_watch_threshold_ms: u64,
    pub stability_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub alert_time_diff_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub initial_state: HealthState,
    pub startup_grace: bool,
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub outbox: Option<PathBuf>,
    pub state_channel: String,
    pub file_channel: String,
    pub metadata_channel: String,
    pub reported_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub enabled: bool,
    pub scan_limit_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

// --- Default implementations ---

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("/app/tmpdata"),
            extension: "raw".to_string(),
            use_polling: true,
            poll_interval_ms: 10_000,
            file_watch_threshold_ms: 10_000,
            stability_delay_ms: 1_000,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            alert_time_diff_ms: 120_000,
            min_interval_ms: 100,
            max_interval_ms: 90_000,
            initial_state: HealthState::Healthy,
            startup_grace: true,
            state_file: PathBuf::from("rawwatch.state.json"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbox: None,
            state_channel: "currentState".to_string(),
            file_channel: "raw_file_added".to_string(),
            metadata_channel: "metadata".to_string(),
            reported_file: PathBuf::from("rawwatch.reported.json"),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_limit_bytes: 1024 * 1024,
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 8420,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn file_watch_threshold(&self) -> Duration {
        Duration::from_millis(self.file_watch_threshold_ms)
    }

    pub fn stability_delay(&self) -> Duration {
        Duration::from_millis(self.stability_delay_ms)
    }
}

impl HealthConfig {
    pub fn alert_time_diff(&self) -> Duration {
        Duration::from_millis(self.alert_time_diff_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

impl MonitorConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config: MonitorConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the poller and detector cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch.extension.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "watch.extension must not be empty (use \"*\" to accept any file)".to_string(),
            ));
        }
        if self.watch.stability_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "watch.stability_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.health.min_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "health.min_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.health.max_interval_ms < self.health.min_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "health.max_interval_ms ({}) is below health.min_interval_ms ({})",
                self.health.max_interval_ms, self.health.min_interval_ms
            )));
        }
        if self.health.alert_time_diff_ms == 0 {
            return Err(ConfigError::Invalid(
                "health.alert_time_diff_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors from loading or validating the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
