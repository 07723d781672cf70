//! Configuration loading from TOML files and environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tracker::{SafetyTracker, TrackingWindow};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowConfig>,
}

/// Idle detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Seconds without input before the user counts as idle.
    #[serde(default = "default_idle_threshold")]
    pub threshold_seconds: u64,
    /// Probe interval in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Treat the user as active from launch instead of waiting for the
    /// first idle/resume cycle.
    #[serde(default)]
    pub assume_active_at_start: bool,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            threshold_seconds: default_idle_threshold(),
            check_interval_ms: default_check_interval_ms(),
            assume_active_at_start: false,
        }
    }
}

impl IdleConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_seconds)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Local query service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Set to false to run the tracker without a query socket.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory holding the socket (defaults to `<runtime-dir>/norsi`).
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
    /// Maximum number of simultaneously connected clients.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Per-connection input and output buffer capacity in bytes.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Upper bound on how long one loop iteration waits for readiness.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_dir: None,
            max_clients: default_max_clients(),
            buffer_capacity: default_buffer_capacity(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Returns the socket directory path.
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("norsi")
        })
    }

    /// Returns the full socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir().join("socket.sock")
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// One tracking window as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub name: String,
    pub limit_seconds: u64,
    #[serde(default)]
    pub reset_seconds: u64,
    pub break_seconds: u64,
}

impl WindowConfig {
    fn new(name: &str, limit_seconds: u64, reset_seconds: u64, break_seconds: u64) -> Self {
        Self {
            name: name.to_string(),
            limit_seconds,
            reset_seconds,
            break_seconds,
        }
    }
}

// Default value functions
fn default_idle_threshold() -> u64 {
    1
}

fn default_check_interval_ms() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

fn default_max_clients() -> usize {
    16
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_tick_ms() -> u64 {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_windows() -> Vec<WindowConfig> {
    vec![
        WindowConfig::new("micro", 3 * 60, 15, 30),
        WindowConfig::new("normal", 45 * 60, 0, 10 * 60),
        WindowConfig::new("workday", 4 * 60 * 60, 0, 8 * 60 * 60),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle: IdleConfig::default(),
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            windows: default_windows(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::from_file(path)?
        } else {
            let default_paths = [
                PathBuf::from("config/default.toml"),
                dirs::config_dir()
                    .map(|d| d.join("norsi/config.toml"))
                    .unwrap_or_default(),
            ];

            let mut loaded = None;
            for path in &default_paths {
                if path.is_file() {
                    loaded = Some(Self::from_file(path)?);
                    break;
                }
            }
            loaded.unwrap_or_default()
        };

        config.apply_env_overrides();

        if let Some(dir) = config.service.socket_dir.take() {
            config.service.socket_dir = Some(expand_tilde(&dir));
        }

        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("NORSI_IDLE_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.idle.threshold_seconds = v;
            }
        }
        if let Ok(val) = std::env::var("NORSI_CHECK_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.idle.check_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("NORSI_TICK_MS") {
            if let Ok(v) = val.parse() {
                self.service.tick_ms = v;
            }
        }
        if let Ok(val) = std::env::var("NORSI_SOCKET_DIR") {
            self.service.socket_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("NORSI_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.idle.threshold_seconds == 0 {
            anyhow::bail!("Idle threshold must be greater than 0");
        }
        if self.idle.check_interval_ms == 0 {
            anyhow::bail!("Idle check interval must be greater than 0");
        }
        if self.service.tick_ms == 0 {
            anyhow::bail!("Tick interval must be greater than 0");
        }
        if self.service.max_clients == 0 {
            anyhow::bail!("max_clients must be greater than 0");
        }
        if self.service.buffer_capacity < 64 {
            anyhow::bail!("buffer_capacity must be at least 64 bytes");
        }
        self.build_tracker()?;
        Ok(())
    }

    /// Build the tracker described by the `[[windows]]` entries.
    pub fn build_tracker(&self) -> Result<SafetyTracker> {
        let windows = self
            .windows
            .iter()
            .map(|w| {
                TrackingWindow::new(
                    w.name.clone(),
                    w.limit_seconds,
                    w.reset_seconds,
                    w.break_seconds,
                )
            })
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid tracking window")?;

        SafetyTracker::new(windows).context("Invalid tracking windows")
    }
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
