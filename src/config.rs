//! Supervisor and watchdog configuration, loaded from TOML.
//!
//! ```toml
//! [polling]
//! interval_ms = 500
//! full_refresh_every = 5
//!
//! [[modules]]
//! name = "hv-top"
//! port = "/dev/ttyUSB0"
//! family = "family_a"
//! channels = 4
//!
//! [interlock]
//! parameter = "cryostat_level"
//! threshold = 3.0
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::register::Family;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level used by the binaries when `RUST_LOG` is not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// One serial-attached HV module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    pub port: String,
    pub family: Family,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    pub channels: u8,
    /// Per-read serial timeout.
    #[serde(default = "default_serial_timeout_ms")]
    pub serial_timeout_ms: u64,
    /// Trips closer together than this are reported as frequent.
    #[serde(default = "default_min_trip_interval_s")]
    pub min_trip_interval_s: u64,
}

impl ModuleConfig {
    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_timeout_ms)
    }

    pub fn min_trip_interval(&self) -> Duration {
        Duration::from_secs(self.min_trip_interval_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Every Nth cycle also refreshes limits, set-points and status.
    #[serde(default = "default_full_refresh_every")]
    pub full_refresh_every: u32,
    /// Upper bound on waiting for a module's serial line to become free.
    #[serde(default = "default_occupancy_wait_ms")]
    pub occupancy_wait_ms: u64,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn occupancy_wait(&self) -> Duration {
        Duration::from_millis(self.occupancy_wait_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            full_refresh_every: default_full_refresh_every(),
            occupancy_wait_ms: default_occupancy_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterlockConfig {
    /// Telemetry parameter gating the HV.
    pub parameter: String,
    /// Values below this are unsafe.
    pub threshold: f64,
    /// Samples older than this do not count.
    #[serde(default = "default_max_staleness_s")]
    pub max_staleness_s: u64,
    #[serde(default = "default_interlock_interval_ms")]
    pub interval_ms: u64,
}

impl InterlockConfig {
    pub fn max_staleness(&self) -> Duration {
        Duration::from_secs(self.max_staleness_s)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Watchdog address, `host:port`.
    pub address: String,
    #[serde(default = "default_heartbeat_interval_s")]
    pub update_interval_s: u64,
    #[serde(default = "default_heartbeat_timeout_s")]
    pub timeout_s: u64,
    /// Kill all HV once the link has been down this long. Disabled when absent.
    #[serde(default)]
    pub shutdown_after_s: Option<u64>,
}

impl HeartbeatConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_s)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    pub fn shutdown_after(&self) -> Option<Duration> {
        self.shutdown_after_s.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Ramp rate used to bring every channel to zero, V/s.
    #[serde(default = "default_max_ramp_rate")]
    pub max_ramp_rate: f64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            max_ramp_rate: default_max_ramp_rate(),
        }
    }
}

/// Everything the supervising process needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub interlock: Option<InterlockConfig>,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfig>,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl SupervisorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read_file(path)?)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - a module name is empty or used twice
    /// - a module has no channels
    /// - the polling interval or the full refresh period is zero
    /// - the shutdown ramp rate is not positive
    /// - the heartbeat timeout is not shorter than its update interval
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, module) in self.modules.iter().enumerate() {
            if module.name.is_empty() {
                return invalid("module name cannot be empty");
            }
            if self.modules[..i].iter().any(|m| m.name == module.name) {
                return invalid(format!("duplicate module name {}", module.name));
            }
            if module.channels == 0 {
                return invalid(format!("module {} has no channels", module.name));
            }
            if module.serial_timeout_ms == 0 {
                return invalid(format!("module {} serial timeout is zero", module.name));
            }
        }
        if self.polling.interval_ms == 0 {
            return invalid("polling interval cannot be zero");
        }
        if self.polling.full_refresh_every == 0 {
            return invalid("full_refresh_every cannot be zero");
        }
        if !(self.shutdown.max_ramp_rate > 0.0) {
            return invalid("shutdown max_ramp_rate must be positive");
        }
        if let Some(interlock) = &self.interlock {
            if interlock.parameter.is_empty() {
                return invalid("interlock parameter cannot be empty");
            }
            if interlock.max_staleness_s == 0 {
                return invalid("interlock max_staleness_s cannot be zero");
            }
        }
        if let Some(heartbeat) = &self.heartbeat {
            if heartbeat.update_interval_s == 0 {
                return invalid("heartbeat update_interval_s cannot be zero");
            }
            if heartbeat.timeout_s == 0 {
                return invalid("heartbeat timeout_s cannot be zero");
            }
            if heartbeat.timeout_s >= heartbeat.update_interval_s {
                return invalid("heartbeat timeout_s must be shorter than update_interval_s");
            }
        }
        Ok(())
    }
}

/// The watchdog process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_bind")]
    pub bind: String,
    /// Source addresses allowed to connect.
    #[serde(default = "default_watchdog_allow")]
    pub allow: Vec<String>,
    #[serde(default = "default_startup_delay_s")]
    pub startup_delay_s: u64,
    #[serde(default = "default_watchdog_staleness_s")]
    pub max_staleness_s: u64,
    #[serde(default = "default_check_interval_s")]
    pub check_interval_s: u64,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl WatchdogConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read_file(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.is_empty() {
            return invalid("watchdog bind address cannot be empty");
        }
        if self.allow.is_empty() {
            return invalid("watchdog allow list cannot be empty");
        }
        if self.max_staleness_s == 0 {
            return invalid("watchdog max_staleness_s cannot be zero");
        }
        if self.check_interval_s == 0 {
            return invalid("watchdog check_interval_s cannot be zero");
        }
        Ok(())
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_s)
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_secs(self.max_staleness_s)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_s)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            bind: default_watchdog_bind(),
            allow: default_watchdog_allow(),
            startup_delay_s: default_startup_delay_s(),
            max_staleness_s: default_watchdog_staleness_s(),
            check_interval_s: default_check_interval_s(),
            log_level: LogLevel::default(),
        }
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound
        } else {
            ConfigError::ParseError(e.to_string())
        }
    })
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::ValidationError(message.into()))
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_serial_timeout_ms() -> u64 {
    500
}

fn default_min_trip_interval_s() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_full_refresh_every() -> u32 {
    5
}

fn default_occupancy_wait_ms() -> u64 {
    10_000
}

fn default_max_staleness_s() -> u64 {
    60
}

fn default_interlock_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_s() -> u64 {
    10
}

fn default_heartbeat_timeout_s() -> u64 {
    5
}

fn default_max_ramp_rate() -> f64 {
    50.0
}

fn default_watchdog_bind() -> String {
    "0.0.0.0:5005".to_string()
}

fn default_watchdog_allow() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_startup_delay_s() -> u64 {
    30
}

fn default_watchdog_staleness_s() -> u64 {
    60
}

fn default_check_interval_s() -> u64 {
    5
}
