//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across all kinetic applications, plus the installation-wide configuration
//! tree consumed by the hub binary.
//!
//! # Usage
//!
//! ```rust,no_run
//! use kinetic_common::config::{ConfigLoader, InstallationConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = InstallationConfig::load(Path::new("kinetic.toml"))?;
//!     config.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::*;
use crate::motor::SafetyLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

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

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all kinetic applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "kinetic-hub-gallery-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            service_name: "kinetic-hub".to_string(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

/// Convert a seconds value from config into a `Duration`.
///
/// Negative or non-finite values map to zero; `validate()` rejects them first.
#[inline]
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn require_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{name} must be a positive number of seconds, got {value}"
        )))
    }
}

// ─── Sections ───────────────────────────────────────────────────────

/// `[device]`: motor process endpoint and link timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: f64,
    pub io_timeout_secs: f64,
    pub heartbeat_interval_secs: f64,
    pub heartbeat_retry_secs: f64,
    pub monitor_interval_secs: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DEVICE_HOST.to_string(),
            port: DEFAULT_DEVICE_PORT,
            connect_timeout_secs: DEVICE_CONNECT_TIMEOUT_SECS,
            io_timeout_secs: DEVICE_IO_TIMEOUT_SECS,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            heartbeat_retry_secs: HEARTBEAT_RETRY_SECS,
            monitor_interval_secs: MONITOR_INTERVAL_SECS,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::ValidationError("device.host cannot be empty".into()));
        }
        require_positive("device.connect_timeout_secs", self.connect_timeout_secs)?;
        require_positive("device.io_timeout_secs", self.io_timeout_secs)?;
        require_positive("device.heartbeat_interval_secs", self.heartbeat_interval_secs)?;
        require_positive("device.heartbeat_retry_secs", self.heartbeat_retry_secs)?;
        require_positive("device.monitor_interval_secs", self.monitor_interval_secs)
    }
}

/// `[safety]`: limits and thresholds used by the safety controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub limits: SafetyLimits,
    pub max_temperature_c: f64,
    pub runtime_warning_secs: f64,
    pub runtime_critical_secs: f64,
    pub conflict_pen_elevation_rpm: f64,
    pub conflict_canvas_rpm: f64,
    /// Generator-side margin applied by command sources.
    pub safety_margin: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            limits: SafetyLimits::default(),
            max_temperature_c: MAX_MOTOR_TEMPERATURE_C,
            runtime_warning_secs: RUNTIME_WARNING_SECS,
            runtime_critical_secs: RUNTIME_CRITICAL_SECS,
            conflict_pen_elevation_rpm: CONFLICT_PEN_ELEVATION_RPM,
            conflict_canvas_rpm: CONFLICT_CANVAS_RPM,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.check().map_err(ConfigError::ValidationError)?;
        require_positive("safety.runtime_warning_secs", self.runtime_warning_secs)?;
        if self.runtime_warning_secs >= self.runtime_critical_secs {
            return Err(ConfigError::ValidationError(
                "safety.runtime_warning_secs must be below runtime_critical_secs".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.safety_margin) {
            return Err(ConfigError::ValidationError(
                "safety.safety_margin must be within 0..1".into(),
            ));
        }
        Ok(())
    }
}

/// `[control_loop]`: cadence and error ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlLoopConfig {
    pub cycle_interval_secs: f64,
    pub max_consecutive_errors: u32,
    pub emergency_stop_threshold: u32,
    pub retry_delay_secs: f64,
    pub health_check_interval_secs: f64,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: DEFAULT_CYCLE_INTERVAL_SECS,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
            emergency_stop_threshold: EMERGENCY_STOP_THRESHOLD,
            retry_delay_secs: CYCLE_RETRY_DELAY_SECS,
            health_check_interval_secs: HEALTH_CHECK_INTERVAL_SECS,
        }
    }
}

impl ControlLoopConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("control_loop.cycle_interval_secs", self.cycle_interval_secs)?;
        require_positive("control_loop.retry_delay_secs", self.retry_delay_secs)?;
        require_positive(
            "control_loop.health_check_interval_secs",
            self.health_check_interval_secs,
        )?;
        if self.max_consecutive_errors == 0 || self.emergency_stop_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "control_loop error ceilings must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// `[sessions]`: storage and housekeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub storage_dir: PathBuf,
    pub max_concurrent_sessions: usize,
    pub autosave_interval_secs: f64,
    pub cleanup_interval_secs: f64,
    pub retention_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(DEFAULT_SESSION_DIR),
            max_concurrent_sessions: MAX_CONCURRENT_SESSIONS,
            autosave_interval_secs: SESSION_AUTOSAVE_SECS,
            cleanup_interval_secs: SESSION_CLEANUP_SECS,
            retention_hours: SESSION_RETENTION_HOURS,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "sessions.max_concurrent_sessions must be at least 1".into(),
            ));
        }
        require_positive("sessions.autosave_interval_secs", self.autosave_interval_secs)?;
        require_positive("sessions.cleanup_interval_secs", self.cleanup_interval_secs)?;
        if self.retention_hours < 0 {
            return Err(ConfigError::ValidationError(
                "sessions.retention_hours cannot be negative".into(),
            ));
        }
        Ok(())
    }
}

/// `[hub]`: WebSocket listener, liveness and shared secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret; falls back to the `KINETIC_API_KEY` environment variable.
    pub api_key: Option<String>,
    pub ping_interval_secs: f64,
    pub ping_timeout_secs: f64,
    pub max_message_bytes: usize,
    /// Directory for mode/motor-state snapshots and recordings.
    pub state_dir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HUB_HOST.to_string(),
            port: DEFAULT_HUB_PORT,
            api_key: None,
            ping_interval_secs: HUB_PING_INTERVAL_SECS,
            ping_timeout_secs: HUB_PING_TIMEOUT_SECS,
            max_message_bytes: HUB_MAX_MESSAGE_BYTES,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("hub.ping_interval_secs", self.ping_interval_secs)?;
        require_positive("hub.ping_timeout_secs", self.ping_timeout_secs)?;
        if self.max_message_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "hub.max_message_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Configured secret, or the environment fallback. Empty strings count as unset.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Complete installation configuration.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "kinetic-hub"
///
/// [device]
/// host = "127.0.0.1"
/// port = 8888
///
/// [control_loop]
/// cycle_interval_secs = 3.4
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallationConfig {
    pub shared: SharedConfig,
    pub hub: HubConfig,
    pub device: DeviceConfig,
    pub safety: SafetyConfig,
    pub control_loop: ControlLoopConfig,
    pub sessions: SessionConfig,
}

impl InstallationConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.hub.validate()?;
        self.device.validate()?;
        self.safety.validate()?;
        self.control_loop.validate()?;
        self.sessions.validate()
    }
}
