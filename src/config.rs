//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. `config/dmm.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `DMM_`, nested keys separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DMM_APPLICATION__LOG_LEVEL=debug
//! DMM_INSTRUMENT__ADDRESS=TCPIP0::192.168.1.50::5025::SOCKET
//! DMM_SCHEDULER__STOP_GRACE_MS=500
//! ```
//!
//! # Example file
//!
//! ```toml
//! [application]
//! name = "Bench DMM"
//! log_level = "info"
//!
//! [scheduler]
//! default_interval_secs = 1.0
//! stop_grace_ms = 2000
//! overload_threshold_ohms = 1e8
//!
//! [instrument]
//! address = "TCPIP0::192.168.1.50::5025::SOCKET"
//! timeout_ms = 5000
//! nplc = 10
//! input_impedance = "AUTO"
//! ```

use crate::instrument::scpi::{aperture_command, InputImpedance, SUPPORTED_NPLC};
use crate::measurement::DEFAULT_OVERLOAD_THRESHOLD_OHMS;
use crate::scheduler::DEFAULT_POLL_INTERVAL_SECS;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/dmm.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is outside its allowed range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// `[application]`
    #[serde(default)]
    pub application: ApplicationSettings,
    /// `[scheduler]`
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// `[instrument]`
    #[serde(default)]
    pub instrument: InstrumentSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Name shown in the startup log
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Polling scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Interval used when a requested interval is invalid
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: f64,
    /// How long `stop` waits for the polling task before abandoning it
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Resistance readings at or above this are reported as overload
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold_ohms: f64,
}

/// Instrument connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// Instrument address (`sim://dmm`, `TCPIP0::host::5025::SOCKET`, `host:port`)
    #[serde(default = "default_address")]
    pub address: String,
    /// Connect/read/write timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Line terminator appended to every command
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
    /// Integration time in power-line cycles
    #[serde(default)]
    pub nplc: Option<f64>,
    /// DC voltage input impedance
    #[serde(default)]
    pub input_impedance: Option<InputImpedance>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "dmm_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval_secs() -> f64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_overload_threshold() -> f64 {
    DEFAULT_OVERLOAD_THRESHOLD_OHMS
}

fn default_address() -> String {
    "sim://dmm".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_line_terminator() -> String {
    "\n".to_string()
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval_secs(),
            stop_grace_ms: default_stop_grace_ms(),
            overload_threshold_ohms: default_overload_threshold(),
        }
    }
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            timeout_ms: default_timeout_ms(),
            line_terminator: default_line_terminator(),
            nplc: None,
            input_impedance: None,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): `DMM_` environment variables, the file,
    /// built-in defaults. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DMM_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let interval = self.scheduler.default_interval_secs;
        if !(interval.is_finite() && interval > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid default_interval_secs {}. Must be a positive number of seconds",
                interval
            )));
        }

        if self.scheduler.stop_grace_ms == 0 {
            return Err(ConfigError::ValidationError(
                "stop_grace_ms must be greater than 0".to_string(),
            ));
        }

        let threshold = self.scheduler.overload_threshold_ohms;
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid overload_threshold_ohms {}",
                threshold
            )));
        }

        if self.instrument.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "instrument 'address' cannot be empty".to_string(),
            ));
        }

        if self.instrument.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "instrument timeout_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(nplc) = self.instrument.nplc {
            if aperture_command(nplc).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid nplc {}. Must be one of: {:?}",
                    nplc, SUPPORTED_NPLC
                )));
            }
        }

        Ok(())
    }
}
