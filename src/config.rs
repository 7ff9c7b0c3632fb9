//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/trace_capture.toml` by default)
//! 2. Environment variables (prefixed with `TRACECAP_`, nested keys split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! TRACECAP_APPLICATION__LOG_LEVEL=debug
//! TRACECAP_INSTRUMENT__RESOURCE=TCPIP0::192.168.10.2::5025::SOCKET
//! TRACECAP_SCOPE__CAPTURES=50
//! ```
//!
//! Durations are written in humantime form (`"10s"`, `"10ms"`).
//!
//! # Example
//!
//! ```no_run
//! use trace_capture::config::AppConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load_from("config/trace_capture.toml")?;
//!     println!("Instrument: {}", config.instrument.resource);
//!     Ok(())
//! }
//! ```

use crate::acquisition::{InstrumentFamily, ScopeParams, SpectrumParams};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/trace_capture.toml";

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "TRACECAP_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read or deserialised.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values were read but are not usable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Connection settings
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Spectrum analyser acquisition
    #[serde(default)]
    pub spectrum: SpectrumParams,
    /// Oscilloscope batch acquisition
    #[serde(default)]
    pub scope: ScopeParams,
    /// Trace archive settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
    /// Log span open/close events
    #[serde(default)]
    pub log_span_events: bool,
    /// Include source file and line in each event
    #[serde(default)]
    pub log_file_and_line: bool,
    /// ANSI colours for the pretty format
    #[serde(default = "default_enabled")]
    pub log_ansi: bool,
}

/// Instrument connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// VISA-style resource string, e.g. `TCPIP0::192.168.10.2::5025::SOCKET`
    #[serde(default)]
    pub resource: String,
    /// I/O timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Instrument family the resource points at
    #[serde(default = "default_family")]
    pub family: InstrumentFamily,
}

/// Trace archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for archives
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Whether captured traces are written to disk
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_name() -> String {
    "trace_capture".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_family() -> InstrumentFamily {
    InstrumentFamily::SpectrumAnalyzer
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_enabled() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
            log_span_events: false,
            log_file_and_line: false,
            log_ansi: default_enabled(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            resource: String::new(),
            timeout_ms: default_timeout_ms(),
            family: default_family(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            enabled: default_enabled(),
        }
    }
}

impl InstrumentConfig {
    /// I/O timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from the default path
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load and validate configuration from a specific path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::extract(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge file and environment without validating.
    ///
    /// A missing file contributes nothing, so defaults and environment still
    /// apply. Callers that patch values afterwards must call [`validate`](Self::validate).
    pub fn extract<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.instrument.resource.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "instrument.resource must not be empty".to_string(),
            ));
        }

        if self.instrument.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "instrument.timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.scope.captures == 0 {
            return Err(ConfigError::ValidationError(
                "scope.captures must be at least 1".to_string(),
            ));
        }

        if self.scope.poll_interval.is_zero()
            || self.scope.poll_interval >= self.scope.trigger_timeout
        {
            return Err(ConfigError::ValidationError(format!(
                "scope.poll_interval ({:?}) must be non-zero and shorter than scope.trigger_timeout ({:?})",
                self.scope.poll_interval, self.scope.trigger_timeout
            )));
        }

        Ok(())
    }
}
