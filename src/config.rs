//! Configuration system using Figment.
//!
//! Configuration is layered, lowest precedence first:
//! 1. built-in defaults (`ScopeConfig::default()`)
//! 2. a TOML file (default `<config dir>/daq_scope/config.toml`)
//! 3. environment variables prefixed with `DAQSCOPE_`, nested keys split on `__`
//!
//! ```text
//! DAQSCOPE_LOG_LEVEL=debug
//! DAQSCOPE_CAPTURE__PORT=/dev/ttyACM0
//! DAQSCOPE_CAPTURE__BITS=16
//! DAQSCOPE_VIEW__TRIGGER__MODE=single
//! ```
//!
//! All time-like values that describe the log use log units (100 ns ticks).
//! Wall-clock timeouts are written as humantime strings (`"20ms"`, `"1s"`).

use crate::data::sample::ValueWidth;
use crate::metadata::PinDefinition;
use crate::view::trigger_window::TriggerSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Log units (100 ns ticks) per second.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Capture worker settings
    pub capture: CaptureSettings,
    /// Paged log reader settings
    pub reader: ReaderSettings,
    /// View / trigger settings
    pub view: ViewSettings,
    /// Channel definitions of the device
    pub pins: Vec<PinDefinition>,
}

/// Settings of the capture worker and its ingestion buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Serial port (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Sample value width, 8 or 16
    pub bits: u32,
    /// Per-call transport read timeout
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// How long to wait for the initial sync record
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
    /// How long to keep draining after the stop command was sent
    #[serde(with = "humantime_serde")]
    pub quiesce_timeout: Duration,
    /// Minimum age (log units) before a buffered record is written
    pub retention_delay: u64,
    /// Capacity of the ingestion ring, in records
    pub buffer_capacity: usize,
    /// Log units per device tick
    pub tick_unit: u64,
    /// Consecutive transport errors tolerated before the session ends
    pub max_transport_faults: u32,
    /// Size of the raw read buffer, in wire records
    pub read_buffer_records: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            bits: 8,
            read_timeout: Duration::from_millis(20),
            sync_timeout: Duration::from_millis(400),
            quiesce_timeout: Duration::from_millis(300),
            retention_delay: 100_000,
            buffer_capacity: 2048,
            tick_unit: 10,
            max_transport_faults: 10,
            read_buffer_records: 1024,
        }
    }
}

/// Settings of the paged, memory-mapped log reader.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReaderSettings {
    /// Mapping granularity in bytes; a multiple of the OS allocation granularity
    pub chunk_size: u64,
    /// Chunks per mapped page (one extra chunk is always mapped on top)
    pub pages_per_map: u64,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            pages_per_map: 10,
        }
    }
}

/// Settings of the consumer side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSettings {
    /// Interval between poll ticks
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Initial window width in log units
    pub period: u64,
    /// Trigger configuration
    pub trigger: TriggerSettings,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            period: TICKS_PER_SECOND,
            trigger: TriggerSettings::default(),
        }
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            capture: CaptureSettings::default(),
            reader: ReaderSettings::default(),
            view: ViewSettings::default(),
            pins: Vec::new(),
        }
    }
}

impl ScopeConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("daq_scope").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Load configuration from the default path and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(ScopeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQSCOPE_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if ValueWidth::from_bits(self.capture.bits).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid capture.bits {}. Must be 8 or 16",
                self.capture.bits
            )));
        }

        if self.capture.buffer_capacity < 2 {
            return Err(ConfigError::ValidationError(
                "capture.buffer_capacity must be at least 2".to_string(),
            ));
        }

        if self.capture.tick_unit == 0 {
            return Err(ConfigError::ValidationError(
                "capture.tick_unit must be > 0".to_string(),
            ));
        }

        if self.capture.read_buffer_records == 0 {
            return Err(ConfigError::ValidationError(
                "capture.read_buffer_records must be > 0".to_string(),
            ));
        }

        if self.reader.chunk_size == 0 || self.reader.chunk_size % 4096 != 0 {
            return Err(ConfigError::ValidationError(format!(
                "reader.chunk_size {} must be a non-zero multiple of 4096",
                self.reader.chunk_size
            )));
        }

        if self.reader.pages_per_map < 2 {
            return Err(ConfigError::ValidationError(
                "reader.pages_per_map must be at least 2".to_string(),
            ));
        }

        if self.view.period == 0 {
            return Err(ConfigError::ValidationError(
                "view.period must be > 0".to_string(),
            ));
        }

        let mut indices = HashSet::new();
        for pin in &self.pins {
            if pin.index > i8::MAX as usize {
                return Err(ConfigError::ValidationError(format!(
                    "Pin index {} exceeds the channel range 0..=127",
                    pin.index
                )));
            }
            if !indices.insert(pin.index) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate pin index: {}",
                    pin.index
                )));
            }
        }

        if !self.pins.is_empty() && self.view.trigger.channel >= self.channel_count() {
            return Err(ConfigError::ValidationError(format!(
                "Trigger channel {} is not a configured pin",
                self.view.trigger.channel
            )));
        }

        Ok(())
    }

    /// The value width selected for capture sessions.
    pub fn value_width(&self) -> ValueWidth {
        ValueWidth::from_bits(self.capture.bits).unwrap_or(ValueWidth::Bits8)
    }

    /// Number of channels implied by the pin table (highest index + 1).
    pub fn channel_count(&self) -> usize {
        self.pins.iter().map(|p| p.index + 1).max().unwrap_or(0)
    }
}
