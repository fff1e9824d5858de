//! Configuration System using Figment
//!
//! Settings are layered, later sources winning:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `MEASURE_`; nested keys are joined
//!    with a double underscore
//!
//! ```text
//! MEASURE_LOG_LEVEL=debug
//! MEASURE_CAPTURE__ACQUISITION_TIMEOUT_MS=2000
//! ```
//!
//! # Example file
//!
//! ```toml
//! log_level = "info"
//!
//! [capture]
//! poll_interval_ms = 20
//! acquisition_timeout_ms = 10000
//!
//! [[instruments]]
//! id = "scope"
//! kind = "tps2000"
//! address = "COM3"
//! baud_rate = 19200
//! ```

use crate::acquisition::PollSettings;
use crate::error::{AppResult, MeasureError};
use crate::instrument::{ConnectionOptions, Eol};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Acquisition polling
    #[serde(default)]
    pub capture: CaptureSettings,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            capture: CaptureSettings::default(),
            instruments: Vec::new(),
        }
    }
}

/// Acquisition polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Sleep between acquisition status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Hard ceiling on waiting for an acquisition to complete
    #[serde(default = "default_acquisition_timeout")]
    pub acquisition_timeout_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            acquisition_timeout_ms: default_acquisition_timeout(),
        }
    }
}

impl CaptureSettings {
    /// Polling settings for scope drivers.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.poll_interval_ms),
            ceiling: Duration::from_millis(self.acquisition_timeout_ms),
        }
    }
}

/// Supported instrument families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Tektronix TPS2000 oscilloscope
    Tps2000,
    /// Analog Discovery 2 (vendor SDK); `address` is a serial number suffix
    Ad2,
    /// TTi CPX400DP power supply
    Cpx400,
    /// Korad KD3005P power supply
    Korad,
    /// Fluke bench multimeter
    Fluke,
    /// Brymen BM25x handheld multimeter
    Bm25x,
}

/// One instrument entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Unique instrument identifier
    pub id: String,
    /// Driver to use
    pub kind: InstrumentKind,
    /// Serial port name or `host:port`; empty means search the serial ports
    #[serde(default)]
    pub address: String,
    /// Serial baud rate; `None` keeps the driver default
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Reply timeout; `None` keeps the driver default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Line terminator; `None` keeps the driver default
    #[serde(default)]
    pub eol: Option<Eol>,
}

impl InstrumentConfig {
    /// Entry with driver defaults for everything but the address.
    pub fn new(id: impl Into<String>, kind: InstrumentKind, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            address: address.into(),
            baud_rate: None,
            timeout_ms: None,
            eol: None,
        }
    }

    /// Apply the overrides of this entry to a driver's default options.
    pub fn connection_options(&self, defaults: ConnectionOptions) -> ConnectionOptions {
        let mut options = defaults;
        if let Some(baud) = self.baud_rate {
            options = options.with_baud_rate(baud);
        }
        if let Some(ms) = self.timeout_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }
        if let Some(eol) = self.eol {
            options = options.with_eol(eol);
        }
        options
    }
}

fn default_poll_interval() -> u64 {
    20
}

fn default_acquisition_timeout() -> u64 {
    10_000
}

impl Settings {
    /// Load defaults, then `path` if given, then the environment.
    ///
    /// # Errors
    ///
    /// [`MeasureError::Config`] if a source cannot be read or does not match
    /// the schema, [`MeasureError::Configuration`] if validation fails.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment
            .merge(Env::prefixed("MEASURE_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load from a specific file path.
    ///
    /// A missing file is an error here, unlike in [`load`](Self::load) where
    /// figment silently skips it.
    pub fn from_path(path: &Path) -> AppResult<Self> {
        if !path.is_file() {
            return Err(MeasureError::Configuration(format!(
                "configuration file '{}' not found",
                path.display()
            )));
        }
        Self::load(Some(path))
    }

    /// Look up an instrument entry by id.
    pub fn instrument(&self, id: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|i| i.id == id)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - Poll interval and acquisition timeout are non-zero
    /// - Instrument IDs are unique and non-empty
    /// - Per-instrument timeouts and baud rates are non-zero
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(MeasureError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.capture.poll_interval_ms == 0 || self.capture.acquisition_timeout_ms == 0 {
            return Err(MeasureError::Configuration(
                "capture poll_interval_ms and acquisition_timeout_ms must be non-zero".into(),
            ));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.is_empty() {
                return Err(MeasureError::Configuration(
                    "Instrument id cannot be empty".into(),
                ));
            }
            if !ids.insert(instrument.id.as_str()) {
                return Err(MeasureError::Configuration(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            if instrument.timeout_ms == Some(0) {
                return Err(MeasureError::Configuration(format!(
                    "Instrument '{}': timeout_ms must be non-zero",
                    instrument.id
                )));
            }
            if instrument.baud_rate == Some(0) {
                return Err(MeasureError::Configuration(format!(
                    "Instrument '{}': baud_rate must be non-zero",
                    instrument.id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        let poll = settings.capture.poll_settings();
        assert_eq!(poll.interval, Duration::from_millis(20));
        assert_eq!(poll.ceiling, Duration::from_secs(10));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let settings = Settings {
            instruments: vec![
                InstrumentConfig::new("psu", InstrumentKind::Cpx400, "10.0.0.5:9221"),
                InstrumentConfig::new("psu", InstrumentKind::Korad, "COM4"),
            ],
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument ID"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut entry = InstrumentConfig::new("dmm", InstrumentKind::Fluke, "COM5");
        entry.timeout_ms = Some(0);
        let settings = Settings {
            instruments: vec![entry],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            capture: CaptureSettings {
                poll_interval_ms: 0,
                acquisition_timeout_ms: 100,
            },
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let settings = Settings {
            log_level: "loud".into(),
            ..Settings::default()
        };
        assert!(settings
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_connection_overrides() {
        let mut entry = InstrumentConfig::new("k", InstrumentKind::Korad, "COM1");
        entry.baud_rate = Some(115_200);
        entry.eol = Some(Eol::CrLf);
        let options = entry.connection_options(
            ConnectionOptions::default()
                .with_baud_rate(9600)
                .with_timeout(Duration::from_millis(300)),
        );
        assert_eq!(options.baud_rate, 115_200);
        assert_eq!(options.eol, Eol::CrLf);
        assert_eq!(options.timeout, Duration::from_millis(300));
    }
}
