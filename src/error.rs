//! Custom error types for the library.
//!
//! This module defines the primary error type, `MeasureError`, shared by every
//! layer of the crate, from the byte transport up to the instrument drivers.
//!
//! ## Error Hierarchy
//!
//! The variants fall into a handful of families that callers treat differently:
//!
//! - **Connection**: `Connection`, `NotConnected`, `WrongInstrument`, `DeviceNotFound`.
//!   The driver instance that produced one of these is unusable.
//! - **Protocol format**: `BlockFormat`, `LengthMismatch`, `Parse`. Only the current
//!   operation is aborted; the connection stays usable.
//! - **Configuration rejected**: `Configuration`, `InvalidChannel`, `UnsupportedCoupling`,
//!   `TimebaseNotQuantized`, `SampleCountExceeded`. Raised before anything is written
//!   to the instrument whenever the check can be made up front.
//! - **Hardware**: `Hardware` carries every failed call of a vendor SDK setup sequence.
//! - **Timeout**: `NoResponse`, `AcquisitionTimeout`, `Timeout`. Kept apart from format
//!   errors so callers can decide to retry.
//! - **Misuse**: `CaptureInProgress` for a re-entered capture.
//!
//! By using `#[from]`, `MeasureError` can be created from `std::io::Error` and
//! `figment::Error` with the `?` operator.

use crate::hardware::SdkCallError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, MeasureError>;

/// Every failure the library reports.
#[derive(Error, Debug)]
pub enum MeasureError {
    /// The transport could not be opened.
    #[error("Could not connect to {address}: {source}")]
    Connection {
        /// Address as given by the caller
        address: String,
        /// Underlying transport error
        #[source]
        source: std::io::Error,
    },

    /// Operation on a closed connection.
    #[error("Connection is not open")]
    NotConnected,

    /// The transport accepted fewer bytes than requested.
    #[error("Did not send all characters ({written} of {expected} bytes)")]
    ShortWrite {
        /// Bytes accepted
        written: usize,
        /// Bytes in the command
        expected: usize,
    },

    /// `*IDN?` answered, but by a different instrument.
    #[error("Port {address} has an unexpected instrument connected: '{identity}'")]
    WrongInstrument {
        /// Where the instrument was found
        address: String,
        /// Its `*IDN?` reply
        identity: String,
    },

    /// Nothing matched the search.
    #[error("No device found: {0}")]
    DeviceNotFound(String),

    /// A binary block header was malformed.
    #[error("Malformed data block: {0}")]
    BlockFormat(String),

    /// A block was shorter or longer than required.
    #[error("Wrong length of data: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Bytes required
        expected: usize,
        /// Bytes declared or received
        actual: usize,
    },

    /// A text reply could not be parsed.
    #[error("Could not parse {context} from response '{response}'")]
    Parse {
        /// What was being parsed
        context: String,
        /// The offending reply
        response: String,
    },

    /// A setting was rejected.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The channel does not exist on this instrument.
    #[error("Channel {channel} is illegal (instrument has {count} channels)")]
    InvalidChannel {
        /// Requested channel
        channel: String,
        /// Channels the instrument has
        count: usize,
    },

    /// The coupling is not available on this instrument.
    #[error("Coupling {0} is not supported by this instrument")]
    UnsupportedCoupling(String),

    /// The requested timebase is not a settable step.
    #[error("Time per division {per_div} is not in the 1/2.5/5 sequence")]
    TimebaseNotQuantized {
        /// Requested time per division
        per_div: String,
    },

    /// More samples than the acquisition memory holds.
    #[error("Sample count of {requested} is larger than max {max}")]
    SampleCountExceeded {
        /// Requested samples per channel
        requested: usize,
        /// Buffer capacity
        max: usize,
    },

    /// One or more vendor SDK calls failed.
    #[error("Hardware error during {context}: {} call(s) failed", failures.len())]
    Hardware {
        /// Operation the calls belonged to
        context: String,
        /// Every failed call, in call order
        failures: Vec<SdkCallError>,
    },

    /// The instrument did not answer a query.
    #[error("No response from {address} to '{query}'")]
    NoResponse {
        /// Instrument address
        address: String,
        /// Query that went unanswered
        query: String,
    },

    /// An acquisition never completed.
    #[error("Acquisition did not complete within {0:?}")]
    AcquisitionTimeout(Duration),

    /// A generic operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// `get_samples` was called while a capture was running.
    #[error("A capture is already in progress on this instrument")]
    CaptureInProgress,

    /// Built without serial port support.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}

impl MeasureError {
    /// True for errors where the instrument did not answer in time.
    ///
    /// These are worth a retry, unlike format errors.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::NoResponse { .. } | Self::AcquisitionTimeout(_) | Self::Timeout(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// True when there is no usable device at all, as opposed to a device that
    /// answered with bad data.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::NotConnected
                | Self::WrongInstrument { .. }
                | Self::DeviceNotFound(_)
                | Self::SerialFeatureDisabled
        )
    }

    /// True for malformed replies from a device that is present.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::BlockFormat(_) | Self::LengthMismatch { .. } | Self::Parse { .. }
        )
    }

    pub(crate) fn parse(context: impl Into<String>, response: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            response: response.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeasureError::LengthMismatch {
            expected: 2500,
            actual: 2499,
        };
        assert_eq!(
            err.to_string(),
            "Wrong length of data: expected 2500 bytes, got 2499"
        );
    }

    #[test]
    fn test_hardware_error_counts_failures() {
        let err = MeasureError::Hardware {
            context: "supply output".into(),
            failures: vec![
                SdkCallError::new("AnalogIOChannelNodeSet(0, 1)"),
                SdkCallError::new("AnalogIOChannelNodeSet(0, 2)"),
            ],
        };
        assert!(err.to_string().contains("2 call(s) failed"));
    }

    #[test]
    fn test_not_found_is_distinct_from_bad_data() {
        let missing = MeasureError::Connection {
            address: "COM7".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such port"),
        };
        let garbled = MeasureError::BlockFormat("bad marker".into());

        assert!(missing.is_not_found());
        assert!(!missing.is_format_error());
        assert!(garbled.is_format_error());
        assert!(!garbled.is_not_found());
    }

    #[test]
    fn test_timeout_classification() {
        let err = MeasureError::NoResponse {
            address: "10.0.0.5:9221".into(),
            query: "*IDN?".into(),
        };
        assert!(err.is_timeout());
        assert!(MeasureError::AcquisitionTimeout(Duration::from_secs(10)).is_timeout());
        assert!(!MeasureError::CaptureInProgress.is_timeout());
    }
}
