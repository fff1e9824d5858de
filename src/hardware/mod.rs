//! Vendor USB SDK boundary.
//!
//! The analog I/O device is driven through a C library that exposes one
//! function per register. That library is not linked here; instead the
//! register calls are expressed as the [`AnalogDevice`] trait, and device
//! discovery as [`DeviceEnumerator`]. A binding implements both by mapping a
//! non-zero (C `TRUE`) return to `Ok` and anything else to
//! `Err(SdkCallError)`. Drivers never see raw integer result codes.
//!
//! Setup sequences are not aborted at the first failing call. Each result goes
//! through a [`RegisterSequence`], which keeps going, collects every failure
//! and reports them once as [`MeasureError::Hardware`].
//!
//! # Example
//!
//! ```
//! use rust_measure::hardware::mock::{MockAnalogDevice, MockEnumerator};
//! use rust_measure::hardware::{AnalogDevice, DeviceRegistry};
//!
//! let mut registry = DeviceRegistry::new(Box::new(MockEnumerator::single(
//!     "SN:210321A1B2C3",
//!     MockAnalogDevice::new(),
//! )));
//! registry.refresh().unwrap();
//! let device = registry.open_by_serial_suffix("B2C3").unwrap();
//! assert_eq!(device.name(), "Analog Discovery 2");
//! ```

pub mod mock;

use crate::error::{AppResult, MeasureError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One failed SDK call.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{call}: {detail}")]
pub struct SdkCallError {
    /// Name of the SDK function
    pub call: String,
    /// Error text from the SDK, if it gave any
    pub detail: String,
}

impl SdkCallError {
    /// Failure of `call` without SDK detail.
    pub fn new(call: impl Into<String>) -> Self {
        Self {
            call: call.into(),
            detail: "call returned failure".to_string(),
        }
    }

    /// Attach the SDK's own error message.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Result of a single SDK call.
pub type SdkResult<T> = std::result::Result<T, SdkCallError>;

/// One entry of the device enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Serial number, e.g. `SN:210321A1B2C3`
    pub serial: String,
    /// Product name
    pub name: String,
    /// False when another process holds the device
    pub available: bool,
}

/// How several raw samples are reduced to one stored sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterMode {
    /// Keep every n-th sample
    Decimate,
    /// Mean of n samples
    Average,
    /// Minimum and maximum of n samples
    MinMax,
}

/// Trigger source register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerSource {
    /// Free running
    None,
    /// Analog input detector on the given 0-based channel
    Channel(usize),
    /// External trigger pin
    External,
}

/// Edge the trigger detector fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerCondition {
    /// Rising edge
    Rise,
    /// Falling edge
    Fall,
    /// Either edge
    Either,
}

/// Analog-in instrument state reported by the status call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcquisitionStatus {
    /// Idle
    Ready,
    /// Waiting for the trigger
    Armed,
    /// Triggered, still filling the buffer
    Triggered,
    /// Continuous acquisition
    Running,
    /// Buffer full; data can be read
    Done,
}

/// Register-level interface of an opened analog I/O device.
///
/// Channels are 0-based. `io_*` calls address the built-in supplies by
/// (channel, node): node 0 is enable, node 1 voltage, node 2 current limit.
/// `in_*` calls address the analog input (scope) instrument.
pub trait AnalogDevice: Send {
    /// Product name.
    fn name(&self) -> &str;
    /// Reset every instrument of the device.
    fn reset(&mut self) -> SdkResult<()>;
    /// Release the device.
    fn close(&mut self) -> SdkResult<()>;

    /// Master enable of the supplies.
    fn io_enable_set(&mut self, enable: bool) -> SdkResult<()>;
    /// Write a supply node.
    fn io_node_set(&mut self, channel: usize, node: usize, value: f64) -> SdkResult<()>;
    /// Read a supply node as of the last `io_status`.
    fn io_node_get(&mut self, channel: usize, node: usize) -> SdkResult<f64>;
    /// Refresh the readings returned by [`io_node_get`](Self::io_node_get).
    fn io_status(&mut self) -> SdkResult<()>;

    /// Samples per second after filtering
    fn in_frequency_set(&mut self, hz: f64) -> SdkResult<()>;
    /// Samples per channel per acquisition.
    fn in_buffer_size_set(&mut self, size: usize) -> SdkResult<()>;
    /// Largest buffer the device supports.
    fn in_buffer_size_max(&mut self) -> SdkResult<usize>;
    /// Include `channel` in acquisitions.
    fn in_channel_enable_set(&mut self, channel: usize, enable: bool) -> SdkResult<()>;
    /// Full input span in volts.
    fn in_channel_range_set(&mut self, channel: usize, volts: f64) -> SdkResult<()>;
    /// Input offset in volts.
    fn in_channel_offset_set(&mut self, channel: usize, volts: f64) -> SdkResult<()>;
    /// Reduction of raw samples for `channel`.
    fn in_channel_filter_set(&mut self, channel: usize, filter: FilterMode) -> SdkResult<()>;

    /// Trigger source.
    fn in_trigger_source_set(&mut self, source: TriggerSource) -> SdkResult<()>;
    /// Trigger level.
    fn in_trigger_level_set(&mut self, volts: f64) -> SdkResult<()>;
    /// Dead-band around the trigger level.
    fn in_trigger_hysteresis_set(&mut self, volts: f64) -> SdkResult<()>;
    /// Trigger edge.
    fn in_trigger_condition_set(&mut self, condition: TriggerCondition) -> SdkResult<()>;
    /// Minimum time between triggers.
    fn in_trigger_holdoff_set(&mut self, seconds: f64) -> SdkResult<()>;
    /// Horizontal trigger position.
    fn in_trigger_position_set(&mut self, seconds: f64) -> SdkResult<()>;
    /// 0 disables auto-trigger.
    fn in_trigger_auto_timeout_set(&mut self, seconds: f64) -> SdkResult<()>;

    /// Apply the configuration and optionally start an acquisition.
    fn in_configure(&mut self, reconfigure: bool, start: bool) -> SdkResult<()>;
    /// Poll the acquisition; `read_data` also fetches the buffer when done.
    fn in_status(&mut self, read_data: bool) -> SdkResult<AcquisitionStatus>;
    /// Copy `count` samples of `channel` from the last completed acquisition.
    fn in_status_data(&mut self, channel: usize, count: usize) -> SdkResult<Vec<f64>>;
}

/// Discovery and opening of SDK devices.
pub trait DeviceEnumerator: Send {
    /// List attached devices.
    fn enumerate(&mut self) -> SdkResult<Vec<DeviceInfo>>;
    /// Open the device at `index` of the last enumeration.
    fn open(&mut self, index: usize) -> SdkResult<Box<dyn AnalogDevice>>;
}

/// Explicit device table, created by the caller and passed to drivers.
pub struct DeviceRegistry {
    enumerator: Box<dyn DeviceEnumerator>,
    devices: Vec<DeviceInfo>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices)
            .finish()
    }
}

impl DeviceRegistry {
    /// Registry over `enumerator`; nothing is enumerated until first use.
    pub fn new(enumerator: Box<dyn DeviceEnumerator>) -> Self {
        Self {
            enumerator,
            devices: Vec::new(),
        }
    }

    /// Re-run enumeration and return the device list.
    pub fn refresh(&mut self) -> AppResult<&[DeviceInfo]> {
        self.devices = self.enumerator.enumerate().map_err(|e| MeasureError::Hardware {
            context: "device enumeration".into(),
            failures: vec![e],
        })?;
        debug!("Enumerated {} SDK device(s)", self.devices.len());
        Ok(&self.devices)
    }

    /// Devices found by the last [`refresh`](Self::refresh).
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Open the first available device whose serial number ends with `suffix`.
    /// An empty suffix matches any device.
    ///
    /// # Errors
    /// [`MeasureError::DeviceNotFound`] when nothing matches.
    pub fn open_by_serial_suffix(&mut self, suffix: &str) -> AppResult<Box<dyn AnalogDevice>> {
        if self.devices.is_empty() {
            self.refresh()?;
        }
        let index = self
            .devices
            .iter()
            .position(|d| d.available && d.serial.ends_with(suffix))
            .ok_or_else(|| {
                MeasureError::DeviceNotFound(if suffix.is_empty() {
                    "no available SDK device".to_string()
                } else {
                    format!("no available SDK device with serial ending in '{}'", suffix)
                })
            })?;
        let device = self.enumerator.open(index).map_err(|e| MeasureError::Hardware {
            context: "device open".into(),
            failures: vec![e],
        })?;
        info!("Opened SDK device {}", self.devices[index].serial);
        Ok(device)
    }
}

/// Runs a sequence of SDK calls to the end and reports all failures at once.
#[derive(Debug)]
pub struct RegisterSequence {
    context: String,
    failures: Vec<SdkCallError>,
}

impl RegisterSequence {
    /// Empty sequence; `context` names it in the error.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            failures: Vec::new(),
        }
    }

    /// Record one call result; the value on success.
    pub fn step<T>(&mut self, result: SdkResult<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{}: {}", self.context, e);
                self.failures.push(e);
                None
            }
        }
    }

    /// Failures so far, in call order.
    pub fn failures(&self) -> &[SdkCallError] {
        &self.failures
    }

    /// The earliest failure.
    pub fn first_error(&self) -> Option<&SdkCallError> {
        self.failures.first()
    }

    /// True while no call has failed.
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// # Errors
    /// [`MeasureError::Hardware`] listing every failed call, in call order.
    pub fn finish(self) -> AppResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(MeasureError::Hardware {
                context: self.context,
                failures: self.failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_collects_all_failures() {
        let mut seq = RegisterSequence::new("setup");
        assert_eq!(seq.step::<u8>(Ok(1)), Some(1));
        assert_eq!(seq.step::<()>(Err(SdkCallError::new("a"))), None);
        seq.step::<()>(Ok(()));
        seq.step::<()>(Err(SdkCallError::new("b")));
        assert!(!seq.is_ok());
        assert_eq!(seq.first_error().unwrap().call, "a");

        match seq.finish() {
            Err(MeasureError::Hardware { context, failures }) => {
                assert_eq!(context, "setup");
                let calls: Vec<_> = failures.iter().map(|f| f.call.as_str()).collect();
                assert_eq!(calls, vec!["a", "b"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_sequence_is_ok() {
        assert!(RegisterSequence::new("noop").finish().is_ok());
    }

    #[test]
    fn test_sdk_error_display() {
        let e = SdkCallError::new("FDwfDeviceOpen").with_detail("device busy");
        assert_eq!(e.to_string(), "FDwfDeviceOpen: device busy");
    }
}
