//! Mock SDK Implementations
//!
//! Provides a simulated analog I/O device and enumerator for testing without
//! the vendor library or a USB device attached.
//!
//! # Available Mocks
//!
//! - `MockAnalogDevice` - register-level device that records every call
//! - `MockEnumerator` - fixed device table handing out `MockAnalogDevice`s
//!
//! # Behaviour
//!
//! - Calls named with [`MockAnalogDevice::fail_on`] return `Err(SdkCallError)`
//!   every time they are made; all other calls succeed and update state.
//! - `in_status` reports `Armed` for a configurable number of polls after a
//!   started acquisition, then `Done`. [`MockAnalogDevice::never_complete`]
//!   keeps it armed forever.
//! - Clones share state, so a test keeps a handle after the driver takes
//!   ownership of its boxed copy.

use super::{
    AcquisitionStatus, AnalogDevice, DeviceEnumerator, DeviceInfo, FilterMode, SdkCallError,
    SdkResult, TriggerCondition, TriggerSource,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Default analog-in buffer capacity, samples per channel.
pub const MOCK_BUFFER_MAX: usize = 8192;

// =============================================================================
// MockAnalogDevice - Simulated Register Interface
// =============================================================================

#[derive(Debug, Default)]
struct SdkState {
    calls: Vec<String>,
    fail: HashSet<String>,
    closed: bool,
    io_enabled: bool,
    nodes: HashMap<(usize, usize), f64>,
    frequency: f64,
    buffer_size: usize,
    buffer_max: usize,
    enabled: HashMap<usize, bool>,
    ranges: HashMap<usize, f64>,
    offsets: HashMap<usize, f64>,
    filter: Option<FilterMode>,
    trigger_source: Option<TriggerSource>,
    trigger_level: f64,
    hysteresis: Option<f64>,
    condition: Option<TriggerCondition>,
    holdoff: f64,
    position: f64,
    auto_timeout: f64,
    running: bool,
    polls_until_done: usize,
    polls_left: usize,
    never_complete: bool,
    data: HashMap<usize, Vec<f64>>,
}

/// Simulated analog I/O device.
///
/// # Example
///
/// ```
/// use rust_measure::hardware::mock::MockAnalogDevice;
/// use rust_measure::hardware::AnalogDevice;
///
/// let mock = MockAnalogDevice::new();
/// let mut device: Box<dyn AnalogDevice> = Box::new(mock.clone());
/// device.in_trigger_hysteresis_set(0.25).unwrap();
/// assert_eq!(mock.hysteresis(), Some(0.25));
/// ```
#[derive(Debug, Clone)]
pub struct MockAnalogDevice {
    name: String,
    state: Arc<Mutex<SdkState>>,
}

impl MockAnalogDevice {
    /// Device that completes an acquisition on the second status poll.
    pub fn new() -> Self {
        let state = SdkState {
            buffer_max: MOCK_BUFFER_MAX,
            polls_until_done: 1,
            ..SdkState::default()
        };
        Self {
            name: "Analog Discovery 2".to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SdkState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn call(&self, name: &str, args: String) -> SdkResult<MutexGuard<'_, SdkState>> {
        let mut state = self.state();
        state.calls.push(format!("{}({})", name, args));
        if state.fail.contains(name) {
            return Err(SdkCallError::new(name));
        }
        Ok(state)
    }

    /// Make every call to `call` (e.g. `"in_trigger_level_set"`) fail.
    pub fn fail_on(&self, call: &str) {
        self.state().fail.insert(call.to_string());
    }

    /// Number of `Armed` polls before `Done`.
    pub fn set_polls_until_done(&self, polls: usize) {
        self.state().polls_until_done = polls;
    }

    /// Keep acquisitions armed forever.
    pub fn never_complete(&self) {
        self.state().never_complete = true;
    }

    /// Samples returned for `channel`; padded with zeros to the requested count.
    pub fn set_channel_data(&self, channel: usize, data: Vec<f64>) {
        self.state().data.insert(channel, data);
    }

    /// Capacity reported by `in_buffer_size_max`.
    pub fn set_buffer_max(&self, max: usize) {
        self.state().buffer_max = max;
    }

    /// Every call made so far, as `name(args)`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// True after `close`.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Supply master enable.
    pub fn io_enabled(&self) -> bool {
        self.state().io_enabled
    }

    /// Last value written to a supply node.
    pub fn node(&self, channel: usize, node: usize) -> Option<f64> {
        self.state().nodes.get(&(channel, node)).copied()
    }

    /// Analog-in sample rate.
    pub fn frequency(&self) -> f64 {
        self.state().frequency
    }

    /// Analog-in buffer size.
    pub fn buffer_size(&self) -> usize {
        self.state().buffer_size
    }

    /// Analog-in channel enable.
    pub fn channel_enabled(&self, channel: usize) -> bool {
        self.state().enabled.get(&channel).copied().unwrap_or(false)
    }

    /// Analog-in channel range.
    pub fn channel_range(&self, channel: usize) -> Option<f64> {
        self.state().ranges.get(&channel).copied()
    }

    /// Last filter written to any channel.
    pub fn filter(&self) -> Option<FilterMode> {
        self.state().filter
    }

    /// Trigger source.
    pub fn trigger_source(&self) -> Option<TriggerSource> {
        self.state().trigger_source
    }

    /// Trigger level.
    pub fn trigger_level(&self) -> f64 {
        self.state().trigger_level
    }

    /// Trigger hysteresis.
    pub fn hysteresis(&self) -> Option<f64> {
        self.state().hysteresis
    }

    /// Trigger edge.
    pub fn trigger_condition(&self) -> Option<TriggerCondition> {
        self.state().condition
    }

    /// Auto-trigger timeout.
    pub fn auto_timeout(&self) -> f64 {
        self.state().auto_timeout
    }

    /// Trigger holdoff.
    pub fn holdoff(&self) -> f64 {
        self.state().holdoff
    }
}

impl Default for MockAnalogDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalogDevice for MockAnalogDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) -> SdkResult<()> {
        let mut s = self.call("reset", String::new())?;
        s.nodes.clear();
        s.running = false;
        Ok(())
    }

    fn close(&mut self) -> SdkResult<()> {
        let mut s = self.call("close", String::new())?;
        s.closed = true;
        Ok(())
    }

    fn io_enable_set(&mut self, enable: bool) -> SdkResult<()> {
        self.call("io_enable_set", enable.to_string())?.io_enabled = enable;
        Ok(())
    }

    fn io_node_set(&mut self, channel: usize, node: usize, value: f64) -> SdkResult<()> {
        self.call("io_node_set", format!("{}, {}, {}", channel, node, value))?
            .nodes
            .insert((channel, node), value);
        Ok(())
    }

    fn io_node_get(&mut self, channel: usize, node: usize) -> SdkResult<f64> {
        let s = self.call("io_node_get", format!("{}, {}", channel, node))?;
        Ok(s.nodes.get(&(channel, node)).copied().unwrap_or(0.0))
    }

    fn io_status(&mut self) -> SdkResult<()> {
        self.call("io_status", String::new())?;
        Ok(())
    }

    fn in_frequency_set(&mut self, hz: f64) -> SdkResult<()> {
        self.call("in_frequency_set", hz.to_string())?.frequency = hz;
        Ok(())
    }

    fn in_buffer_size_set(&mut self, size: usize) -> SdkResult<()> {
        self.call("in_buffer_size_set", size.to_string())?.buffer_size = size;
        Ok(())
    }

    fn in_buffer_size_max(&mut self) -> SdkResult<usize> {
        Ok(self.call("in_buffer_size_max", String::new())?.buffer_max)
    }

    fn in_channel_enable_set(&mut self, channel: usize, enable: bool) -> SdkResult<()> {
        self.call("in_channel_enable_set", format!("{}, {}", channel, enable))?
            .enabled
            .insert(channel, enable);
        Ok(())
    }

    fn in_channel_range_set(&mut self, channel: usize, volts: f64) -> SdkResult<()> {
        self.call("in_channel_range_set", format!("{}, {}", channel, volts))?
            .ranges
            .insert(channel, volts);
        Ok(())
    }

    fn in_channel_offset_set(&mut self, channel: usize, volts: f64) -> SdkResult<()> {
        self.call("in_channel_offset_set", format!("{}, {}", channel, volts))?
            .offsets
            .insert(channel, volts);
        Ok(())
    }

    fn in_channel_filter_set(&mut self, channel: usize, filter: FilterMode) -> SdkResult<()> {
        self.call("in_channel_filter_set", format!("{}, {:?}", channel, filter))?
            .filter = Some(filter);
        Ok(())
    }

    fn in_trigger_source_set(&mut self, source: TriggerSource) -> SdkResult<()> {
        self.call("in_trigger_source_set", format!("{:?}", source))?
            .trigger_source = Some(source);
        Ok(())
    }

    fn in_trigger_level_set(&mut self, volts: f64) -> SdkResult<()> {
        self.call("in_trigger_level_set", volts.to_string())?
            .trigger_level = volts;
        Ok(())
    }

    fn in_trigger_hysteresis_set(&mut self, volts: f64) -> SdkResult<()> {
        self.call("in_trigger_hysteresis_set", volts.to_string())?
            .hysteresis = Some(volts);
        Ok(())
    }

    fn in_trigger_condition_set(&mut self, condition: TriggerCondition) -> SdkResult<()> {
        self.call("in_trigger_condition_set", format!("{:?}", condition))?
            .condition = Some(condition);
        Ok(())
    }

    fn in_trigger_holdoff_set(&mut self, seconds: f64) -> SdkResult<()> {
        self.call("in_trigger_holdoff_set", seconds.to_string())?
            .holdoff = seconds;
        Ok(())
    }

    fn in_trigger_position_set(&mut self, seconds: f64) -> SdkResult<()> {
        self.call("in_trigger_position_set", seconds.to_string())?
            .position = seconds;
        Ok(())
    }

    fn in_trigger_auto_timeout_set(&mut self, seconds: f64) -> SdkResult<()> {
        self.call("in_trigger_auto_timeout_set", seconds.to_string())?
            .auto_timeout = seconds;
        Ok(())
    }

    fn in_configure(&mut self, reconfigure: bool, start: bool) -> SdkResult<()> {
        let mut s = self.call("in_configure", format!("{}, {}", reconfigure, start))?;
        if start {
            s.running = true;
            s.polls_left = s.polls_until_done;
        }
        Ok(())
    }

    fn in_status(&mut self, read_data: bool) -> SdkResult<AcquisitionStatus> {
        let mut s = self.call("in_status", read_data.to_string())?;
        if !s.running {
            return Ok(AcquisitionStatus::Ready);
        }
        if s.never_complete {
            return Ok(AcquisitionStatus::Armed);
        }
        if s.polls_left > 0 {
            s.polls_left -= 1;
            return Ok(AcquisitionStatus::Armed);
        }
        s.running = false;
        Ok(AcquisitionStatus::Done)
    }

    fn in_status_data(&mut self, channel: usize, count: usize) -> SdkResult<Vec<f64>> {
        let s = self.call("in_status_data", format!("{}, {}", channel, count))?;
        let mut data = s.data.get(&channel).cloned().unwrap_or_default();
        data.resize(count, 0.0);
        Ok(data)
    }
}

// =============================================================================
// MockEnumerator - Simulated Device Table
// =============================================================================

/// Fixed device table.
#[derive(Debug, Default)]
pub struct MockEnumerator {
    devices: Vec<(DeviceInfo, MockAnalogDevice)>,
    opened: Arc<Mutex<Vec<String>>>,
}

impl MockEnumerator {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with one available device.
    pub fn single(serial: &str, device: MockAnalogDevice) -> Self {
        Self::new().with_device(serial, true, device)
    }

    /// Add a device; `available: false` marks it as held by another process.
    pub fn with_device(mut self, serial: &str, available: bool, device: MockAnalogDevice) -> Self {
        let info = DeviceInfo {
            serial: serial.to_string(),
            name: device.name.clone(),
            available,
        };
        self.devices.push((info, device));
        self
    }

    /// Serials of devices opened so far; shared with clones of the handle.
    pub fn opened(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.opened)
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn enumerate(&mut self) -> SdkResult<Vec<DeviceInfo>> {
        Ok(self.devices.iter().map(|(info, _)| info.clone()).collect())
    }

    fn open(&mut self, index: usize) -> SdkResult<Box<dyn AnalogDevice>> {
        let (info, device) = self
            .devices
            .get(index)
            .ok_or_else(|| SdkCallError::new("open").with_detail("index out of range"))?;
        self.opened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(info.serial.clone());
        Ok(Box::new(device.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::DeviceRegistry;

    #[test]
    fn test_status_sequence() {
        let mock = MockAnalogDevice::new();
        mock.set_polls_until_done(2);
        let mut dev = mock.clone();
        assert_eq!(dev.in_status(false).unwrap(), AcquisitionStatus::Ready);
        dev.in_configure(false, true).unwrap();
        assert_eq!(dev.in_status(true).unwrap(), AcquisitionStatus::Armed);
        assert_eq!(dev.in_status(true).unwrap(), AcquisitionStatus::Armed);
        assert_eq!(dev.in_status(true).unwrap(), AcquisitionStatus::Done);
    }

    #[test]
    fn test_fail_on_is_recorded() {
        let mock = MockAnalogDevice::new();
        mock.fail_on("in_frequency_set");
        let mut dev = mock.clone();
        assert!(dev.in_frequency_set(1e6).is_err());
        assert_eq!(mock.frequency(), 0.0);
        assert_eq!(mock.calls(), vec!["in_frequency_set(1000000)"]);
    }

    #[test]
    fn test_status_data_padding() {
        let mut dev = MockAnalogDevice::new();
        dev.set_channel_data(0, vec![1.0, 2.0]);
        assert_eq!(dev.in_status_data(0, 3).unwrap(), vec![1.0, 2.0, 0.0]);
        assert_eq!(dev.in_status_data(0, 1).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_registry_suffix_matching() {
        let enumerator = MockEnumerator::new()
            .with_device("SN:AAA111", false, MockAnalogDevice::new())
            .with_device("SN:BBB111", true, MockAnalogDevice::new())
            .with_device("SN:CCC222", true, MockAnalogDevice::new());
        let opened = enumerator.opened();
        let mut registry = DeviceRegistry::new(Box::new(enumerator));
        assert_eq!(registry.refresh().unwrap().len(), 3);

        // Unavailable devices are skipped
        registry.open_by_serial_suffix("111").unwrap();
        registry.open_by_serial_suffix("").unwrap();
        registry.open_by_serial_suffix("C222").unwrap();
        assert_eq!(
            *opened.lock().unwrap(),
            vec!["SN:BBB111", "SN:BBB111", "SN:CCC222"]
        );

        match registry.open_by_serial_suffix("999") {
            Err(err) => assert!(err.is_not_found()),
            Ok(dev) => panic!("opened {}", dev.name()),
        }
    }
}
