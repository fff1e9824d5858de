//! Digilent Analog Discovery 2 through the vendor SDK
//!
//! One device is both a two-channel power supply (V+ on [`Chan::Ch1`], V- on
//! [`Chan::Ch2`]) and a two-channel 100 MS/s oscilloscope. Every operation is a
//! sequence of register calls on the [`AnalogDevice`] handle; failures within a
//! sequence are collected by a [`RegisterSequence`] and reported together.
//!
//! Supply nodes per channel: 0 = enable, 1 = voltage, 2 = current limit.

use crate::acquisition::{
    trigger_hysteresis, validate_sample_count, Acquisition, CaptureFlag, ChannelSettings,
    PollSettings, Poller, TimebaseSettings, TriggerSettings, AUTO_TRIGGER_TIMEOUT,
};
use crate::data::{Capture, ChannelTrace};
use crate::error::{AppResult, MeasureError};
use crate::hardware::{
    AcquisitionStatus, AnalogDevice, DeviceRegistry, FilterMode, RegisterSequence, SdkCallError,
    TriggerCondition, TriggerSource,
};
use crate::instrument::{
    Chan, Coupling, OutputReading, Psu, SampleMode, Scope, Slope, TimeSettings,
};
use crate::units::{time_to_str, volt_to_str};
use async_trait::async_trait;
use std::fmt;
use std::ops::RangeInclusive;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Identification reported for every device; the SDK has no `*IDN?`.
pub const IDN: &str = "Digilent Analog Discovery 2";
/// Supply channels and scope inputs alike.
pub const CHANNEL_COUNT: usize = 2;
/// ADC rate; stored samples are this rate divided by a whole number.
pub const BASE_SAMPLE_RATE: f64 = 100e6;
/// V+ supply limits.
pub const POSITIVE_SUPPLY: RangeInclusive<f64> = 0.5..=5.0;
/// V- supply limits.
pub const NEGATIVE_SUPPLY: RangeInclusive<f64> = -5.0..=-0.5;

const NODE_ENABLE: usize = 0;
const NODE_VOLTAGE: usize = 1;
const NODE_CURRENT: usize = 2;

/// Immediate voltage measurement: rate, sample count and input range.
const MEASURE_RATE: f64 = 20e6;
const MEASURE_SAMPLES: usize = 10;
const MEASURE_RANGE: f64 = 5.0;

struct Inner {
    dev: Box<dyn AnalogDevice>,
    acq: Acquisition,
    setpoints: [OutputReading; CHANNEL_COUNT],
    closed: bool,
}

/// Analog Discovery 2 power supply and oscilloscope.
pub struct Ad2 {
    inner: Mutex<Inner>,
    capture: CaptureFlag,
    poll: PollSettings,
}

impl fmt::Debug for Ad2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ad2")
            .field("poll", &self.poll)
            .field("capturing", &self.capture.is_busy())
            .finish_non_exhaustive()
    }
}

fn hardware(context: &str, error: SdkCallError) -> MeasureError {
    MeasureError::Hardware {
        context: context.to_string(),
        failures: vec![error],
    }
}

/// Decimation factor for `sample_interval`: how many ADC samples make one
/// stored sample.
pub fn decimation(sample_interval: f64) -> AppResult<f64> {
    let n = (sample_interval * BASE_SAMPLE_RATE).round();
    if !n.is_finite() || n < 1.0 {
        return Err(MeasureError::Configuration(format!(
            "sample interval {} is below the {} ns ADC period",
            sample_interval,
            1e9 / BASE_SAMPLE_RATE
        )));
    }
    Ok(n)
}

impl Ad2 {
    /// Open the first available device whose serial number ends with `suffix`
    /// (empty for any), reset it and enable the supplies.
    pub fn open(registry: &mut DeviceRegistry, suffix: &str) -> AppResult<Self> {
        let dev = registry.open_by_serial_suffix(suffix)?;
        Self::from_device(dev)
    }

    /// Take over an opened device handle.
    pub fn from_device(mut dev: Box<dyn AnalogDevice>) -> AppResult<Self> {
        let mut seq = RegisterSequence::new("AD2 open");
        seq.step(dev.reset());
        seq.step(dev.io_enable_set(true));
        seq.finish()?;
        info!("Connected to {}", dev.name());
        Ok(Self {
            inner: Mutex::new(Inner {
                dev,
                acq: Acquisition::new(CHANNEL_COUNT),
                setpoints: [OutputReading::default(); CHANNEL_COUNT],
                closed: false,
            }),
            capture: CaptureFlag::new(),
            poll: PollSettings::default(),
        })
    }

    /// Replace the acquisition polling interval and ceiling.
    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Snapshot of the recorded acquisition configuration.
    pub async fn acquisition(&self) -> Acquisition {
        self.inner.lock().await.acq.clone()
    }
}

fn supply_limits(index: usize) -> RangeInclusive<f64> {
    if index == 0 {
        POSITIVE_SUPPLY
    } else {
        NEGATIVE_SUPPLY
    }
}

async fn wait_done(dev: &mut Box<dyn AnalogDevice>, poll: PollSettings) -> AppResult<()> {
    let poller = Poller::start(poll);
    loop {
        let status = dev
            .in_status(true)
            .map_err(|e| hardware("acquisition status", e))?;
        if status == AcquisitionStatus::Done {
            return Ok(());
        }
        poller.wait().await?;
    }
}

async fn run_capture(inner: &mut Inner, poll: PollSettings) -> AppResult<Capture> {
    let enabled = inner.acq.arm()?;
    let timebase = inner.acq.timebase().cloned().ok_or_else(|| {
        MeasureError::Configuration("setup_time must be called before a capture".into())
    })?;
    let count = timebase.sample_count;

    inner
        .dev
        .in_configure(false, true)
        .map_err(|e| hardware("acquisition start", e))?;
    wait_done(&mut inner.dev, poll).await?;

    let mut traces = Vec::with_capacity(enabled.len());
    for index in enabled {
        let settings = inner.acq.channel(index).copied().unwrap_or_default();
        let samples = inner
            .dev
            .in_status_data(index, count)
            .map_err(|e| hardware("acquisition data", e))?;
        let chan = Chan::from_number(index + 1).ok_or_else(|| MeasureError::InvalidChannel {
            channel: (index + 1).to_string(),
            count: CHANNEL_COUNT,
        })?;
        traces.push(ChannelTrace {
            chan,
            samples,
            y_max: settings.offset + settings.range / 2.0,
            y_min: settings.offset - settings.range / 2.0,
        });
    }
    Ok(Capture::new(count, timebase.sample_interval, traces))
}

#[async_trait]
impl Psu for Ad2 {
    async fn set_output(&self, ch: Chan, voltage: f64, current: f64) -> AppResult<()> {
        let index = ch.input_index(CHANNEL_COUNT)?;
        let limits = supply_limits(index);
        if !limits.contains(&voltage) {
            return Err(MeasureError::Configuration(format!(
                "{} setpoint {} V outside {:?}",
                ch, voltage, limits
            )));
        }
        let mut inner = self.inner.lock().await;
        let mut seq = RegisterSequence::new(format!("AD2 supply {}", ch));
        seq.step(inner.dev.io_node_set(index, NODE_ENABLE, 1.0));
        seq.step(inner.dev.io_node_set(index, NODE_VOLTAGE, voltage));
        seq.step(inner.dev.io_node_set(index, NODE_CURRENT, current));
        seq.finish()?;
        inner.setpoints[index] = OutputReading { voltage, current };
        Ok(())
    }

    /// Measured voltage; the supplies have no current monitor, so current is 0.
    async fn get_output(&self, ch: Chan) -> AppResult<OutputReading> {
        let index = ch.input_index(CHANNEL_COUNT)?;
        let mut inner = self.inner.lock().await;
        inner
            .dev
            .io_status()
            .map_err(|e| hardware("supply status", e))?;
        let voltage = inner
            .dev
            .io_node_get(index, NODE_VOLTAGE)
            .map_err(|e| hardware("supply read", e))?;
        Ok(OutputReading {
            voltage,
            current: 0.0,
        })
    }

    async fn get_setpoint(&self, ch: Chan) -> AppResult<OutputReading> {
        let index = ch.input_index(CHANNEL_COUNT)?;
        Ok(self.inner.lock().await.setpoints[index])
    }

    async fn disable(&self, ch: Chan) -> AppResult<()> {
        let index = ch.input_index(CHANNEL_COUNT)?;
        self.inner
            .lock()
            .await
            .dev
            .io_node_set(index, NODE_ENABLE, 0.0)
            .map_err(|e| hardware("supply disable", e))
    }

    async fn query_idn(&self) -> AppResult<String> {
        Ok(IDN.to_string())
    }

    async fn close(&self) -> AppResult<()> {
        close_device(self).await
    }

    fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }
}

/// Shared by both capability impls; only the first call reaches the SDK.
async fn close_device(ad2: &Ad2) -> AppResult<()> {
    let mut inner = ad2.inner.lock().await;
    if inner.closed {
        return Ok(());
    }
    inner.dev.close().map_err(|e| hardware("device close", e))?;
    inner.closed = true;
    info!("Closed {}", inner.dev.name());
    Ok(())
}

#[async_trait]
impl Scope for Ad2 {
    async fn query_idn(&self) -> AppResult<String> {
        Ok(IDN.to_string())
    }

    async fn disable_channel(&self, ch: Chan) -> AppResult<()> {
        let index = ch.input_index(CHANNEL_COUNT)?;
        let mut inner = self.inner.lock().await;
        inner.acq.disable_channel(index);
        inner
            .dev
            .in_channel_enable_set(index, false)
            .map_err(|e| hardware("channel disable", e))
    }

    /// Only DC coupling exists; [`Coupling::Off`] disables the channel.
    async fn setup_channel(
        &self,
        ch: Chan,
        range: f64,
        offset: f64,
        coupling: Coupling,
    ) -> AppResult<()> {
        let index = ch.input_index(CHANNEL_COUNT)?;
        if range.is_nan() || range <= 0.0 {
            return Err(MeasureError::Configuration(format!(
                "range must be positive, got {}",
                range
            )));
        }
        let enabled = match coupling {
            Coupling::Dc => true,
            Coupling::Off => false,
            other => return Err(MeasureError::UnsupportedCoupling(other.to_string())),
        };

        let mut inner = self.inner.lock().await;
        let mut seq = RegisterSequence::new(format!("AD2 {} setup", ch));
        seq.step(inner.dev.in_channel_range_set(index, range));
        seq.step(inner.dev.in_channel_offset_set(index, offset));
        seq.step(inner.dev.in_channel_enable_set(index, enabled));
        seq.finish()?;
        inner.acq.set_channel(
            index,
            ChannelSettings {
                range,
                offset,
                coupling,
                enabled,
            },
        );
        Ok(())
    }

    async fn get_chan_info(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .acq
            .enabled_channels()
            .into_iter()
            .filter_map(|i| {
                inner
                    .acq
                    .channel(i)
                    .map(|c| format!("Ch{} {}/div", i + 1, volt_to_str(c.range / 10.0)))
            })
            .collect()
    }

    /// The interval is rounded to a whole number of 10 ns ADC periods; there
    /// is no 1/2.5/5 restriction.
    async fn setup_time(
        &self,
        sample_interval: f64,
        x_pos: f64,
        mode: SampleMode,
        sample_count: usize,
    ) -> AppResult<()> {
        let n = decimation(sample_interval)?;
        let actual = n / BASE_SAMPLE_RATE;
        let filter = match mode {
            SampleMode::MinMax => FilterMode::MinMax,
            SampleMode::Average => FilterMode::Average,
            SampleMode::Sample => FilterMode::Decimate,
        };

        let mut inner = self.inner.lock().await;
        let max = inner
            .dev
            .in_buffer_size_max()
            .map_err(|e| hardware("buffer size", e))?;
        let sample_count = validate_sample_count(sample_count, max)?;

        let mut seq = RegisterSequence::new("AD2 timebase");
        seq.step(inner.dev.in_frequency_set(BASE_SAMPLE_RATE / n));
        seq.step(inner.dev.in_buffer_size_set(sample_count));
        for index in 0..CHANNEL_COUNT {
            seq.step(inner.dev.in_channel_filter_set(index, filter));
        }
        seq.finish()?;
        debug!("AD2 decimation {} -> {}/sample", n, time_to_str(actual));
        inner.acq.set_timebase(TimebaseSettings {
            sample_interval: actual,
            time_per_div: None,
            x_pos,
            mode,
            sample_count,
        });
        Ok(())
    }

    async fn setup_trigger(
        &self,
        source: Chan,
        coupling: Coupling,
        slope: Slope,
        level: f64,
        auto: bool,
        x_pos: f64,
    ) -> AppResult<()> {
        let sdk_source = match source {
            Chan::Ch1 => TriggerSource::Channel(0),
            Chan::Ch2 => TriggerSource::Channel(1),
            Chan::Ext => TriggerSource::External,
            other => {
                return Err(MeasureError::InvalidChannel {
                    channel: other.to_string(),
                    count: CHANNEL_COUNT,
                })
            }
        };
        if !matches!(coupling, Coupling::Dc | Coupling::NoiseReject) {
            return Err(MeasureError::UnsupportedCoupling(format!(
                "{} (trigger)",
                coupling
            )));
        }
        let condition = match slope {
            Slope::Rising => TriggerCondition::Rise,
            Slope::Falling => TriggerCondition::Fall,
            Slope::Either => TriggerCondition::Either,
        };
        let auto_timeout = if auto { AUTO_TRIGGER_TIMEOUT } else { 0.0 };

        let mut inner = self.inner.lock().await;
        let range = source
            .index()
            .and_then(|i| inner.acq.channel(i))
            .map(|c| c.range)
            .unwrap_or(MEASURE_RANGE);
        let hysteresis = trigger_hysteresis(range, coupling);

        let mut seq = RegisterSequence::new("AD2 trigger");
        seq.step(inner.dev.in_trigger_source_set(sdk_source));
        seq.step(inner.dev.in_trigger_level_set(level));
        seq.step(inner.dev.in_trigger_hysteresis_set(hysteresis));
        seq.step(inner.dev.in_trigger_condition_set(condition));
        seq.step(inner.dev.in_trigger_holdoff_set(0.0));
        seq.step(inner.dev.in_trigger_auto_timeout_set(auto_timeout));
        seq.step(inner.dev.in_trigger_position_set(x_pos));
        seq.finish()?;
        inner.acq.set_trigger(TriggerSettings {
            source,
            coupling,
            slope,
            level,
            hysteresis,
            auto,
            auto_timeout,
            holdoff: 0.0,
            x_pos,
        });
        Ok(())
    }

    /// Only `"VOLT"`: the mean of a short burst at 20 MS/s on a 5 V range.
    ///
    /// This reprograms the analog input. The recorded timebase is dropped and
    /// the channel is recorded at the measurement range, so `get_samples`
    /// fails until `setup_time` is called again.
    async fn measure(&self, ch: Chan, kind: &str) -> AppResult<f64> {
        if kind != "VOLT" {
            return Err(MeasureError::Configuration(format!(
                "AD2 measures VOLT only, not '{}'",
                kind
            )));
        }
        let index = ch.input_index(CHANNEL_COUNT)?;
        let mut inner = self.inner.lock().await;
        let previous = inner.acq.channel(index).copied().unwrap_or_default();
        inner.acq.set_channel(
            index,
            ChannelSettings {
                range: MEASURE_RANGE,
                enabled: true,
                coupling: Coupling::Dc,
                ..previous
            },
        );
        inner.acq.invalidate_timebase();

        let mut seq = RegisterSequence::new("AD2 measure");
        seq.step(inner.dev.in_frequency_set(MEASURE_RATE));
        seq.step(inner.dev.in_buffer_size_set(MEASURE_SAMPLES));
        seq.step(inner.dev.in_channel_enable_set(index, true));
        seq.step(inner.dev.in_channel_range_set(index, MEASURE_RANGE));
        seq.step(inner.dev.in_configure(false, true));
        seq.finish()?;

        wait_done(&mut inner.dev, self.poll).await?;
        let data = inner
            .dev
            .in_status_data(index, MEASURE_SAMPLES)
            .map_err(|e| hardware("measure data", e))?;
        if data.is_empty() {
            return Err(MeasureError::parse("AD2 measure", "no samples"));
        }
        Ok(data.iter().sum::<f64>() / data.len() as f64)
    }

    async fn get_samples(&self) -> AppResult<Capture> {
        let _guard = self.capture.try_begin()?;
        let mut inner = self.inner.lock().await;
        match run_capture(&mut inner, self.poll).await {
            Ok(capture) => {
                inner.acq.complete();
                info!(
                    "Captured {} channel(s) x {} samples from {}",
                    capture.channels.len(),
                    capture.sample_count(),
                    inner.dev.name()
                );
                Ok(capture)
            }
            Err(e) => {
                debug!("Capture aborted: {}", e);
                inner.acq.abort();
                Err(e)
            }
        }
    }

    async fn get_time(&self) -> AppResult<TimeSettings> {
        let inner = self.inner.lock().await;
        let timebase = inner.acq.timebase().ok_or_else(|| {
            MeasureError::Configuration("timebase not configured".into())
        })?;
        Ok(TimeSettings {
            sample_interval: timebase.sample_interval,
            x_pos: timebase.x_pos,
        })
    }

    async fn close(&self) -> AppResult<()> {
        close_device(self).await
    }

    fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionState;
    use crate::hardware::mock::MockAnalogDevice;

    fn ad2() -> (Ad2, MockAnalogDevice) {
        let mock = MockAnalogDevice::new();
        let ad2 = Ad2::from_device(Box::new(mock.clone())).unwrap();
        mock.clear_calls();
        (ad2, mock)
    }

    #[test]
    fn test_decimation() {
        assert_eq!(decimation(1e-6).unwrap(), 100.0);
        assert_eq!(decimation(1e-8).unwrap(), 1.0);
        assert!(decimation(1e-9).is_err());
        assert!(decimation(f64::NAN).is_err());
    }

    #[test]
    fn test_open_resets_and_enables_supplies() {
        let mock = MockAnalogDevice::new();
        Ad2::from_device(Box::new(mock.clone())).unwrap();
        assert_eq!(mock.calls(), vec!["reset()", "io_enable_set(true)"]);
        assert!(mock.io_enabled());
    }

    #[tokio::test]
    async fn test_supply_limits_checked_before_any_call() {
        let (ad2, mock) = ad2();
        assert!(ad2.set_output(Chan::Ch1, 6.0, 0.1).await.is_err());
        assert!(ad2.set_output(Chan::Ch2, 3.0, 0.1).await.is_err());
        assert!(mock.calls().is_empty());

        ad2.set_output(Chan::Ch2, -3.3, 0.1).await.unwrap();
        assert_eq!(mock.node(1, NODE_ENABLE), Some(1.0));
        assert_eq!(mock.node(1, NODE_VOLTAGE), Some(-3.3));
        assert_eq!(ad2.get_setpoint(Chan::Ch2).await.unwrap().voltage, -3.3);
        assert_eq!(ad2.get_output(Chan::Ch2).await.unwrap().voltage, -3.3);

        ad2.disable(Chan::Ch2).await.unwrap();
        assert_eq!(mock.node(1, NODE_ENABLE), Some(0.0));
    }

    #[tokio::test]
    async fn test_supply_failures_are_collected() {
        let (ad2, mock) = ad2();
        mock.fail_on("io_node_set");
        match ad2.set_output(Chan::Ch1, 3.3, 0.1).await.unwrap_err() {
            MeasureError::Hardware { failures, .. } => assert_eq!(failures.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_setup_time_programs_rate_and_filter() {
        let (ad2, mock) = ad2();
        Scope::setup_time(&ad2, 1e-6, 0.0, SampleMode::Average, 1000)
            .await
            .unwrap();
        assert_eq!(mock.frequency(), 1e6);
        assert_eq!(mock.buffer_size(), 1000);
        assert_eq!(mock.filter(), Some(FilterMode::Average));

        mock.set_buffer_max(100);
        let err = Scope::setup_time(&ad2, 1e-6, 0.0, SampleMode::Sample, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, MeasureError::SampleCountExceeded { .. }));
    }

    #[tokio::test]
    async fn test_capture() {
        let (ad2, mock) = ad2();
        mock.set_channel_data(0, vec![0.5, 1.0, 1.5, 2.0]);
        Scope::setup_channel(&ad2, Chan::Ch1, 5.0, 0.0, Coupling::Dc)
            .await
            .unwrap();
        Scope::setup_time(&ad2, 1e-6, 0.0, SampleMode::Sample, 4)
            .await
            .unwrap();

        let capture = ad2.get_samples().await.unwrap();
        assert_eq!(capture.channels.len(), 1);
        assert_eq!(capture.channels[0].samples, vec![0.5, 1.0, 1.5, 2.0]);
        assert_eq!(capture.channels[0].y_max, 2.5);
        assert_eq!(capture.channels[0].y_min, -2.5);
        assert_eq!(capture.time[1], 1e-6);
        assert!(!ad2.capture.is_busy());
    }

    #[tokio::test]
    async fn test_measure_volt_only() {
        let (ad2, mock) = ad2();
        mock.set_channel_data(0, vec![1.0; 10]);
        assert_eq!(Scope::measure(&ad2, Chan::Ch1, "VOLT").await.unwrap(), 1.0);
        assert!(Scope::measure(&ad2, Chan::Ch1, "FREQ").await.is_err());
    }

    #[tokio::test]
    async fn test_capture_after_measure_needs_new_timebase() {
        let (ad2, mock) = ad2();
        mock.set_channel_data(0, vec![1.0; 10]);
        Scope::setup_channel(&ad2, Chan::Ch1, 2.0, 0.0, Coupling::Dc)
            .await
            .unwrap();
        Scope::setup_time(&ad2, 1e-6, 0.0, SampleMode::Sample, 1000)
            .await
            .unwrap();

        Scope::measure(&ad2, Chan::Ch1, "VOLT").await.unwrap();
        assert_eq!(mock.frequency(), MEASURE_RATE);
        assert_eq!(mock.buffer_size(), MEASURE_SAMPLES);

        let acq = ad2.acquisition().await;
        assert_eq!(acq.state(), AcquisitionState::Idle);
        assert_eq!(acq.channel(0).unwrap().range, MEASURE_RANGE);
        assert!(Scope::get_time(&ad2).await.is_err());
        match ad2.get_samples().await {
            Err(MeasureError::Configuration(msg)) => assert!(msg.contains("setup_time")),
            other => panic!("unexpected {:?}", other),
        }

        Scope::setup_time(&ad2, 1e-6, 0.0, SampleMode::Sample, 10)
            .await
            .unwrap();
        let capture = ad2.get_samples().await.unwrap();
        assert_eq!(capture.sample_count(), 10);
        assert_eq!(capture.channels[0].y_max, 2.5);
    }

    #[tokio::test]
    async fn test_close_reaches_sdk_once() {
        let (ad2, mock) = ad2();
        Psu::close(&ad2).await.unwrap();
        Scope::close(&ad2).await.unwrap();
        assert!(mock.is_closed());
        let closes = mock.calls().iter().filter(|c| c.starts_with("close")).count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_debug_output() {
        let (ad2, _mock) = ad2();
        let text = format!("{:?}", ad2);
        assert!(text.starts_with("Ad2"));
        assert!(text.contains("capturing: false"));
    }

    #[tokio::test]
    async fn test_ac_coupling_rejected() {
        let (ad2, mock) = ad2();
        let err = Scope::setup_channel(&ad2, Chan::Ch1, 5.0, 0.0, Coupling::Ac)
            .await
            .unwrap_err();
        assert!(matches!(err, MeasureError::UnsupportedCoupling(_)));
        assert!(mock.calls().is_empty());
    }
}
