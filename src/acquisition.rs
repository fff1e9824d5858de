//! Acquisition configuration and the capture state machine shared by scopes.
//!
//! States: `Idle -> Configured -> Armed -> Done`, and from `Done` back to
//! `Armed` on the next capture. Any setup call returns the machine to
//! `Configured`. A failed or timed-out capture falls back to `Configured`.
//!
//! This module also holds the pieces of trigger and timebase arithmetic that do
//! not depend on a particular instrument, and the guard that rejects a second
//! capture while one is still running.

use crate::error::{AppResult, MeasureError};
use crate::instrument::{Chan, Coupling, SampleMode, Slope};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error};

/// Time-per-division mantissas the horizontal scale can be set to.
pub const TIMEBASE_MANTISSAS: [&str; 3] = ["1.00", "2.50", "5.00"];

/// Hysteresis divisor for ordinary trigger coupling.
pub const HYSTERESIS_DIVISOR: f64 = 300.0;

/// Hysteresis divisor for noise-reject coupling.
pub const NOISE_REJECT_HYSTERESIS_DIVISOR: f64 = 20.0;

/// Auto-trigger timeout, seconds.
pub const AUTO_TRIGGER_TIMEOUT: f64 = 0.02;

/// Check that `sample_interval * samples_per_div` lies on the 1/2.5/5 x 10^n
/// sequence and return it formatted for the instrument (e.g. `"2.50e-5"`).
///
/// # Errors
/// [`MeasureError::TimebaseNotQuantized`] for anything else; the value is
/// never rounded to the nearest allowed step.
pub fn quantize_time_per_div(sample_interval: f64, samples_per_div: usize) -> AppResult<String> {
    let per_div = sample_interval * samples_per_div as f64;
    let formatted = format!("{:.2e}", per_div);
    let mantissa = formatted.split('e').next().unwrap_or_default();
    if per_div > 0.0 && per_div.is_finite() && TIMEBASE_MANTISSAS.contains(&mantissa) {
        Ok(formatted)
    } else {
        Err(MeasureError::TimebaseNotQuantized { per_div: formatted })
    }
}

/// Reject sample counts the instrument buffer cannot hold.
///
/// Exactly `max` is accepted.
pub fn validate_sample_count(requested: usize, max: usize) -> AppResult<usize> {
    if requested == 0 {
        return Err(MeasureError::Configuration(
            "sample count must be at least 1".into(),
        ));
    }
    if requested > max {
        return Err(MeasureError::SampleCountExceeded { requested, max });
    }
    Ok(requested)
}

/// Trigger dead-band for a channel spanning `range` volts.
pub fn trigger_hysteresis(range: f64, coupling: Coupling) -> f64 {
    match coupling {
        Coupling::NoiseReject => range / NOISE_REJECT_HYSTERESIS_DIVISOR,
        _ => range / HYSTERESIS_DIVISOR,
    }
}

/// Where a scope is in its capture cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcquisitionState {
    /// Nothing recorded yet, or the timebase was invalidated
    Idle,
    /// Setup recorded; ready to arm
    Configured,
    /// Capture running
    Armed,
    /// Last capture's data has been read
    Done,
}

/// Vertical setup of one input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelSettings {
    /// Full vertical span in volts (10 divisions)
    pub range: f64,
    /// Volts added before scaling; 0 V is mid-screen
    pub offset: f64,
    /// Input coupling
    pub coupling: Coupling,
    /// Included in the next capture
    pub enabled: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            range: 10.0,
            offset: 0.0,
            coupling: Coupling::Dc,
            enabled: false,
        }
    }
}

/// Horizontal setup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimebaseSettings {
    /// Seconds between stored samples
    pub sample_interval: f64,
    /// Instrument formatted time per division, when the instrument needs one
    pub time_per_div: Option<String>,
    /// Horizontal position, seconds
    pub x_pos: f64,
    /// How raw samples are combined into stored ones
    pub mode: SampleMode,
    /// Samples per channel; also the block length expected from the instrument
    pub sample_count: usize,
}

/// Trigger setup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TriggerSettings {
    /// Input channel or [`Chan::Ext`]
    pub source: Chan,
    /// Trigger coupling; noise reject widens the hysteresis
    pub coupling: Coupling,
    /// Edge
    pub slope: Slope,
    /// Volts
    pub level: f64,
    /// Volts of dead-band around `level`
    pub hysteresis: f64,
    /// Free-running after [`AUTO_TRIGGER_TIMEOUT`] without a trigger
    pub auto: bool,
    /// Seconds; 0 when auto-trigger is off
    pub auto_timeout: f64,
    /// Seconds
    pub holdoff: f64,
    /// Trigger position, seconds
    pub x_pos: f64,
}

/// Everything a scope needs to know to run a capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionConfig {
    /// One entry per input, in channel order
    pub channels: Vec<ChannelSettings>,
    /// `None` until `setup_time`, and again after the input was reprogrammed
    pub timebase: Option<TimebaseSettings>,
    /// `None` until `setup_trigger`
    pub trigger: Option<TriggerSettings>,
}

/// Capture state machine for one scope.
#[derive(Debug, Clone)]
pub struct Acquisition {
    state: AcquisitionState,
    config: AcquisitionConfig,
}

impl Acquisition {
    /// `channel_count` inputs, all disabled.
    pub fn new(channel_count: usize) -> Self {
        Self {
            state: AcquisitionState::Idle,
            config: AcquisitionConfig {
                channels: vec![ChannelSettings::default(); channel_count],
                timebase: None,
                trigger: None,
            },
        }
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Everything recorded so far.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Settings of input `index`.
    pub fn channel(&self, index: usize) -> Option<&ChannelSettings> {
        self.config.channels.get(index)
    }

    /// Record the vertical setup of input `index`.
    pub fn set_channel(&mut self, index: usize, settings: ChannelSettings) {
        if let Some(slot) = self.config.channels.get_mut(index) {
            *slot = settings;
        }
        self.reconfigured();
    }

    /// Remove input `index` from the next capture.
    pub fn disable_channel(&mut self, index: usize) {
        if let Some(slot) = self.config.channels.get_mut(index) {
            slot.enabled = false;
        }
        self.reconfigured();
    }

    /// Indices of enabled inputs, in channel order.
    pub fn enabled_channels(&self) -> Vec<usize> {
        self.config
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.enabled)
            .map(|(i, _)| i)
            .collect()
    }

    /// Record the horizontal setup.
    pub fn set_timebase(&mut self, timebase: TimebaseSettings) {
        self.config.timebase = Some(timebase);
        self.reconfigured();
    }

    /// Recorded horizontal setup.
    pub fn timebase(&self) -> Option<&TimebaseSettings> {
        self.config.timebase.as_ref()
    }

    /// Forget the horizontal setup after the input was reprogrammed behind
    /// the machine's back. The next capture fails until `setup_time` runs.
    pub fn invalidate_timebase(&mut self) {
        if self.config.timebase.take().is_some() {
            debug!("{:?} -> Idle, timebase invalidated", self.state);
        }
        self.state = AcquisitionState::Idle;
    }

    /// Record the trigger setup.
    pub fn set_trigger(&mut self, trigger: TriggerSettings) {
        self.config.trigger = Some(trigger);
        self.reconfigured();
    }

    /// Recorded trigger setup.
    pub fn trigger(&self) -> Option<&TriggerSettings> {
        self.config.trigger.as_ref()
    }

    fn reconfigured(&mut self) {
        self.state = AcquisitionState::Configured;
    }

    /// Start a capture. Needs at least one enabled channel.
    pub fn arm(&mut self) -> AppResult<Vec<usize>> {
        let enabled = self.enabled_channels();
        if enabled.is_empty() {
            return Err(MeasureError::Configuration(
                "no channel enabled for capture".into(),
            ));
        }
        debug!("{:?} -> Armed", self.state);
        self.state = AcquisitionState::Armed;
        Ok(enabled)
    }

    /// Data for the armed capture has been read.
    pub fn complete(&mut self) {
        self.state = AcquisitionState::Done;
    }

    /// The armed capture failed or timed out.
    pub fn abort(&mut self) {
        if self.state == AcquisitionState::Armed {
            self.state = AcquisitionState::Configured;
        }
    }
}

/// How acquisition completion is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Sleep between status polls
    pub interval: Duration,
    /// Give up after this long, triggered or not
    pub ceiling: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(20),
            ceiling: Duration::from_secs(10),
        }
    }
}

/// Paces a status-polling loop and enforces its wall-clock ceiling.
///
/// ```
/// # async fn demo() -> rust_measure::error::AppResult<()> {
/// use rust_measure::acquisition::{PollSettings, Poller};
/// let poller = Poller::start(PollSettings::default());
/// let mut polls = 0;
/// while polls < 3 {
///     polls += 1;
///     poller.wait().await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    settings: PollSettings,
    deadline: tokio::time::Instant,
}

impl Poller {
    /// Start the ceiling clock now.
    pub fn start(settings: PollSettings) -> Self {
        Self {
            settings,
            deadline: tokio::time::Instant::now() + settings.ceiling,
        }
    }

    /// Sleep one poll interval.
    ///
    /// # Errors
    /// [`MeasureError::AcquisitionTimeout`] once the ceiling has passed.
    pub async fn wait(&self) -> AppResult<()> {
        if tokio::time::Instant::now() >= self.deadline {
            return Err(MeasureError::AcquisitionTimeout(self.settings.ceiling));
        }
        tokio::time::sleep(self.settings.interval).await;
        Ok(())
    }
}

/// In-flight marker that makes a second concurrent capture fail fast.
#[derive(Debug, Default)]
pub struct CaptureFlag(AtomicBool);

impl CaptureFlag {
    /// An idle flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a capture as running.
    ///
    /// # Errors
    /// [`MeasureError::CaptureInProgress`] if one already is.
    pub fn try_begin(&self) -> AppResult<CaptureGuard<'_>> {
        if self.0.swap(true, Ordering::AcqRel) {
            error!("get_samples re-entered while a capture is still running");
            return Err(MeasureError::CaptureInProgress);
        }
        Ok(CaptureGuard(&self.0))
    }

    /// True while a capture holds the flag.
    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the [`CaptureFlag`] when dropped.
#[derive(Debug)]
pub struct CaptureGuard<'a>(&'a AtomicBool);

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_quantize_accepts_sequence() {
        assert_eq!(quantize_time_per_div(1e-7, 250).unwrap(), "2.50e-5");
        assert_eq!(quantize_time_per_div(4e-9, 250).unwrap(), "1.00e-6");
        assert_eq!(quantize_time_per_div(2e-3, 250).unwrap(), "5.00e-1");
    }

    #[test]
    fn test_quantize_rejects_other_mantissas() {
        let err = quantize_time_per_div(3.33e-5 / 250.0, 250).unwrap_err();
        assert!(matches!(
            err,
            MeasureError::TimebaseNotQuantized { ref per_div } if per_div == "3.33e-5"
        ));
        assert!(quantize_time_per_div(0.0, 250).is_err());
        assert!(quantize_time_per_div(-1e-7, 250).is_err());
    }

    #[test]
    fn test_sample_count_boundary() {
        assert_eq!(validate_sample_count(2500, 2500).unwrap(), 2500);
        assert!(matches!(
            validate_sample_count(2501, 2500),
            Err(MeasureError::SampleCountExceeded {
                requested: 2501,
                max: 2500
            })
        ));
        assert!(validate_sample_count(0, 2500).is_err());
    }

    #[test]
    fn test_hysteresis_divisors() {
        assert_eq!(trigger_hysteresis(5.0, Coupling::NoiseReject), 0.25);
        assert!((trigger_hysteresis(6.0, Coupling::Dc) - 0.02).abs() < 1e-12);
        assert!((trigger_hysteresis(6.0, Coupling::Ac) - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_state_transitions() {
        let mut acq = Acquisition::new(2);
        assert_eq!(acq.state(), AcquisitionState::Idle);
        assert!(acq.arm().is_err());

        acq.set_channel(
            1,
            ChannelSettings {
                enabled: true,
                ..ChannelSettings::default()
            },
        );
        assert_eq!(acq.state(), AcquisitionState::Configured);
        assert_eq!(acq.arm().unwrap(), vec![1]);
        assert_eq!(acq.state(), AcquisitionState::Armed);
        acq.complete();
        assert_eq!(acq.state(), AcquisitionState::Done);

        acq.arm().unwrap();
        acq.abort();
        assert_eq!(acq.state(), AcquisitionState::Configured);

        acq.disable_channel(1);
        assert!(acq.enabled_channels().is_empty());
    }

    #[test]
    fn test_invalidated_timebase_returns_to_idle() {
        let mut acq = Acquisition::new(1);
        acq.set_timebase(TimebaseSettings {
            sample_interval: 1e-6,
            time_per_div: None,
            x_pos: 0.0,
            mode: SampleMode::Sample,
            sample_count: 1000,
        });
        assert_eq!(acq.state(), AcquisitionState::Configured);

        acq.invalidate_timebase();
        assert_eq!(acq.state(), AcquisitionState::Idle);
        assert!(acq.timebase().is_none());
        assert!(acq.config().timebase.is_none());
    }

    #[test]
    #[traced_test]
    fn test_capture_flag_rejects_reentry() {
        let flag = CaptureFlag::new();
        let guard = flag.try_begin().unwrap();
        assert!(flag.is_busy());
        assert!(matches!(
            flag.try_begin(),
            Err(MeasureError::CaptureInProgress)
        ));
        assert!(logs_contain("re-entered"));
        drop(guard);
        assert!(!flag.is_busy());
        assert!(flag.try_begin().is_ok());
    }

    #[tokio::test]
    async fn test_poller_times_out() {
        let poller = Poller::start(PollSettings {
            interval: Duration::from_millis(5),
            ceiling: Duration::from_millis(30),
        });
        let mut polls = 0;
        let err = loop {
            match poller.wait().await {
                Ok(()) => polls += 1,
                Err(e) => break e,
            }
        };
        assert!(err.is_timeout());
        assert!(polls >= 1);
    }
}
