//! Capability traits implemented by the drivers, and the vocabulary they share.
//!
//! A driver implements one trait per role it can play: [`Psu`], [`Dmm`] or
//! [`Scope`]. All methods take `&self`; drivers serialise access internally, so
//! a `Box<dyn Scope>` can be shared across tasks behind an `Arc`.

use crate::data::Capture;
use crate::error::{AppResult, MeasureError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel selector shared by all instrument families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chan {
    /// The trigger circuit itself (trigger frequency counter)
    Trig,
    /// Input 1
    Ch1,
    /// Input 2
    Ch2,
    /// Input 3
    Ch3,
    /// Input 4
    Ch4,
    /// Input 5
    Ch5,
    /// External trigger input
    Ext,
    /// External trigger input, divided by 5
    Ext5,
    /// External trigger input, divided by 10
    Ext10,
    /// Mains (AC line)
    Mains,
}

impl Chan {
    /// Numbered input channels in order.
    pub const INPUTS: [Chan; 5] = [Chan::Ch1, Chan::Ch2, Chan::Ch3, Chan::Ch4, Chan::Ch5];

    /// `Ch1` for 1, `Ch2` for 2, ...
    pub fn from_number(number: usize) -> Option<Chan> {
        number
            .checked_sub(1)
            .and_then(|i| Self::INPUTS.get(i).copied())
    }

    /// 1-based channel number for `Ch1..Ch5`.
    pub fn number(self) -> Option<usize> {
        Self::INPUTS.iter().position(|c| *c == self).map(|i| i + 1)
    }

    /// 0-based index for `Ch1..Ch5`.
    pub fn index(self) -> Option<usize> {
        self.number().map(|n| n - 1)
    }

    /// Validate that this is an input channel on an instrument with `count`
    /// channels and return its 0-based index.
    pub fn input_index(self, count: usize) -> AppResult<usize> {
        match self.index() {
            Some(i) if i < count => Ok(i),
            _ => Err(MeasureError::InvalidChannel {
                channel: self.to_string(),
                count,
            }),
        }
    }
}

impl fmt::Display for Chan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.number() {
            Some(n) => write!(f, "Ch{}", n),
            None => f.write_str(match self {
                Chan::Trig => "TRIG",
                Chan::Ext => "EXT",
                Chan::Ext5 => "EXT5",
                Chan::Ext10 => "EXT10",
                _ => "MAINS",
            }),
        }
    }
}

/// Input or trigger coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coupling {
    /// Channel switched off
    Off,
    /// DC coupled
    Dc,
    /// AC coupled
    Ac,
    /// Input grounded
    Gnd,
    /// High frequencies filtered out
    HfReject,
    /// Low frequencies filtered out
    LfReject,
    /// Trigger with widened hysteresis
    NoiseReject,
}

impl fmt::Display for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Trigger edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slope {
    /// Rising edge
    Rising,
    /// Falling edge
    Falling,
    /// Either edge
    Either,
}

/// How raw samples are reduced to one stored sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleMode {
    /// Keep minimum and maximum (peak detect)
    MinMax,
    /// Keep one sample (decimate)
    Sample,
    /// Average the raw samples
    Average,
}

/// What a multimeter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngUnit {
    /// DC volts
    VoltDc,
    /// AC volts, true RMS
    VoltAcRms,
    /// AC volts, average responding
    VoltAcAvg,
    /// DC amps
    CurrentDc,
    /// AC amps, true RMS
    CurrentAcRms,
    /// AC amps, average responding
    CurrentAcAvg,
    /// Frequency
    Hz,
    /// Resistance
    Ohm,
    /// Temperature
    Celsius,
}

/// Multimeter configuration passed to [`Dmm::configure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmmSetup {
    /// Input
    pub chan: Chan,
    /// Measurement function
    pub unit: EngUnit,
    /// Instrument range token; `None` picks the driver default
    pub range: Option<String>,
    /// Requested resolution, if the meter takes one
    pub resolution: Option<f64>,
    /// Readings per second
    pub rate: Option<f64>,
}

impl DmmSetup {
    /// Channel 1, default range.
    pub fn new(unit: EngUnit) -> Self {
        Self {
            chan: Chan::Ch1,
            unit,
            range: None,
            resolution: None,
            rate: None,
        }
    }

    /// Use a specific range token
    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }
}

/// Voltage and current of one supply channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct OutputReading {
    /// Volts
    pub voltage: f64,
    /// Amps
    pub current: f64,
}

/// Horizontal settings reported by a scope.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TimeSettings {
    /// Seconds between stored samples
    pub sample_interval: f64,
    /// Horizontal position in seconds
    pub x_pos: f64,
}

/// Capability for programmable power supplies.
#[async_trait]
pub trait Psu: Send + Sync {
    /// Program voltage and current limit and switch the output on.
    async fn set_output(&self, ch: Chan, voltage: f64, current: f64) -> AppResult<()>;
    /// Measured output
    async fn get_output(&self, ch: Chan) -> AppResult<OutputReading>;
    /// Programmed setpoints
    async fn get_setpoint(&self, ch: Chan) -> AppResult<OutputReading>;
    /// Switch the output off (or to 0 V where there is no switch).
    async fn disable(&self, ch: Chan) -> AppResult<()>;
    /// Identification string.
    async fn query_idn(&self) -> AppResult<String>;
    /// Release the instrument. Safe to call twice.
    async fn close(&self) -> AppResult<()>;
    /// Number of channels.
    fn channel_count(&self) -> usize;
}

/// Capability for digital multimeters.
#[async_trait]
pub trait Dmm: Send + Sync {
    /// Select function and range.
    async fn configure(&self, setup: DmmSetup) -> AppResult<()>;
    /// One reading in the configured function.
    async fn measure(&self) -> AppResult<f64>;
    /// Identification string.
    async fn query_idn(&self) -> AppResult<String>;
    /// Release the instrument. Safe to call twice.
    async fn close(&self) -> AppResult<()>;
}

/// Capability for oscilloscopes.
#[async_trait]
pub trait Scope: Send + Sync {
    /// Identification string.
    async fn query_idn(&self) -> AppResult<String>;

    /// Remove `ch` from the next capture.
    async fn disable_channel(&self, ch: Chan) -> AppResult<()>;

    /// `range` is the full vertical span in volts (10 divisions).
    async fn setup_channel(
        &self,
        ch: Chan,
        range: f64,
        offset: f64,
        coupling: Coupling,
    ) -> AppResult<()>;

    /// One line per enabled channel, e.g. "Ch1 1.00V/div".
    async fn get_chan_info(&self) -> Vec<String>;

    /// Horizontal setup; `sample_count` becomes the expected block length.
    async fn setup_time(
        &self,
        sample_interval: f64,
        x_pos: f64,
        mode: SampleMode,
        sample_count: usize,
    ) -> AppResult<()>;

    /// Trigger source, edge and level; `auto` free-runs after a short timeout.
    async fn setup_trigger(
        &self,
        source: Chan,
        coupling: Coupling,
        slope: Slope,
        level: f64,
        auto: bool,
        x_pos: f64,
    ) -> AppResult<()>;

    /// Single measurement such as "FREQ", "CRMS" or "PK2PK".
    async fn measure(&self, ch: Chan, kind: &str) -> AppResult<f64>;

    /// Acquire one sweep on all enabled channels.
    ///
    /// Must not be called again while a previous call is still running; the
    /// second call fails with [`MeasureError::CaptureInProgress`].
    async fn get_samples(&self) -> AppResult<Capture>;

    /// Horizontal settings as the instrument reports them.
    async fn get_time(&self) -> AppResult<TimeSettings>;
    /// Release the instrument. Safe to call twice.
    async fn close(&self) -> AppResult<()>;
    /// Number of channels.
    fn channel_count(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_numbering() {
        assert_eq!(Chan::from_number(1), Some(Chan::Ch1));
        assert_eq!(Chan::from_number(0), None);
        assert_eq!(Chan::from_number(6), None);
        assert_eq!(Chan::Ch3.index(), Some(2));
        assert_eq!(Chan::Trig.number(), None);
        assert_eq!(Chan::Ch2.to_string(), "Ch2");
        assert_eq!(Chan::Ext10.to_string(), "EXT10");
    }

    #[test]
    fn test_input_index_bounds() {
        assert_eq!(Chan::Ch2.input_index(2).unwrap(), 1);
        assert!(Chan::Ch3.input_index(2).is_err());
        assert!(Chan::Trig.input_index(4).is_err());
    }
}
