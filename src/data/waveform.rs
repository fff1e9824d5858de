//! Conversion of raw scope samples to physical values, and the capture layout
//! handed to plotting code.

use crate::instrument::Chan;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Raw code at the top (and, negated, bottom) of the screen.
///
/// Eight-bit curve data spans 25 codes per division over 10 divisions centred
/// on zero, so the visible extremes are +/-125.
pub const FULL_SCALE_CODE: f64 = 125.0;

/// Vertical scaling of one channel as reported by the instrument after an
/// acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelScale {
    /// Volts per raw code
    pub y_mult: f64,
    /// Raw code offset
    pub y_offset: f64,
}

impl ChannelScale {
    /// Scale with the given multiplier and offset.
    pub fn new(y_mult: f64, y_offset: f64) -> Self {
        Self { y_mult, y_offset }
    }

    /// `(raw - y_offset) * y_mult`
    pub fn to_physical(&self, raw: f64) -> f64 {
        (raw - self.y_offset) * self.y_mult
    }

    /// Convert a payload of signed 8-bit samples.
    pub fn convert(&self, payload: &[u8]) -> Vec<f64> {
        payload
            .iter()
            .map(|&b| self.to_physical(f64::from(b as i8)))
            .collect()
    }

    /// Physical value at the top of the screen.
    pub fn y_max(&self) -> f64 {
        self.to_physical(FULL_SCALE_CODE)
    }

    /// Physical value at the bottom of the screen.
    pub fn y_min(&self) -> f64 {
        self.to_physical(-FULL_SCALE_CODE)
    }
}

/// Samples of one channel in a capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelTrace {
    /// Source channel
    pub chan: Chan,
    /// Volts, one per time point
    pub samples: Vec<f64>,
    /// Display bound at the top of the screen
    pub y_max: f64,
    /// Display bound at the bottom of the screen
    pub y_min: f64,
}

impl ChannelTrace {
    /// Decode a raw payload with `scale`.
    pub fn from_raw(chan: Chan, payload: &[u8], scale: &ChannelScale) -> Self {
        Self {
            chan,
            samples: scale.convert(payload),
            y_max: scale.y_max(),
            y_min: scale.y_min(),
        }
    }
}

/// One sweep over all enabled channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capture {
    /// Time of each sample relative to the first, in seconds
    pub time: Vec<f64>,
    /// Enabled channels in channel order
    pub channels: Vec<ChannelTrace>,
    /// When the data was read back
    pub acquired_at: DateTime<Utc>,
}

impl Capture {
    /// Build a capture whose time axis is `index * interval`.
    pub fn new(sample_count: usize, interval: f64, channels: Vec<ChannelTrace>) -> Self {
        Self {
            time: (0..sample_count).map(|i| i as f64 * interval).collect(),
            channels,
            acquired_at: Utc::now(),
        }
    }

    /// Samples per channel.
    pub fn sample_count(&self) -> usize {
        self.time.len()
    }

    /// Row layout consumed by plotting code.
    ///
    /// Row 0 is time, rows `1..=K` are the K channels in channel order, then one
    /// row of per-channel `y_max` and one of per-channel `y_min`.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        let mut rows = Vec::with_capacity(self.channels.len() + 3);
        rows.push(self.time.clone());
        rows.extend(self.channels.iter().map(|c| c.samples.clone()));
        rows.push(self.channels.iter().map(|c| c.y_max).collect());
        rows.push(self.channels.iter().map(|c| c.y_min).collect());
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_raw_with_zero_offset_is_zero() {
        for s in [0.0, 1e-3, 0.04, -2.5, 1e6] {
            assert_eq!(ChannelScale::new(s, 0.0).to_physical(0.0), 0.0);
        }
    }

    #[test]
    fn test_scaling_is_linear_in_raw() {
        let scale = ChannelScale::new(0.04, 12.0);
        let a = scale.to_physical(10.0);
        let b = scale.to_physical(20.0);
        let c = scale.to_physical(30.0);
        assert!(((b - a) - (c - b)).abs() < 1e-12);
        assert!((b - a - 10.0 * 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_payload_bytes_are_signed() {
        let scale = ChannelScale::new(0.5, 0.0);
        assert_eq!(scale.convert(&[0x00, 0x7f, 0x80, 0xff]), vec![0.0, 63.5, -64.0, -0.5]);
    }

    #[test]
    fn test_display_bounds_use_full_scale_code() {
        let scale = ChannelScale::new(0.04, 0.0);
        assert!((scale.y_max() - 5.0).abs() < 1e-12);
        assert!((scale.y_min() + 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_row_layout() {
        let scale = ChannelScale::new(1.0, 0.0);
        let capture = Capture::new(
            3,
            1e-6,
            vec![
                ChannelTrace::from_raw(Chan::Ch1, &[1, 2, 3], &scale),
                ChannelTrace::from_raw(Chan::Ch3, &[4, 5, 6], &ChannelScale::new(2.0, 0.0)),
            ],
        );
        let rows = capture.to_rows();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0], vec![0.0, 1e-6, 2e-6]);
        assert_eq!(rows[1], vec![1.0, 2.0, 3.0]);
        assert_eq!(rows[2], vec![8.0, 10.0, 12.0]);
        assert_eq!(rows[3], vec![125.0, 250.0]);
        assert_eq!(rows[4], vec![-125.0, -250.0]);
    }
}
