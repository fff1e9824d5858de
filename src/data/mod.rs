//! Waveform data: the binary block codec and raw-to-physical conversion.

pub mod block;
pub mod waveform;

pub use block::{read_block, BlockHeader, WaveformBlock};
pub use waveform::{Capture, ChannelScale, ChannelTrace, FULL_SCALE_CODE};
