//! Length-prefixed binary blocks used by curve transfers.
//!
//! Layout: `#`, one ASCII digit `N` in `1..=4`, `N` ASCII digits giving the
//! payload length `L`, then exactly `L` raw bytes.
//!
//! Decoding is strict. A declared length that differs from the bytes actually
//! present, or from the sample count the caller asked for, is an error; data is
//! never truncated or padded to fit.

use crate::error::{AppResult, MeasureError};
use crate::instrument::Connection;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// First byte of every block.
pub const BLOCK_MARKER: u8 = b'#';

/// Largest length-field width accepted.
pub const MAX_LENGTH_DIGITS: usize = 4;

/// Header of a block: how many payload bytes follow and how long the header was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Declared payload length
    pub length: usize,
    /// Header size in bytes (`2 + digit count`)
    pub header_len: usize,
}

impl BlockHeader {
    /// Validate the marker and digit-count bytes; returns the number of length
    /// digits that follow.
    pub fn digit_count(marker: u8, count: u8) -> AppResult<usize> {
        if marker != BLOCK_MARKER {
            return Err(MeasureError::BlockFormat(format!(
                "expected '#', got 0x{:02x}",
                marker
            )));
        }
        match count {
            b'1'..=b'4' => Ok(usize::from(count - b'0')),
            other => Err(MeasureError::BlockFormat(format!(
                "length digit count must be 1-4, got 0x{:02x}",
                other
            ))),
        }
    }

    /// Accumulate the ASCII length digits into the payload length.
    pub fn length_from_digits(digits: &[u8]) -> AppResult<usize> {
        digits.iter().try_fold(0usize, |acc, &d| {
            if d.is_ascii_digit() {
                Ok(acc * 10 + usize::from(d - b'0'))
            } else {
                Err(MeasureError::BlockFormat(format!(
                    "non-digit 0x{:02x} in length field",
                    d
                )))
            }
        })
    }

    /// Parse a complete header from the start of `data`.
    pub fn parse(data: &[u8]) -> AppResult<Self> {
        if data.len() < 2 {
            return Err(MeasureError::BlockFormat("truncated header".into()));
        }
        let digits = Self::digit_count(data[0], data[1])?;
        let end = 2 + digits;
        let field = data
            .get(2..end)
            .ok_or_else(|| MeasureError::BlockFormat("truncated length field".into()))?;
        Ok(Self {
            length: Self::length_from_digits(field)?,
            header_len: end,
        })
    }
}

/// One decoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformBlock {
    payload: Bytes,
}

impl WaveformBlock {
    /// Wrap a payload for encoding.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize with the shortest length field that fits.
    ///
    /// # Errors
    /// Payloads longer than 9999 bytes do not fit a four-digit length field.
    pub fn encode(&self) -> AppResult<Vec<u8>> {
        let length = self.payload.len().to_string();
        if length.len() > MAX_LENGTH_DIGITS {
            return Err(MeasureError::BlockFormat(format!(
                "payload of {} bytes needs more than {} length digits",
                self.payload.len(),
                MAX_LENGTH_DIGITS
            )));
        }
        let mut out = Vec::with_capacity(2 + length.len() + self.payload.len());
        out.push(BLOCK_MARKER);
        out.push(b'0' + length.len() as u8);
        out.extend_from_slice(length.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a complete block held in memory.
    ///
    /// `data` must contain the header and exactly the declared number of
    /// payload bytes, and the declared length must equal `expected`.
    pub fn parse(data: &[u8], expected: usize) -> AppResult<Self> {
        let header = BlockHeader::parse(data)?;
        check_expected(header.length, expected)?;
        let payload = &data[header.header_len..];
        if payload.len() != header.length {
            return Err(MeasureError::LengthMismatch {
                expected: header.length,
                actual: payload.len(),
            });
        }
        Ok(Self::new(Bytes::copy_from_slice(payload)))
    }
}

fn check_expected(declared: usize, expected: usize) -> AppResult<()> {
    if declared == expected {
        Ok(())
    } else {
        Err(MeasureError::LengthMismatch {
            expected,
            actual: declared,
        })
    }
}

/// Read one block from `conn`, using `timeout` for the whole transfer.
///
/// Slow transports deliver the payload in pieces; reading continues until all
/// declared bytes are in or `timeout` runs out. The connection's own timeout is
/// restored afterwards whether or not the read succeeded.
pub async fn read_block(
    conn: &mut Connection,
    expected: usize,
    timeout: Duration,
) -> AppResult<WaveformBlock> {
    let saved = conn.timeout();
    conn.set_timeout(timeout);
    let result = read_block_inner(conn, expected).await;
    conn.set_timeout(saved);
    result
}

async fn read_block_inner(conn: &mut Connection, expected: usize) -> AppResult<WaveformBlock> {
    let start = conn.read_binary(2).await?;
    if start.len() < 2 {
        return Err(MeasureError::BlockFormat(
            "no block header before timeout".into(),
        ));
    }
    let digits = BlockHeader::digit_count(start[0], start[1])?;

    let field = conn.read_binary(digits).await?;
    if field.len() != digits {
        return Err(MeasureError::BlockFormat("truncated length field".into()));
    }
    let declared = BlockHeader::length_from_digits(&field)?;
    check_expected(declared, expected)?;

    let payload = conn.read_binary(declared).await?;
    if payload.len() != declared {
        return Err(MeasureError::LengthMismatch {
            expected: declared,
            actual: payload.len(),
        });
    }
    debug!("[{}] block of {} bytes", conn.address(), declared);
    Ok(WaveformBlock::new(payload))
}
