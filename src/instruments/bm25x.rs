//! Brymen BM25x handheld multimeter with USB/serial LCD link
//!
//! The meter never answers commands. It streams a 15-byte frame per display
//! update at 9600 baud, each frame a bitmap of the LCD segments. A background
//! task reads and decodes the frames and publishes the latest snapshot on a
//! `tokio::sync::watch` channel; `measure` just looks at the newest snapshot.
//!
//! ## Frame layout
//!
//! | Byte | Content |
//! |---|---|
//! | 0 | `0x02` start marker |
//! | 1 | bit0 crest/min/max, bit1 AC, bit2 DC |
//! | 3..=10 | four digits as segment pairs; bit0 of 3 is the minus sign, bit0 of 5/7/9 the decimal points |
//! | 11..=14 | unit and prefix annunciators; bit3 of each is hold/crest/min/max |

use crate::config::InstrumentConfig;
use crate::error::{AppResult, MeasureError};
use crate::instrument::{Chan, Connection, ConnectionOptions, Dmm, DmmSetup, Eol};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fixed link speed.
pub const BAUD_RATE: u32 = 9600;
/// A snapshot turns into [`LcdState::NoData`] after this long without a frame.
pub const TIMEOUT: Duration = Duration::from_millis(1000);
/// Bytes per display frame.
pub const FRAME_LEN: usize = 15;
/// First byte of every frame.
pub const FRAME_START: u8 = 0x02;
/// Reply of `query_idn` while frames are arriving.
pub const IDN: &str = "Lcd multimeter BM25x is online and ok";

const IDLE_POLL: Duration = Duration::from_millis(10);
const STARTUP_POLLS: usize = 100;

/// One decoded display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LcdReading {
    /// Displayed value in the displayed unit
    pub value: f64,
    /// Unit as shown on the display, e.g. `"Vdc"`, `"mAac"`, `"kohm"`, `"C"`
    pub unit: String,
}

/// Latest state published by the reader task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LcdState {
    /// No frame seen since the port was opened
    Waiting,
    /// Latest decoded display
    Reading(LcdReading),
    /// A frame arrived but could not be used
    Invalid(String),
    /// No frame within [`TIMEOUT`]
    NoData,
}

fn segment_digit(b1: u8, b2: u8) -> Option<u32> {
    match (b1 & 0x0E, b2 & 0x0F) {
        (0x00, 0x0A) => Some(1),
        (0x0A, 0x0D) => Some(2),
        (0x08, 0x0F) => Some(3),
        (0x04, 0x0E) => Some(4),
        (0x0C, 0x07) => Some(5),
        (0x0E, 0x07) => Some(6),
        (0x08, 0x0A) => Some(7),
        (0x0E, 0x0F) => Some(8),
        (0x0C, 0x0F) => Some(9),
        (0x0E, 0x0B) => Some(0),
        _ => None,
    }
}

/// Divisor from the decimal point position; negative when the minus sign is lit.
fn divisor(frame: &[u8]) -> f64 {
    let mut e = 1.0;
    if frame[9] & 1 != 0 {
        e = 10.0;
    }
    if frame[7] & 1 != 0 {
        e = 100.0;
    }
    if frame[5] & 1 != 0 {
        e = 1000.0;
    }
    if frame[3] & 1 != 0 {
        e = -e;
    }
    e
}

fn unit(frame: &[u8]) -> String {
    if frame[9] == 0x0E && frame[10] == 0x01 {
        return "C".into();
    }
    if frame[9] == 0x0E && frame[10] == 0x04 {
        return "F".into();
    }
    let mut u = String::new();
    let base = [
        (frame[14] & 0x04, "V"),
        (frame[12] & 0x02, "Hz"),
        (frame[12] & 0x04, "ohm"),
        (frame[13] & 0x04, "F"),
        (frame[14] & 0x02, "A"),
        (frame[11] & 0x04, "dBm"),
    ];
    // Later annunciators win, as on the display
    if let Some((_, name)) = base.iter().rev().find(|(bit, _)| *bit != 0) {
        u.push_str(name);
    }
    if frame[1] & 0x02 != 0 {
        u.push_str("ac");
    }
    if frame[1] & 0x04 != 0 {
        u.push_str("dc");
    }
    let prefix = [
        (frame[11] & 0x02, "M"),
        (frame[11] & 0x01, "k"),
        (frame[13] & 0x01, "m"),
        (frame[13] & 0x02, "u"),
        (frame[12] & 0x01, "n"),
    ];
    if let Some((_, p)) = prefix.iter().find(|(bit, _)| *bit != 0) {
        u.insert_str(0, p);
    }
    u
}

/// Decode one complete frame.
///
/// # Errors
/// [`MeasureError::Parse`] for a frame without the start marker, with hold,
/// crest, min or max active, or with a display that is not a number.
pub fn decode_frame(frame: &[u8]) -> AppResult<LcdReading> {
    let hex = || {
        frame
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    };
    if frame.len() != FRAME_LEN || frame[0] != FRAME_START {
        return Err(MeasureError::parse("LCD frame", hex()));
    }
    if frame[11..=14].iter().any(|b| b & 0x08 != 0) || frame[1] & 0x01 != 0 {
        return Err(MeasureError::parse("LCD frame (hold/crest/min/max active)", hex()));
    }
    let d1 = segment_digit(frame[3], frame[4]);
    let d2 = segment_digit(frame[5], frame[6]);
    let d3 = segment_digit(frame[7], frame[8]);
    let d4 = segment_digit(frame[9], frame[10]);

    let value = match (d1, d2, d3, d4) {
        // Last digit shows C or F: three-digit temperature
        (Some(a), Some(b), Some(c), None) => f64::from(a * 100 + b * 10 + c),
        (_, _, _, None) => return Err(MeasureError::parse("LCD digits", hex())),
        // Blank leading digits read as zero
        (a, b, c, Some(d)) => {
            let n = a.unwrap_or(0) * 1000 + b.unwrap_or(0) * 100 + c.unwrap_or(0) * 10 + d;
            f64::from(n) / divisor(frame)
        }
    };
    Ok(LcdReading {
        value,
        unit: unit(frame),
    })
}

/// Splits the byte stream into frames, resynchronising on the start marker.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add received bytes and return every complete frame.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match self.buf.iter().position(|&b| b == FRAME_START) {
                Some(start) => {
                    self.buf.drain(..start);
                }
                None => {
                    self.buf.clear();
                    break;
                }
            }
            if self.buf.len() < FRAME_LEN {
                break;
            }
            frames.push(self.buf.drain(..FRAME_LEN).collect());
        }
        frames
    }
}

async fn read_frames(mut conn: Connection, tx: watch::Sender<LcdState>) {
    let mut assembler = FrameAssembler::new();
    let mut last_frame = tokio::time::Instant::now();
    let mut buf = [0u8; 64];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) => {
                if last_frame.elapsed() >= TIMEOUT {
                    tx.send_if_modified(|state| {
                        let changed = *state != LcdState::NoData;
                        *state = LcdState::NoData;
                        changed
                    });
                }
                tokio::time::sleep(IDLE_POLL).await;
            }
            Ok(n) => {
                for frame in assembler.push(&buf[..n]) {
                    last_frame = tokio::time::Instant::now();
                    let state = match decode_frame(&frame) {
                        Ok(reading) => LcdState::Reading(reading),
                        Err(e) => LcdState::Invalid(e.to_string()),
                    };
                    debug!("[{}] {:?}", conn.address(), state);
                    tx.send_replace(state);
                }
            }
            Err(e) => {
                warn!("[{}] reader stopped: {}", conn.address(), e);
                tx.send_replace(LcdState::NoData);
                break;
            }
        }
        if tx.is_closed() {
            break;
        }
    }
    conn.close().await;
}

/// BM25x multimeter.
pub struct Bm25x {
    address: String,
    state: watch::Receiver<LcdState>,
    task: JoinHandle<()>,
}

impl Bm25x {
    /// Connection options for the meter's serial link.
    pub fn default_options() -> ConnectionOptions {
        ConnectionOptions::default()
            .with_baud_rate(BAUD_RATE)
            .with_timeout(TIMEOUT)
            .with_eol(Eol::None)
    }

    /// Open the serial port at `address`.
    pub async fn open(address: &str) -> AppResult<Self> {
        let conn = Connection::open(address, Self::default_options()).await?;
        Ok(Self::from_connection(conn).await)
    }

    /// Open with overrides from configuration. An address is required.
    pub async fn open_with(config: &InstrumentConfig) -> AppResult<Self> {
        if config.address.is_empty() {
            return Err(MeasureError::Configuration(format!(
                "instrument '{}': the BM25x does not answer *IDN?, an address is required",
                config.id
            )));
        }
        let options = config.connection_options(Self::default_options());
        let conn = Connection::open(&config.address, options).await?;
        Ok(Self::from_connection(conn).await)
    }

    /// Start the reader on `conn` and wait up to one second for a first frame.
    ///
    /// Returns even if nothing arrives; `measure` then reports no data.
    pub async fn from_connection(conn: Connection) -> Self {
        let address = conn.address().to_string();
        let (tx, rx) = watch::channel(LcdState::Waiting);
        let task = tokio::spawn(read_frames(conn, tx));
        let dmm = Self {
            address,
            state: rx,
            task,
        };
        for _ in 0..STARTUP_POLLS {
            if *dmm.state.borrow() != LcdState::Waiting {
                break;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        info!("BM25x on {}: {:?}", dmm.address, *dmm.state.borrow());
        dmm
    }

    /// Newest snapshot.
    pub fn latest(&self) -> LcdState {
        self.state.borrow().clone()
    }

    fn no_data(&self) -> MeasureError {
        MeasureError::NoResponse {
            address: self.address.clone(),
            query: "LCD frame".into(),
        }
    }
}

impl Drop for Bm25x {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Dmm for Bm25x {
    /// The meter is set up with its rotary switch; only channel 1 exists.
    async fn configure(&self, setup: DmmSetup) -> AppResult<()> {
        if setup.chan != Chan::Ch1 {
            return Err(MeasureError::InvalidChannel {
                channel: setup.chan.to_string(),
                count: 1,
            });
        }
        Ok(())
    }

    async fn measure(&self) -> AppResult<f64> {
        match self.latest() {
            LcdState::Reading(r) => Ok(r.value),
            LcdState::Invalid(msg) => Err(MeasureError::parse("LCD frame", msg)),
            LcdState::Waiting | LcdState::NoData => Err(self.no_data()),
        }
    }

    async fn query_idn(&self) -> AppResult<String> {
        match self.latest() {
            LcdState::Reading(_) => Ok(IDN.to_string()),
            _ => Err(self.no_data()),
        }
    }

    async fn close(&self) -> AppResult<()> {
        self.task.abort();
        Ok(())
    }
}
