//! Tektronix TPS2000 series oscilloscope driver
//!
//! RS-232 at 19200 baud, LF terminated. The scope always stores 2500 points
//! over 10 divisions, so the horizontal scale is `sample_interval * 250` and
//! has to land on the 1/2.5/5 sequence.
//!
//! ## Capture sequence
//!
//! 1. `ACQ:STOPAFTER SEQUENCE`, `ACQ:STATE RUN`, then poll `BUSY?` until `0`
//! 2. `DATA:WIDTH 1;START 1;STOP n;ENCDG SRI` (signed bytes) and `XINCR?`
//! 3. Per enabled channel: `DATA:SOURCE CHn`, `CURVE?`, one length-prefixed
//!    block, then `YMULT?`/`YOFF?` for that channel's scaling
//!
//! Any failure discards the whole capture.

use crate::acquisition::{
    quantize_time_per_div, trigger_hysteresis, validate_sample_count, Acquisition, CaptureFlag,
    ChannelSettings, PollSettings, Poller, TimebaseSettings, TriggerSettings,
    AUTO_TRIGGER_TIMEOUT,
};
use crate::config::InstrumentConfig;
use crate::data::{read_block, Capture, ChannelScale, ChannelTrace};
use crate::error::{AppResult, MeasureError};
use crate::instrument::{
    Chan, Connection, ConnectionOptions, Coupling, Eol, SampleMode, Scope, Slope, TimeSettings,
};
use crate::units::{time_to_str, volt_to_str};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Start of the `*IDN?` reply of every supported model.
pub const IDN_PREFIX: &str = "TEKTRONIX,TPS 20";
/// RS-232 speed.
pub const BAUD_RATE: u32 = 19_200;
/// Reply timeout for text queries.
pub const TIMEOUT: Duration = Duration::from_millis(750);
/// Inputs on the four-channel models.
pub const CHANNEL_COUNT: usize = 4;
/// Record length of the acquisition memory.
pub const MAX_SAMPLES: usize = 2500;
/// Record points per horizontal division.
pub const SAMPLES_PER_DIV: usize = 250;
/// Read timeout for one curve block; 2500 bytes take about 1.3 s at 19200 baud.
pub const CURVE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between the setup writes of an immediate measurement.
const MEASURE_SETTLE: Duration = Duration::from_millis(10);
/// The instrument reports exact zero as this value.
pub const ZERO_READING: f64 = 1e-38;

struct Inner {
    conn: Connection,
    acq: Acquisition,
}

/// TPS2000 oscilloscope.
pub struct Tps2000 {
    inner: Mutex<Inner>,
    capture: CaptureFlag,
    poll: PollSettings,
}

impl Tps2000 {
    /// Default connection options for this scope.
    pub fn default_options() -> ConnectionOptions {
        ConnectionOptions::default()
            .with_baud_rate(BAUD_RATE)
            .with_timeout(TIMEOUT)
            .with_eol(Eol::Lf)
    }

    /// Open `address`; an empty address searches the serial ports.
    pub async fn open(address: &str) -> AppResult<Self> {
        let conn = super::connect(address, "TEKTRONIX", Self::default_options()).await?;
        Self::from_connection(conn).await
    }

    /// Open with per-instrument overrides from configuration.
    pub async fn open_with(config: &InstrumentConfig) -> AppResult<Self> {
        let options = config.connection_options(Self::default_options());
        let conn = super::connect(&config.address, "TEKTRONIX", options).await?;
        Self::from_connection(conn).await
    }

    /// Take over an open connection and check that a TPS2000 is on the other end.
    pub async fn from_connection(mut conn: Connection) -> AppResult<Self> {
        super::identify(&mut conn, |id| id.starts_with(IDN_PREFIX)).await?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                acq: Acquisition::new(CHANNEL_COUNT),
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

    /// Turn the front panel background lights on or off.
    pub async fn button_lights(&self, on: bool) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .conn
            .write(if on { "POW:BUTTONLIGHT ON" } else { "POW:BUTTONLIGHT OFF" })
            .await
    }

    /// Snapshot of the recorded acquisition configuration.
    pub async fn acquisition(&self) -> Acquisition {
        self.inner.lock().await.acq.clone()
    }
}

fn trigger_coupling(coupling: Coupling) -> AppResult<&'static str> {
    match coupling {
        Coupling::Dc => Ok("DC"),
        Coupling::Ac => Ok("AC"),
        Coupling::HfReject => Ok("HFR"),
        Coupling::LfReject => Ok("LFR"),
        Coupling::NoiseReject => Ok("NOISE"),
        other => Err(MeasureError::UnsupportedCoupling(format!(
            "{} (trigger)",
            other
        ))),
    }
}

fn trigger_source(source: Chan) -> AppResult<&'static str> {
    match source {
        Chan::Ch1 => Ok("CH1"),
        Chan::Ch2 => Ok("CH2"),
        Chan::Ch3 => Ok("CH3"),
        Chan::Ch4 => Ok("CH4"),
        Chan::Ext => Ok("EXT"),
        Chan::Ext5 => Ok("EXT5"),
        Chan::Ext10 => Ok("EXT10"),
        Chan::Mains => Ok("AC LINE"),
        other => Err(MeasureError::InvalidChannel {
            channel: other.to_string(),
            count: CHANNEL_COUNT,
        }),
    }
}

async fn run_capture(inner: &mut Inner, poll: PollSettings) -> AppResult<Capture> {
    let enabled = inner.acq.arm()?;
    let count = inner
        .acq
        .timebase()
        .map(|t| t.sample_count)
        .unwrap_or(MAX_SAMPLES);
    let conn = &mut inner.conn;

    conn.write("ACQ:STOPAFTER SEQUENCE").await?;
    conn.write("ACQ:STATE RUN").await?;
    let poller = Poller::start(poll);
    while conn.poll_float("BUSY?").await? != 0.0 {
        poller.wait().await?;
    }

    conn.write(&format!("DATA:WIDTH 1;START 1;STOP {};ENCDG SRI", count))
        .await?;
    let first = enabled[0] + 1;
    let x_incr = conn
        .poll_float(&format!("WFMPRE:CH{}:XINCR?", first))
        .await?;
    if x_incr == 0.0 {
        return Err(MeasureError::parse("sample interval", "0"));
    }

    let mut traces = Vec::with_capacity(enabled.len());
    for index in enabled {
        let n = index + 1;
        conn.write(&format!("DATA:SOURCE CH{}", n)).await?;
        conn.write("CURVE?").await?;
        let block = read_block(conn, count, CURVE_TIMEOUT).await?;
        let y_mult = conn.poll_float("WFMPRE:YMULT?").await?;
        let y_offset = conn.poll_float("WFMPRE:YOFF?").await?;
        let chan = Chan::from_number(n).ok_or_else(|| MeasureError::InvalidChannel {
            channel: n.to_string(),
            count: CHANNEL_COUNT,
        })?;
        traces.push(ChannelTrace::from_raw(
            chan,
            block.payload(),
            &ChannelScale::new(y_mult, y_offset),
        ));
    }
    Ok(Capture::new(count, x_incr, traces))
}

#[async_trait]
impl Scope for Tps2000 {
    async fn query_idn(&self) -> AppResult<String> {
        self.inner.lock().await.conn.query_idn().await
    }

    async fn disable_channel(&self, ch: Chan) -> AppResult<()> {
        let index = ch.input_index(CHANNEL_COUNT)?;
        let mut inner = self.inner.lock().await;
        inner.acq.disable_channel(index);
        inner.conn.write(&format!("SEL:CH{} OFF", index + 1)).await
    }

    /// `range` is 10 x volt/div; `offset` is added before scaling, 0 V at
    /// mid-screen.
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
        let coupling_cmd = match coupling {
            Coupling::Off => None,
            Coupling::Dc => Some("DC"),
            Coupling::Ac => Some("AC"),
            Coupling::Gnd => Some("GND"),
            other => return Err(MeasureError::UnsupportedCoupling(other.to_string())),
        };

        let n = index + 1;
        let mut inner = self.inner.lock().await;
        let conn = &mut inner.conn;
        // Offset is given in divisions
        conn.write(&format!("CH{}:POS {:.3}", n, offset / range * 10.0))
            .await?;
        conn.write(&format!("CH{}:SCA {:.3e}", n, range / 10.0)).await?;
        match coupling_cmd {
            Some(c) => {
                conn.write(&format!("CH{}:COUP {}", n, c)).await?;
                conn.write(&format!("SEL:CH{} ON", n)).await?;
            }
            None => conn.write(&format!("SEL:CH{} OFF", n)).await?,
        }
        inner.acq.set_channel(
            index,
            ChannelSettings {
                range,
                offset,
                coupling,
                enabled: coupling_cmd.is_some(),
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

    async fn setup_time(
        &self,
        sample_interval: f64,
        x_pos: f64,
        mode: SampleMode,
        sample_count: usize,
    ) -> AppResult<()> {
        let sample_count = validate_sample_count(sample_count, MAX_SAMPLES)?;
        let per_div = quantize_time_per_div(sample_interval, SAMPLES_PER_DIV)?;

        let mut inner = self.inner.lock().await;
        let conn = &mut inner.conn;
        conn.write(match mode {
            SampleMode::MinMax => "ACQ:MOD PEAK",
            SampleMode::Sample => "ACQ:MOD SAM",
            SampleMode::Average => "ACQ:MOD AVE",
        })
        .await?;
        conn.write(&format!("HOR:MAI:SCA {}", per_div)).await?;
        conn.write(&format!("HOR:MAI:POS {:.3e}", x_pos)).await?;
        debug!(
            "Timebase {}/div, {} samples",
            time_to_str(sample_interval * SAMPLES_PER_DIV as f64),
            sample_count
        );
        inner.acq.set_timebase(TimebaseSettings {
            sample_interval,
            time_per_div: Some(per_div),
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
        let coupling_cmd = trigger_coupling(coupling)?;
        let source_cmd = trigger_source(source)?;
        let slope_cmd = match slope {
            Slope::Rising => "RISE",
            Slope::Falling => "FALL",
            Slope::Either => {
                return Err(MeasureError::Configuration(
                    "TPS2000 triggers on one edge only".into(),
                ))
            }
        };
        let holdoff = if auto { AUTO_TRIGGER_TIMEOUT } else { 0.0 };

        let mut inner = self.inner.lock().await;
        let range = source
            .index()
            .and_then(|i| inner.acq.channel(i))
            .map(|c| c.range)
            .unwrap_or(ChannelSettings::default().range);
        let conn = &mut inner.conn;
        conn.write(&format!("TRIG:MAIN:EDGE:COUP {}", coupling_cmd))
            .await?;
        conn.write(&format!("TRIG:MAIN:EDGE:SLOPE {}", slope_cmd))
            .await?;
        conn.write(&format!("TRIG:MAIN:EDGE:SOURCE {}", source_cmd))
            .await?;
        conn.write(&format!("TRIG:MAIN:HOLDOFF:VALUE {:.3e}", holdoff))
            .await?;
        conn.write(&format!("TRIG:MAIN:LEVEL {:.4e}", level)).await?;
        conn.write(if auto {
            "TRIG:MAIN:MODE AUTO"
        } else {
            "TRIG:MAIN:MODE NORMAL"
        })
        .await?;
        conn.write(&format!("HOR:DELAY:POS {:.4e}", x_pos)).await?;
        inner.acq.set_trigger(TriggerSettings {
            source,
            coupling,
            slope,
            level,
            hysteresis: trigger_hysteresis(range, coupling),
            auto,
            auto_timeout: holdoff,
            holdoff,
            x_pos,
        });
        Ok(())
    }

    /// `kind` is one of FREQuency, MEAN, PERIod, PK2pk, CRMs, MINImum,
    /// MAXImum, RISe, FALL, PWIdth, NWIdth. [`Chan::Trig`] reads the trigger
    /// frequency counter, which is more accurate than a waveform measurement.
    async fn measure(&self, ch: Chan, kind: &str) -> AppResult<f64> {
        let mut inner = self.inner.lock().await;
        let conn = &mut inner.conn;
        let value = if ch == Chan::Trig {
            conn.poll_float("TRIG:MAI:FREQ?").await?
        } else {
            let n = ch.input_index(CHANNEL_COUNT)? + 1;
            tokio::time::sleep(MEASURE_SETTLE).await;
            conn.write(&format!("MEASU:IMM:SOU CH{}", n)).await?;
            tokio::time::sleep(MEASURE_SETTLE).await;
            conn.write(&format!("MEASU:IMMED:TYPE {}", kind)).await?;
            tokio::time::sleep(MEASURE_SETTLE).await;
            conn.poll_float("MEASU:IMMED:VALUE?").await?
        };
        Ok(if value == 0.0 { ZERO_READING } else { value })
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
                    inner.conn.address()
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
        let mut inner = self.inner.lock().await;
        let per_div = inner.conn.poll_float("HOR:MAI:SCA?").await?;
        let x_pos = inner.conn.poll_float("HOR:MAI:POS?").await?;
        Ok(TimeSettings {
            sample_interval: per_div / SAMPLES_PER_DIV as f64,
            x_pos,
        })
    }

    async fn close(&self) -> AppResult<()> {
        self.inner.lock().await.conn.close().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }
}
