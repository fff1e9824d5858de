//! Korad KD3005P power supply (also sold as RND 320-KD3005P)
//!
//! Commands carry no line terminator; the supply frames them by the pause
//! after the last character. There is no output enable, so `disable` programs
//! 0 V / 0 A.

use super::parse_reading;
use crate::config::InstrumentConfig;
use crate::error::AppResult;
use crate::instrument::{Chan, Connection, ConnectionOptions, Eol, OutputReading, Psu};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Model in the `*IDN?` reply.
pub const IDN_MODEL: &str = "KD3005P";
/// Fixed link speed.
pub const BAUD_RATE: u32 = 9600;
/// Reply timeout.
pub const TIMEOUT: Duration = Duration::from_millis(500);
/// Single output.
pub const CHANNEL_COUNT: usize = 1;

/// Time for the output to settle after a voltage change.
///
/// The output slews at roughly 10 V/s: a rise settles in 100 ms, a fall takes
/// 50 ms plus 30 ms per volt.
pub fn slew_wait(previous: f64, target: f64) -> Duration {
    if target > previous {
        Duration::from_millis(100)
    } else {
        let extra = ((previous - target).abs() * 30.0).round() as u64;
        Duration::from_millis(50 + extra)
    }
}

struct Inner {
    conn: Connection,
    voltage: f64,
}

/// KD3005P power supply.
pub struct Korad {
    inner: Mutex<Inner>,
}

impl Korad {
    /// Default connection options.
    pub fn default_options() -> ConnectionOptions {
        ConnectionOptions::default()
            .with_baud_rate(BAUD_RATE)
            .with_timeout(TIMEOUT)
            .with_eol(Eol::None)
    }

    /// Open `address`; an empty address searches the serial ports.
    pub async fn open(address: &str) -> AppResult<Self> {
        let conn = super::connect(address, IDN_MODEL, Self::default_options()).await?;
        Self::from_connection(conn).await
    }

    /// Open with per-instrument overrides from configuration.
    pub async fn open_with(config: &InstrumentConfig) -> AppResult<Self> {
        let options = config.connection_options(Self::default_options());
        let conn = super::connect(&config.address, IDN_MODEL, options).await?;
        Self::from_connection(conn).await
    }

    /// Take over an open connection and check the identification.
    pub async fn from_connection(mut conn: Connection) -> AppResult<Self> {
        super::identify(&mut conn, |id| id.is_model(IDN_MODEL)).await?;
        Ok(Self {
            inner: Mutex::new(Inner { conn, voltage: 0.0 }),
        })
    }
}

#[async_trait]
impl Psu for Korad {
    /// Program the setpoints and wait for the output to settle.
    async fn set_output(&self, ch: Chan, voltage: f64, current: f64) -> AppResult<()> {
        let n = ch.input_index(CHANNEL_COUNT)? + 1;
        let mut inner = self.inner.lock().await;
        let wait = slew_wait(inner.voltage, voltage);
        inner.conn.write(&format!("VSET{}:{:.2}", n, voltage)).await?;
        inner.conn.write(&format!("ISET{}:{:.3}", n, current)).await?;
        inner.voltage = voltage;
        debug!("Korad settling {:?}", wait);
        tokio::time::sleep(wait).await;
        Ok(())
    }

    async fn get_output(&self, ch: Chan) -> AppResult<OutputReading> {
        let n = ch.input_index(CHANNEL_COUNT)? + 1;
        let mut inner = self.inner.lock().await;
        let v = inner.conn.ask(&format!("VOUT{}?", n)).await?;
        let i = inner.conn.ask(&format!("IOUT{}?", n)).await?;
        Ok(OutputReading {
            voltage: parse_reading(&v, "", "V", "output voltage")?,
            current: parse_reading(&i, "", "A", "output current")?,
        })
    }

    async fn get_setpoint(&self, ch: Chan) -> AppResult<OutputReading> {
        let n = ch.input_index(CHANNEL_COUNT)? + 1;
        let mut inner = self.inner.lock().await;
        let v = inner.conn.ask(&format!("VSET{}?", n)).await?;
        let i = inner.conn.ask(&format!("ISET{}?", n)).await?;
        Ok(OutputReading {
            voltage: parse_reading(&v, "", "V", "voltage setpoint")?,
            current: parse_reading(&i, "", "A", "current setpoint")?,
        })
    }

    async fn disable(&self, ch: Chan) -> AppResult<()> {
        self.set_output(ch, 0.0, 0.0).await
    }

    async fn query_idn(&self) -> AppResult<String> {
        self.inner.lock().await.conn.query_idn().await
    }

    /// Zero the output, then close.
    async fn close(&self) -> AppResult<()> {
        let zeroed = self.set_output(Chan::Ch1, 0.0, 0.0).await;
        self.inner.lock().await.conn.close().await;
        zeroed
    }

    fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    #[test]
    fn test_slew_wait() {
        assert_eq!(slew_wait(0.0, 12.0), Duration::from_millis(100));
        assert_eq!(slew_wait(12.0, 2.0), Duration::from_millis(350));
        assert_eq!(slew_wait(5.0, 5.0), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_commands_have_no_terminator() {
        let mock = MockAdapter::new();
        mock.on("*IDN?", "KORAD KD3005P V2.0\n");
        let conn = Connection::from_adapter("mock", Box::new(mock.clone()), Korad::default_options());
        let psu = Korad::from_connection(conn).await.unwrap();
        mock.clear_log();

        psu.set_output(Chan::Ch1, 3.3, 0.25).await.unwrap();
        assert_eq!(mock.call_log(), vec!["VSET1:3.30", "ISET1:0.250"]);

        mock.on("VOUT1?", "03.30");
        mock.on("IOUT1?", "0.012");
        let out = psu.get_output(Chan::Ch1).await.unwrap();
        assert_eq!(out.voltage, 3.3);
        assert_eq!(out.current, 0.012);

        psu.close().await.unwrap();
        assert!(mock.call_log().contains(&"VSET1:0.00".to_string()));
        assert!(!mock.is_connected());
    }

    #[tokio::test]
    async fn test_model_only_in_serial_field_rejected() {
        let mock = MockAdapter::new();
        mock.on("*IDN?", "ACME,X100,KD3005P,1.0\n");
        let conn = Connection::from_adapter("mock", Box::new(mock.clone()), Korad::default_options());
        assert!(matches!(
            Korad::from_connection(conn).await,
            Err(crate::error::MeasureError::WrongInstrument { .. })
        ));
    }
}
