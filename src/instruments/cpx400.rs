//! TTi CPX400DP dual power supply
//!
//! Reachable over TCP (port 9221) or USB virtual COM port. Replies to read-back
//! queries look like `"V1 12.000"` for setpoints and `"12.000V"` for outputs.

use super::parse_reading;
use crate::config::InstrumentConfig;
use crate::error::AppResult;
use crate::instrument::{Chan, Connection, ConnectionOptions, Eol, OutputReading, Psu};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

/// Start of the `*IDN?` reply.
pub const IDN_PREFIX: &str = "THURLBY THANDAR, CPX400DP";
/// Reply timeout.
pub const TIMEOUT: Duration = Duration::from_millis(200);
/// Output channels.
pub const CHANNEL_COUNT: usize = 2;

/// CPX400DP power supply.
pub struct Cpx400 {
    conn: Mutex<Connection>,
}

impl Cpx400 {
    /// Default connection options.
    pub fn default_options() -> ConnectionOptions {
        ConnectionOptions::default()
            .with_timeout(TIMEOUT)
            .with_eol(Eol::Lf)
    }

    /// Open `address` (`host:port` or a serial port; empty searches serial ports).
    pub async fn open(address: &str) -> AppResult<Self> {
        let conn = super::connect(address, "CPX400", Self::default_options()).await?;
        Self::from_connection(conn).await
    }

    /// Open with per-instrument overrides from configuration.
    pub async fn open_with(config: &InstrumentConfig) -> AppResult<Self> {
        let options = config.connection_options(Self::default_options());
        let conn = super::connect(&config.address, "CPX400", options).await?;
        Self::from_connection(conn).await
    }

    /// Take over an open connection and check the identification.
    pub async fn from_connection(mut conn: Connection) -> AppResult<Self> {
        super::identify(&mut conn, |id| id.starts_with(IDN_PREFIX)).await?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl Psu for Cpx400 {
    async fn set_output(&self, ch: Chan, voltage: f64, current: f64) -> AppResult<()> {
        let n = ch.input_index(CHANNEL_COUNT)? + 1;
        let mut conn = self.conn.lock().await;
        conn.write(&format!("V{} {:.3}", n, voltage)).await?;
        conn.write(&format!("I{} {:.2}", n, current)).await?;
        conn.write(&format!("OP{} 1", n)).await
    }

    async fn get_output(&self, ch: Chan) -> AppResult<OutputReading> {
        let n = ch.input_index(CHANNEL_COUNT)? + 1;
        let mut conn = self.conn.lock().await;
        let v = conn.ask(&format!("V{}O?", n)).await?;
        let i = conn.ask(&format!("I{}O?", n)).await?;
        Ok(OutputReading {
            voltage: parse_reading(&v, "", "V", "output voltage")?,
            current: parse_reading(&i, "", "A", "output current")?,
        })
    }

    async fn get_setpoint(&self, ch: Chan) -> AppResult<OutputReading> {
        let n = ch.input_index(CHANNEL_COUNT)? + 1;
        let mut conn = self.conn.lock().await;
        let v = conn.ask(&format!("V{}?", n)).await?;
        let i = conn.ask(&format!("I{}?", n)).await?;
        Ok(OutputReading {
            voltage: parse_reading(&v, &format!("V{} ", n), "V", "voltage setpoint")?,
            current: parse_reading(&i, &format!("I{} ", n), "A", "current setpoint")?,
        })
    }

    async fn disable(&self, ch: Chan) -> AppResult<()> {
        let n = ch.input_index(CHANNEL_COUNT)? + 1;
        self.conn.lock().await.write(&format!("OP{} 0", n)).await
    }

    async fn query_idn(&self) -> AppResult<String> {
        self.conn.lock().await.query_idn().await
    }

    async fn close(&self) -> AppResult<()> {
        self.conn.lock().await.close().await;
        Ok(())
    }

    fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    async fn psu() -> (Cpx400, MockAdapter) {
        let mock = MockAdapter::new();
        mock.on("*IDN?", "THURLBY THANDAR, CPX400DP, 0, 1.00\n");
        let conn = Connection::from_adapter("mock", Box::new(mock.clone()), Cpx400::default_options());
        (Cpx400::from_connection(conn).await.unwrap(), mock)
    }

    #[tokio::test]
    async fn test_set_output_commands() {
        let (psu, mock) = psu().await;
        mock.clear_log();
        psu.set_output(Chan::Ch2, 12.0, 0.5).await.unwrap();
        assert_eq!(mock.call_log(), vec!["V2 12.000", "I2 0.50", "OP2 1"]);
        psu.disable(Chan::Ch2).await.unwrap();
        assert_eq!(mock.call_log().last().unwrap(), "OP2 0");
    }

    #[tokio::test]
    async fn test_read_back() {
        let (psu, mock) = psu().await;
        mock.on("V1O?", "5.002V\r\n");
        mock.on("I1O?", "0.101A\r\n");
        mock.on("V1?", "V1 5.000\r\n");
        mock.on("I1?", "I1 0.20\r\n");
        assert_eq!(
            psu.get_output(Chan::Ch1).await.unwrap(),
            OutputReading {
                voltage: 5.002,
                current: 0.101
            }
        );
        assert_eq!(
            psu.get_setpoint(Chan::Ch1).await.unwrap(),
            OutputReading {
                voltage: 5.0,
                current: 0.2
            }
        );
    }

    #[tokio::test]
    async fn test_channel_three_rejected() {
        let (psu, mock) = psu().await;
        mock.clear_log();
        assert!(psu.set_output(Chan::Ch3, 1.0, 1.0).await.is_err());
        assert!(mock.call_log().is_empty());
    }
}
