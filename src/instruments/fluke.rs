//! Fluke 45 / 8845A bench multimeter (SCPI over serial)

use super::parse_reading;
use crate::config::InstrumentConfig;
use crate::error::{AppResult, MeasureError};
use crate::instrument::{Chan, Connection, ConnectionOptions, Dmm, DmmSetup, EngUnit, Eol};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Start of the `*IDN?` reply.
pub const IDN_PREFIX: &str = "FLUKE";
/// Reply timeout; slow ranges take seconds.
pub const TIMEOUT: Duration = Duration::from_secs(3);
/// Pause the meter needs between commands.
pub const SETTLE: Duration = Duration::from_millis(50);

/// Measurement query for `setup`, with the range token substituted.
pub fn measure_query(setup: &DmmSetup) -> AppResult<String> {
    let (function, default_range) = match setup.unit {
        EngUnit::VoltDc => ("VOLT:DC", Some("100.0")),
        EngUnit::VoltAcRms => ("VOLT:AC", Some("10.0")),
        EngUnit::CurrentDc => ("CURR:DC", Some("10.0")),
        EngUnit::CurrentAcRms => ("CURR:AC", Some("10.0")),
        EngUnit::Hz => ("FREQ", None),
        EngUnit::Ohm => ("RES", Some("10000000.0")),
        other => {
            return Err(MeasureError::Configuration(format!(
                "Fluke cannot measure {:?}",
                other
            )))
        }
    };
    Ok(match setup.range.as_deref().or(default_range) {
        Some(range) => format!("MEAS:{}? {}", function, range),
        None => format!("MEAS:{}?", function),
    })
}

struct Inner {
    conn: Connection,
    query: Option<String>,
}

/// Fluke multimeter in remote mode.
pub struct Fluke {
    inner: Mutex<Inner>,
}

impl Fluke {
    /// Default connection options.
    pub fn default_options() -> ConnectionOptions {
        ConnectionOptions::default()
            .with_timeout(TIMEOUT)
            .with_eol(Eol::Lf)
    }

    /// Open `address`; an empty address searches the serial ports.
    pub async fn open(address: &str) -> AppResult<Self> {
        let conn = super::connect(address, IDN_PREFIX, Self::default_options()).await?;
        Self::from_connection(conn).await
    }

    /// Open with per-instrument overrides from configuration.
    pub async fn open_with(config: &InstrumentConfig) -> AppResult<Self> {
        let options = config.connection_options(Self::default_options());
        let conn = super::connect(&config.address, IDN_PREFIX, options).await?;
        Self::from_connection(conn).await
    }

    /// Put the meter in remote mode, reset it and check the identification.
    pub async fn from_connection(mut conn: Connection) -> AppResult<Self> {
        conn.write("SYST:REM").await?;
        conn.write("*RST").await?;
        tokio::time::sleep(SETTLE).await;
        super::identify(&mut conn, |id| id.starts_with(IDN_PREFIX)).await?;
        Ok(Self {
            inner: Mutex::new(Inner { conn, query: None }),
        })
    }
}

#[async_trait]
impl Dmm for Fluke {
    async fn configure(&self, setup: DmmSetup) -> AppResult<()> {
        setup.chan.input_index(1)?;
        let query = measure_query(&setup)?;
        info!("Fluke configured for {:?}: {}", setup.unit, query);
        self.inner.lock().await.query = Some(query);
        Ok(())
    }

    async fn measure(&self) -> AppResult<f64> {
        let mut inner = self.inner.lock().await;
        let query = inner.query.clone().ok_or_else(|| {
            MeasureError::Configuration("Fluke measure before configure".to_string())
        })?;
        tokio::time::sleep(SETTLE).await;
        let reply = inner.conn.ask(&query).await?;
        if reply.is_empty() {
            return Err(MeasureError::NoResponse {
                address: inner.conn.address().to_string(),
                query,
            });
        }
        parse_reading(&reply, "", "AV", &query)
    }

    async fn query_idn(&self) -> AppResult<String> {
        self.inner.lock().await.conn.query_idn().await
    }

    /// Return the meter to local control and close.
    async fn close(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        tokio::time::sleep(SETTLE).await;
        let result = inner.conn.write("SYST:LOC").await;
        tokio::time::sleep(SETTLE).await;
        inner.conn.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    #[test]
    fn test_measure_query() {
        assert_eq!(
            measure_query(&DmmSetup::new(EngUnit::VoltDc)).unwrap(),
            "MEAS:VOLT:DC? 100.0"
        );
        assert_eq!(
            measure_query(&DmmSetup::new(EngUnit::Hz)).unwrap(),
            "MEAS:FREQ?"
        );
        assert_eq!(
            measure_query(&DmmSetup::new(EngUnit::Ohm).with_range("1000.0")).unwrap(),
            "MEAS:RES? 1000.0"
        );
        assert!(measure_query(&DmmSetup::new(EngUnit::Celsius)).is_err());
    }

    #[tokio::test]
    async fn test_open_and_measure() {
        let mock = MockAdapter::new();
        mock.on("*IDN?", "FLUKE,8845A,2540017,08/02/10-11:53\n");
        let conn = Connection::from_adapter("mock", Box::new(mock.clone()), Fluke::default_options());
        let dmm = Fluke::from_connection(conn).await.unwrap();
        assert_eq!(&mock.call_log()[..2], ["SYST:REM", "*RST"]);

        let err = dmm.measure().await.unwrap_err();
        assert!(matches!(err, MeasureError::Configuration(_)));

        dmm.configure(DmmSetup::new(EngUnit::VoltDc)).await.unwrap();
        mock.on("MEAS:VOLT:DC? 100.0", "+1.2345E+00\n");
        assert_eq!(dmm.measure().await.unwrap(), 1.2345);

        let mut setup = DmmSetup::new(EngUnit::VoltDc);
        setup.chan = Chan::Ch2;
        assert!(dmm.configure(setup).await.is_err());

        dmm.close().await.unwrap();
        assert_eq!(mock.call_log().last().unwrap(), "SYST:LOC");
        assert!(!mock.is_connected());
    }
}
