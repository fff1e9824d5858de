//! Concrete instrument drivers and construction from configuration.
//!
//! Every driver owns exactly one [`Connection`] (or one SDK device handle)
//! behind a `tokio::sync::Mutex`, so one request is outstanding at a time.

pub mod ad2;
pub mod bm25x;
pub mod cpx400;
pub mod fluke;
pub mod korad;
pub mod tps2000;

pub use ad2::Ad2;
pub use bm25x::Bm25x;
pub use cpx400::Cpx400;
pub use fluke::Fluke;
pub use korad::Korad;
pub use tps2000::Tps2000;

use crate::acquisition::PollSettings;
use crate::config::{InstrumentConfig, InstrumentKind};
use crate::error::{AppResult, MeasureError};
use crate::hardware::DeviceRegistry;
use crate::instrument::{
    find_serial_port, Connection, ConnectionOptions, Dmm, Identity, Psu, Scope,
};
use tracing::{info, warn};

/// Resolve an empty address by searching the serial ports for `search_id`,
/// then open the connection.
pub(crate) async fn connect(
    address: &str,
    search_id: &str,
    options: ConnectionOptions,
) -> AppResult<Connection> {
    let address = if address.is_empty() {
        find_serial_port(search_id, options.baud_rate, options.eol)
            .await?
            .ok_or_else(|| {
                MeasureError::DeviceNotFound(format!("no serial port answers as '{}'", search_id))
            })?
    } else {
        address.to_string()
    };
    Connection::open(&address, options).await
}

/// Read `*IDN?` and check the parsed reply with `accepts`.
///
/// On a mismatch the connection is closed and
/// [`MeasureError::WrongInstrument`] returned.
pub(crate) async fn identify(
    conn: &mut Connection,
    accepts: impl Fn(&Identity) -> bool,
) -> AppResult<Identity> {
    conn.query_idn().await?;
    let identity = conn.identity();
    if !accepts(&identity) {
        warn!("[{}] unexpected instrument '{}'", conn.address(), identity.raw);
        let address = conn.address().to_string();
        conn.close().await;
        return Err(MeasureError::WrongInstrument {
            address,
            identity: identity.raw,
        });
    }
    info!(
        "Connected to {} on {} (serial '{}', firmware '{}')",
        identity.label(),
        conn.address(),
        identity.serial,
        identity.firmware
    );
    Ok(identity)
}

/// Parse a numeric reply after removing `prefix` and trailing unit characters.
///
/// `"V1 12.500V"` with prefix `"V1 "` and units `"V"` gives `12.5`.
pub(crate) fn parse_reading(
    reply: &str,
    prefix: &str,
    units: &str,
    context: &str,
) -> AppResult<f64> {
    let trimmed = reply.trim();
    let value = trimmed
        .strip_prefix(prefix)
        .unwrap_or(trimmed)
        .trim_end_matches(|c: char| units.contains(c) || c.is_whitespace() || c == '\0');
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| MeasureError::parse(context, reply))
}

/// Open the power supply described by `config`.
///
/// The Analog Discovery needs `registry`; serial and network supplies ignore it.
pub async fn open_psu(
    config: &InstrumentConfig,
    registry: Option<&mut DeviceRegistry>,
) -> AppResult<Box<dyn Psu>> {
    match config.kind {
        InstrumentKind::Cpx400 => Ok(Box::new(Cpx400::open_with(config).await?)),
        InstrumentKind::Korad => Ok(Box::new(Korad::open_with(config).await?)),
        InstrumentKind::Ad2 => Ok(Box::new(Ad2::open(
            require_registry(config, registry)?,
            &config.address,
        )?)),
        other => Err(not_a(config, other, "power supply")),
    }
}

/// Open the multimeter described by `config`.
pub async fn open_dmm(config: &InstrumentConfig) -> AppResult<Box<dyn Dmm>> {
    match config.kind {
        InstrumentKind::Fluke => Ok(Box::new(Fluke::open_with(config).await?)),
        InstrumentKind::Bm25x => Ok(Box::new(Bm25x::open_with(config).await?)),
        other => Err(not_a(config, other, "multimeter")),
    }
}

/// Open the oscilloscope described by `config`, polling acquisitions with
/// `poll` (usually [`CaptureSettings::poll_settings`](crate::config::CaptureSettings::poll_settings)).
pub async fn open_scope(
    config: &InstrumentConfig,
    poll: PollSettings,
    registry: Option<&mut DeviceRegistry>,
) -> AppResult<Box<dyn Scope>> {
    match config.kind {
        InstrumentKind::Tps2000 => Ok(Box::new(
            Tps2000::open_with(config).await?.with_poll_settings(poll),
        )),
        InstrumentKind::Ad2 => Ok(Box::new(
            Ad2::open(require_registry(config, registry)?, &config.address)?
                .with_poll_settings(poll),
        )),
        other => Err(not_a(config, other, "oscilloscope")),
    }
}

fn require_registry<'a>(
    config: &InstrumentConfig,
    registry: Option<&'a mut DeviceRegistry>,
) -> AppResult<&'a mut DeviceRegistry> {
    registry.ok_or_else(|| {
        MeasureError::Configuration(format!(
            "instrument '{}' needs an SDK device registry",
            config.id
        ))
    })
}

fn not_a(config: &InstrumentConfig, kind: InstrumentKind, what: &str) -> MeasureError {
    MeasureError::Configuration(format!(
        "instrument '{}' of kind {:?} is not a {}",
        config.id, kind, what
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reading_strips_prefix_and_units() {
        assert_eq!(parse_reading("V1 12.500V\n", "V1 ", "V", "v").unwrap(), 12.5);
        assert_eq!(parse_reading("0.123A", "", "A", "i").unwrap(), 0.123);
        assert_eq!(parse_reading("+1.2E-3 AV\0", "", "AV", "m").unwrap(), 1.2e-3);
        assert!(parse_reading("", "", "V", "v").unwrap_err().is_format_error());
        assert!(parse_reading("V1 abc", "V1 ", "V", "v").is_err());
    }

    #[tokio::test]
    async fn test_factory_rejects_wrong_family() {
        let config = InstrumentConfig::new("scope", InstrumentKind::Tps2000, "COM9");
        let err = open_psu(&config, None).await.err().unwrap();
        assert!(err.to_string().contains("is not a power supply"));

        let config = InstrumentConfig::new("ad2", InstrumentKind::Ad2, "");
        let err = open_scope(&config, PollSettings::default(), None)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("needs an SDK device registry"));
    }
}
