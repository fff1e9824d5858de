//! Power supply and multimeter drivers used through their capability traits.

use rust_measure::adapters::MockAdapter;
use rust_measure::error::MeasureError;
use rust_measure::instrument::{Chan, Connection, Dmm, DmmSetup, EngUnit, Psu};
use rust_measure::instruments::bm25x::{self, LcdState};
use rust_measure::instruments::{Bm25x, Cpx400, Fluke, Korad};
use std::time::Duration;

/// LCD segment bytes for digits 0-9.
const SEGMENTS: [(u8, u8); 10] = [
    (0x0E, 0x0B),
    (0x00, 0x0A),
    (0x0A, 0x0D),
    (0x08, 0x0F),
    (0x04, 0x0E),
    (0x0C, 0x07),
    (0x0E, 0x07),
    (0x08, 0x0A),
    (0x0E, 0x0F),
    (0x0C, 0x0F),
];

/// DC volt frame with three decimals.
fn frame(digits: [usize; 4]) -> Vec<u8> {
    let mut f = vec![0u8; bm25x::FRAME_LEN];
    f[0] = bm25x::FRAME_START;
    f[1] = 0x04;
    for (i, d) in digits.iter().enumerate() {
        f[3 + 2 * i] = SEGMENTS[*d].0;
        f[4 + 2 * i] = SEGMENTS[*d].1;
    }
    f[5] |= 1;
    f[14] = 0x04;
    f
}

fn connect(mock: &MockAdapter, options: rust_measure::instrument::ConnectionOptions) -> Connection {
    Connection::from_adapter("mock", Box::new(mock.clone()), options)
}

#[tokio::test]
async fn test_supplies_share_one_interface() {
    let cpx = MockAdapter::new();
    cpx.on("*IDN?", "THURLBY THANDAR, CPX400DP, 0, 1.00\n");
    let korad = MockAdapter::new();
    korad.on("*IDN?", "KORAD KD3005P V2.0\n");

    let supplies: Vec<Box<dyn Psu>> = vec![
        Box::new(
            Cpx400::from_connection(connect(&cpx, Cpx400::default_options()))
                .await
                .unwrap(),
        ),
        Box::new(
            Korad::from_connection(connect(&korad, Korad::default_options()))
                .await
                .unwrap(),
        ),
    ];
    for psu in &supplies {
        psu.set_output(Chan::Ch1, 5.0, 0.1).await.unwrap();
        assert!(psu.set_output(Chan::Ch5, 5.0, 0.1).await.is_err());
    }
    assert_eq!(supplies[0].channel_count(), 2);
    assert_eq!(supplies[1].channel_count(), 1);

    assert_eq!(cpx.call_log()[1..], ["V1 5.000", "I1 0.10", "OP1 1"]);
    assert_eq!(korad.call_log()[1..], ["VSET1:5.00", "ISET1:0.100"]);
}

#[tokio::test]
async fn test_fluke_reads_configured_function() {
    let mock = MockAdapter::new();
    mock.on("*IDN?", "FLUKE,45,0,1.6 D1.0\n");
    mock.on("MEAS:CURR:DC? 10.0", "-2.500E-03\n");
    let dmm: Box<dyn Dmm> = Box::new(
        Fluke::from_connection(connect(&mock, Fluke::default_options()))
            .await
            .unwrap(),
    );

    dmm.configure(DmmSetup::new(EngUnit::CurrentDc)).await.unwrap();
    assert_eq!(dmm.measure().await.unwrap(), -2.5e-3);

    dmm.configure(DmmSetup::new(EngUnit::Hz)).await.unwrap();
    assert!(dmm.measure().await.unwrap_err().is_timeout());
}

#[tokio::test]
async fn test_lcd_meter_tracks_latest_frame() {
    let mock = MockAdapter::new();
    mock.push_bytes(&frame([1, 2, 3, 4]));
    let meter = Bm25x::from_connection(connect(&mock, Bm25x::default_options())).await;

    assert_eq!(meter.query_idn().await.unwrap(), bm25x::IDN);
    meter.configure(DmmSetup::new(EngUnit::VoltDc)).await.unwrap();
    assert_eq!(meter.measure().await.unwrap(), 1.234);

    // A frame split across two reads
    let next = frame([0, 5, 0, 0]);
    mock.push_bytes(&next[..6]);
    tokio::time::sleep(Duration::from_millis(30)).await;
    mock.push_bytes(&next[6..]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(meter.measure().await.unwrap(), 0.5);

    meter.close().await.unwrap();
}

#[tokio::test]
async fn test_lcd_meter_without_data() {
    let mock = MockAdapter::new();
    let meter = Bm25x::from_connection(connect(&mock, Bm25x::default_options())).await;
    assert!(matches!(meter.latest(), LcdState::Waiting | LcdState::NoData));
    assert!(matches!(
        meter.measure().await,
        Err(MeasureError::NoResponse { .. })
    ));
    assert!(meter.query_idn().await.is_err());
}
