//! Analog Discovery driver against the mock SDK.

use rust_measure::acquisition::PollSettings;
use rust_measure::config::{InstrumentConfig, InstrumentKind};
use rust_measure::error::MeasureError;
use rust_measure::hardware::mock::{MockAnalogDevice, MockEnumerator};
use rust_measure::hardware::{DeviceRegistry, TriggerCondition, TriggerSource};
use rust_measure::instrument::{Chan, Coupling, SampleMode, Scope, Slope};
use rust_measure::instruments::{self, Ad2};
use std::time::Duration;

fn registry(mock: &MockAnalogDevice) -> DeviceRegistry {
    DeviceRegistry::new(Box::new(
        MockEnumerator::new()
            .with_device("SN:210321AAAAAA", false, MockAnalogDevice::new())
            .with_device("SN:210321A1B2C3", true, mock.clone()),
    ))
}

#[tokio::test]
async fn test_noise_reject_widens_hysteresis() {
    let mock = MockAnalogDevice::new();
    let ad2 = Ad2::open(&mut registry(&mock), "B2C3").unwrap();

    ad2.setup_channel(Chan::Ch1, 5.0, 0.0, Coupling::Dc)
        .await
        .unwrap();
    ad2.setup_trigger(Chan::Ch1, Coupling::NoiseReject, Slope::Rising, 1.0, false, 0.0)
        .await
        .unwrap();
    assert_eq!(mock.hysteresis(), Some(0.25));
    assert_eq!(mock.trigger_source(), Some(TriggerSource::Channel(0)));
    assert_eq!(mock.trigger_condition(), Some(TriggerCondition::Rise));
    assert_eq!(mock.trigger_level(), 1.0);
    assert_eq!(mock.auto_timeout(), 0.0);

    ad2.setup_trigger(Chan::Ch1, Coupling::Dc, Slope::Either, 1.0, true, 0.0)
        .await
        .unwrap();
    assert_eq!(mock.hysteresis(), Some(5.0 / 300.0));
    assert_eq!(mock.auto_timeout(), 0.02);
}

#[tokio::test]
async fn test_failed_calls_reported_together() {
    let mock = MockAnalogDevice::new();
    let ad2 = Ad2::open(&mut registry(&mock), "").unwrap();
    mock.fail_on("in_trigger_level_set");
    mock.fail_on("in_trigger_holdoff_set");
    mock.clear_calls();

    let err = ad2
        .setup_trigger(Chan::Ch2, Coupling::Dc, Slope::Falling, 0.5, false, 0.0)
        .await
        .unwrap_err();
    match err {
        MeasureError::Hardware { failures, .. } => {
            let calls: Vec<_> = failures.iter().map(|f| f.call.as_str()).collect();
            assert_eq!(calls, vec!["in_trigger_level_set", "in_trigger_holdoff_set"]);
        }
        other => panic!("unexpected {:?}", other),
    }
    // Calls after the first failure were still made
    assert!(mock
        .calls()
        .iter()
        .any(|c| c.starts_with("in_trigger_position_set")));
}

#[tokio::test]
async fn test_acquisition_timeout() {
    let mock = MockAnalogDevice::new();
    mock.never_complete();
    let ad2 = Ad2::open(&mut registry(&mock), "").unwrap().with_poll_settings(PollSettings {
        interval: Duration::from_millis(5),
        ceiling: Duration::from_millis(50),
    });
    ad2.setup_channel(Chan::Ch2, 2.0, 0.0, Coupling::Dc)
        .await
        .unwrap();
    ad2.setup_time(1e-6, 0.0, SampleMode::Sample, 100)
        .await
        .unwrap();

    let err = ad2.get_samples().await.unwrap_err();
    assert!(matches!(err, MeasureError::AcquisitionTimeout(_)));
    assert!(err.is_timeout());
}

#[test]
fn test_registry_matches_serial_suffix() {
    let mock = MockAnalogDevice::new();
    let enumerator = MockEnumerator::new().with_device("SN:210321A1B2C3", true, mock);
    let opened = enumerator.opened();
    let mut registry = DeviceRegistry::new(Box::new(enumerator));

    assert!(Ad2::open(&mut registry, "FFFF").unwrap_err().is_not_found());
    Ad2::open(&mut registry, "B2C3").unwrap();
    assert_eq!(*opened.lock().unwrap(), vec!["SN:210321A1B2C3".to_string()]);
}

#[test]
fn test_unavailable_device_skipped() {
    let busy = MockAnalogDevice::new();
    let mut registry = DeviceRegistry::new(Box::new(MockEnumerator::new().with_device(
        "SN:210321AAAAAA",
        false,
        busy,
    )));
    let err = Ad2::open(&mut registry, "").unwrap_err();
    assert!(matches!(err, MeasureError::DeviceNotFound(_)));
}

#[tokio::test]
async fn test_factory_opens_ad2_as_psu_and_scope() {
    let mock = MockAnalogDevice::new();
    let mut registry = registry(&mock);
    let config = InstrumentConfig::new("ad2", InstrumentKind::Ad2, "B2C3");

    let psu = instruments::open_psu(&config, Some(&mut registry))
        .await
        .unwrap();
    psu.set_output(Chan::Ch1, 3.3, 0.1).await.unwrap();
    assert_eq!(mock.node(0, 1), Some(3.3));

    let scope = instruments::open_scope(&config, PollSettings::default(), Some(&mut registry))
        .await
        .unwrap();
    assert_eq!(scope.channel_count(), 2);
    assert_eq!(scope.query_idn().await.unwrap(), "Digilent Analog Discovery 2");
}

#[tokio::test]
async fn test_factory_applies_poll_settings() {
    let mock = MockAnalogDevice::new();
    mock.never_complete();
    let mut registry = registry(&mock);
    let config = InstrumentConfig::new("ad2", InstrumentKind::Ad2, "B2C3");
    let poll = PollSettings {
        interval: Duration::from_millis(5),
        ceiling: Duration::from_millis(50),
    };

    let scope = instruments::open_scope(&config, poll, Some(&mut registry))
        .await
        .unwrap();
    scope
        .setup_channel(Chan::Ch1, 5.0, 0.0, Coupling::Dc)
        .await
        .unwrap();
    scope
        .setup_time(1e-6, 0.0, SampleMode::Sample, 100)
        .await
        .unwrap();

    // The default ceiling is 10 s; the configured one must win
    let result = tokio::time::timeout(Duration::from_secs(2), scope.get_samples())
        .await
        .expect("configured ceiling not applied");
    match result {
        Err(MeasureError::AcquisitionTimeout(ceiling)) => assert_eq!(ceiling, poll.ceiling),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("acquisition should not complete"),
    }
}
