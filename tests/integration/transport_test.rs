//! Device link and Control Point path against the simulated adapter.

use super::sensor_mock::{platform_with_devices, within, HRM_ID, TRAINER_ID};
use ridelink::sensors::ftms::ResultCode;
use ridelink::sensors::simulated::SimulatedPlatform;
use ridelink::sensors::transport::{Transport, TransportConfig};
use ridelink::sensors::types::{ConnectionState, Metric, SensorError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn connected_trainer() -> (Arc<SimulatedPlatform>, Transport<SimulatedPlatform>) {
    let platform = platform_with_devices().await;
    let transport = Transport::new(Arc::clone(&platform), TRAINER_ID, TransportConfig::default());
    transport.connect().await.unwrap();
    (platform, transport)
}

#[tokio::test(start_paused = true)]
async fn test_connect_reads_features() {
    let (platform, transport) = connected_trainer().await;

    assert_eq!(transport.state(), ConnectionState::Connected);
    assert!(platform.is_connected(TRAINER_ID).await);
    assert!(transport.has_control_point());
    assert!(transport.features().unwrap().supports_power_target());

    // Connecting again is a no-op.
    transport.connect().await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_bike_data_fans_out_per_metric() {
    let (platform, transport) = connected_trainer().await;
    let mut power = transport.subscribe(Metric::Power);
    let mut cadence = transport.subscribe(Metric::Cadence);
    let mut speed = transport.subscribe(Metric::Speed);

    platform.emit_bike_data(TRAINER_ID, 250, 90.0, 32.5).await;

    assert_eq!(within(power.recv()).await.unwrap().value, 250.0);
    assert_eq!(within(cadence.recv()).await.unwrap().value, 90.0);
    assert!((within(speed.recv()).await.unwrap().value - 32.5).abs() < 0.01);
}

#[tokio::test(start_paused = true)]
async fn test_first_target_requests_control() {
    let (platform, transport) = connected_trainer().await;

    transport.set_target_power(200).await.unwrap();

    assert_eq!(
        platform.control_writes(TRAINER_ID).await,
        vec![vec![0x00], vec![0x05, 0xC8, 0x00]]
    );
    assert_eq!(platform.target_power(TRAINER_ID).await, Some(200));

    // Control is held, so the next target goes out alone.
    transport.set_target_power(210).await.unwrap();
    assert_eq!(platform.control_writes(TRAINER_ID).await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_writes_are_spaced_by_debounce() {
    let (_platform, transport) = connected_trainer().await;

    transport.set_target_power(200).await.unwrap();
    let after_first = Instant::now();
    transport.set_target_power(220).await.unwrap();

    assert!(Instant::now() - after_first >= TransportConfig::default().debounce);
}

#[tokio::test(start_paused = true)]
async fn test_queued_target_is_sent_once() {
    let (platform, transport) = connected_trainer().await;

    let (a, b, c) = tokio::join!(
        transport.set_target_power(150),
        transport.set_target_power(150),
        transport.set_target_power(170),
    );
    assert!(a.is_ok() && b.is_ok());
    assert!(matches!(c, Err(SensorError::TargetPending(150))));

    assert_eq!(
        platform.control_writes(TRAINER_ID).await,
        vec![vec![0x00], vec![0x05, 0x96, 0x00]]
    );
    assert_eq!(platform.target_power(TRAINER_ID).await, Some(150));
}

#[tokio::test(start_paused = true)]
async fn test_target_is_clamped() {
    let (platform, transport) = connected_trainer().await;

    transport.set_target_power(3000).await.unwrap();
    assert_eq!(platform.target_power(TRAINER_ID).await, Some(1500));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_target_reports_result_code() {
    let (platform, transport) = connected_trainer().await;
    platform.set_control_result(ResultCode::InvalidParameter).await;

    let result = transport.set_target_power(200).await;
    assert!(matches!(
        result,
        Err(SensorError::ControlRejected(ResultCode::InvalidParameter))
    ));
    assert_eq!(platform.target_power(TRAINER_ID).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_missing_response_times_out() {
    let (platform, transport) = connected_trainer().await;
    platform.set_respond_to_control(false).await;

    let result = transport.set_target_power(200).await;
    assert!(matches!(result, Err(SensorError::AckTimeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_reaches_caller() {
    let (platform, transport) = connected_trainer().await;
    transport.request_control().await.unwrap();

    platform.fail_next_writes(1).await;
    let result = transport.set_target_power(200).await;
    assert!(matches!(result, Err(SensorError::WriteFailed(_))));

    transport.set_target_power(200).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_marks_disconnected() {
    let (platform, transport) = connected_trainer().await;
    let mut state = transport.subscribe_state();

    platform.drop_link(TRAINER_ID).await;
    within(state.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .unwrap();

    assert!(matches!(
        transport.set_target_power(200).await,
        Err(SensorError::NotConnected)
    ));

    // The link can be brought back.
    transport.connect().await.unwrap();
    transport.set_target_power(200).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_device_times_out() {
    let platform = platform_with_devices().await;
    platform.set_unreachable(TRAINER_ID).await;
    let transport = Transport::new(Arc::clone(&platform), TRAINER_ID, TransportConfig::default());

    let result = transport.connect().await;
    assert!(matches!(
        result,
        Err(SensorError::ConnectionTimeout(limit)) if limit == Duration::from_secs(15)
    ));
    assert_eq!(transport.state(), ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_commands_need_a_control_point() {
    let platform = platform_with_devices().await;
    let transport = Transport::new(Arc::clone(&platform), HRM_ID, TransportConfig::default());

    assert!(matches!(
        transport.set_target_power(200).await,
        Err(SensorError::NotConnected)
    ));

    transport.connect().await.unwrap();
    assert!(!transport.has_control_point());
    assert!(matches!(
        transport.set_target_power(200).await,
        Err(SensorError::Unsupported)
    ));

    let mut heart_rate = transport.subscribe(Metric::HeartRate);
    platform.emit_heart_rate(HRM_ID, 152).await;
    assert_eq!(within(heart_rate.recv()).await.unwrap().value, 152.0);
}
