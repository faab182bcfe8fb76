//! Device registry, roles and metric aggregation.

use super::sensor_mock::{
    connect, discovered, platform_with_devices, settle, within, HRM_ID, POWER_METER_ID,
    TRAINER_ID,
};
use ridelink::sensors::ftms::CYCLING_POWER_MEASUREMENT_UUID;
use ridelink::sensors::manager::{DeviceManager, Role};
use ridelink::sensors::simulated::{SimulatedDevice, SimulatedPlatform};
use ridelink::sensors::transport::TransportConfig;
use ridelink::sensors::types::{DeviceKind, Metric, SensorError};
use std::sync::Arc;
use uuid::Uuid;

fn trainer() -> SimulatedDevice {
    SimulatedDevice::trainer(TRAINER_ID, "KICKR CORE")
}

fn strap() -> SimulatedDevice {
    SimulatedDevice::heart_rate_monitor(HRM_ID, "TICKR")
}

fn pedals() -> SimulatedDevice {
    SimulatedDevice::power_meter(POWER_METER_ID, "Assioma")
}

async fn manager() -> (Arc<SimulatedPlatform>, DeviceManager<SimulatedPlatform>) {
    let platform = platform_with_devices().await;
    let manager = DeviceManager::new(Arc::clone(&platform), TransportConfig::default());
    (platform, manager)
}

fn cycling_power_frame(watts: i16) -> Vec<u8> {
    let mut frame = vec![0x00, 0x00];
    frame.extend_from_slice(&watts.to_le_bytes());
    frame
}

#[tokio::test(start_paused = true)]
async fn test_same_id_yields_same_handle() {
    let (_platform, manager) = manager().await;

    let first = manager.add_or_get_existing(&discovered(&trainer())).await.unwrap();
    let second = manager.add_or_get_existing(&discovered(&trainer())).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.kind(), DeviceKind::Trainer);
    assert_eq!(manager.devices().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_services_are_rejected() {
    let (_platform, manager) = manager().await;
    let lamp = SimulatedDevice {
        services: vec![Uuid::from_u128(0x1234)],
        ..strap()
    };

    assert!(matches!(
        manager.add_or_get_existing(&discovered(&lamp)).await,
        Err(SensorError::Unsupported)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_role_assignment_checks_capabilities() {
    let (_platform, manager) = manager().await;
    manager.add_or_get_existing(&discovered(&trainer())).await.unwrap();
    manager.add_or_get_existing(&discovered(&strap())).await.unwrap();

    assert!(matches!(
        manager.assign_role(Role::PrimaryTrainer, "nope").await,
        Err(SensorError::DeviceNotFound(_))
    ));
    assert!(matches!(
        manager.assign_role(Role::HeartRateSource, TRAINER_ID).await,
        Err(SensorError::Unsupported)
    ));

    let mut roles = manager.subscribe_roles();
    manager.assign_role(Role::PrimaryTrainer, TRAINER_ID).await.unwrap();
    manager.assign_role(Role::HeartRateSource, HRM_ID).await.unwrap();

    assert!(roles.has_changed().unwrap());
    let assigned = roles.borrow_and_update().clone();
    assert_eq!(assigned.get(Role::PrimaryTrainer), Some(TRAINER_ID));
    assert_eq!(assigned.get(Role::HeartRateSource), Some(HRM_ID));
    assert_eq!(manager.primary_trainer().await.unwrap().id(), TRAINER_ID);

    manager.clear_role(Role::HeartRateSource).await;
    assert_eq!(manager.roles().get(Role::HeartRateSource), None);
}

#[tokio::test(start_paused = true)]
async fn test_trainer_is_fallback_source() {
    let (_platform, manager) = manager().await;
    manager.add_or_get_existing(&discovered(&trainer())).await.unwrap();
    manager.add_or_get_existing(&discovered(&pedals())).await.unwrap();
    manager.assign_role(Role::PrimaryTrainer, TRAINER_ID).await.unwrap();

    assert_eq!(manager.source_for(Metric::Power).await.as_deref(), Some(TRAINER_ID));
    assert_eq!(manager.source_for(Metric::Cadence).await.as_deref(), Some(TRAINER_ID));
    assert_eq!(manager.source_for(Metric::HeartRate).await, None);

    manager.assign_role(Role::PowerSource, POWER_METER_ID).await.unwrap();
    assert_eq!(
        manager.source_for(Metric::Power).await.as_deref(),
        Some(POWER_METER_ID)
    );
    assert_eq!(manager.source_for(Metric::Speed).await.as_deref(), Some(TRAINER_ID));
}

#[tokio::test(start_paused = true)]
async fn test_aggregated_streams_follow_roles() {
    let (platform, manager) = manager().await;
    connect(&manager, &trainer()).await;
    connect(&manager, &strap()).await;
    connect(&manager, &pedals()).await;
    manager.assign_role(Role::PrimaryTrainer, TRAINER_ID).await.unwrap();
    manager.assign_role(Role::HeartRateSource, HRM_ID).await.unwrap();

    let mut power = manager.subscribe(Metric::Power);
    let mut heart_rate = manager.subscribe(Metric::HeartRate);

    platform.emit_bike_data(TRAINER_ID, 250, 90.0, 30.0).await;
    platform.emit_heart_rate(HRM_ID, 141).await;
    assert_eq!(within(power.recv()).await.unwrap().value, 250.0);
    assert_eq!(within(heart_rate.recv()).await.unwrap().value, 141.0);

    // Pedals take over power; trainer power no longer reaches subscribers.
    manager.assign_role(Role::PowerSource, POWER_METER_ID).await.unwrap();
    platform.emit_bike_data(TRAINER_ID, 260, 90.0, 30.0).await;
    platform
        .notify(POWER_METER_ID, CYCLING_POWER_MEASUREMENT_UUID, cycling_power_frame(238))
        .await;
    assert_eq!(within(power.recv()).await.unwrap().value, 238.0);
}

#[tokio::test(start_paused = true)]
async fn test_remove_releases_roles_and_disconnects() {
    let (platform, manager) = manager().await;
    connect(&manager, &trainer()).await;
    manager.assign_role(Role::PrimaryTrainer, TRAINER_ID).await.unwrap();
    manager.assign_role(Role::PowerSource, TRAINER_ID).await.unwrap();

    let removed = manager.remove(TRAINER_ID).await.unwrap();
    assert_eq!(removed.id(), TRAINER_ID);
    assert!(!removed.is_connected());
    assert!(!platform.is_connected(TRAINER_ID).await);

    let roles = manager.roles();
    assert_eq!(roles.get(Role::PrimaryTrainer), None);
    assert_eq!(roles.get(Role::PowerSource), None);
    assert!(manager.primary_trainer().await.is_none());
    assert!(manager.remove(TRAINER_ID).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_erg_target_through_manager() {
    let (platform, manager) = manager().await;
    let kickr = connect(&manager, &trainer()).await;
    let hrm = connect(&manager, &strap()).await;

    assert!(kickr.supports_erg());
    assert!(kickr.requires_continuous_refresh());
    kickr.set_target_power(180).await.unwrap();
    assert_eq!(platform.target_power(TRAINER_ID).await, Some(180));

    assert!(!hrm.supports_erg());
    assert!(matches!(
        hrm.set_target_power(180).await,
        Err(SensorError::Unsupported)
    ));

    manager.shutdown().await;
    settle().await;
    assert!(!platform.is_connected(TRAINER_ID).await);
    assert!(!platform.is_connected(HRM_ID).await);
}
