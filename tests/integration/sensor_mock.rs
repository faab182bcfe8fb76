//! Shared fixtures over the simulated BLE platform.

use ridelink::sensors::device::FitnessDevice;
use ridelink::sensors::manager::{DeviceManager, Role};
use ridelink::sensors::simulated::{SimulatedDevice, SimulatedPlatform};
use ridelink::sensors::transport::TransportConfig;
use ridelink::sensors::types::{Advertisement, DiscoveredDevice};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const TRAINER_ID: &str = "kickr-01";
pub const HRM_ID: &str = "strap-01";
pub const POWER_METER_ID: &str = "pedals-01";

/// Let spawned tasks catch up with what the test just did.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Await with a generous limit so a broken test fails instead of hanging.
pub async fn within<F: Future>(future: F) -> F::Output {
    match tokio::time::timeout(Duration::from_secs(60), future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting"),
    }
}

/// What a scanner would have reported for a simulated device.
pub fn discovered(device: &SimulatedDevice) -> DiscoveredDevice {
    let advertisement = Advertisement {
        id: device.id.clone(),
        name: Some(device.name.clone()),
        rssi: Some(device.rssi),
        services: device.services.clone(),
    };
    DiscoveredDevice::from_advertisement(&advertisement, Instant::now())
}

/// A platform with a trainer, a heart rate strap and a power meter.
pub async fn platform_with_devices() -> Arc<SimulatedPlatform> {
    let platform = Arc::new(SimulatedPlatform::new());
    platform
        .add_device(SimulatedDevice::trainer(TRAINER_ID, "KICKR CORE"))
        .await;
    platform
        .add_device(SimulatedDevice::heart_rate_monitor(HRM_ID, "TICKR"))
        .await;
    platform
        .add_device(SimulatedDevice::power_meter(POWER_METER_ID, "Assioma"))
        .await;
    platform
}

/// Register a simulated device with the manager and connect it.
pub async fn connect(
    manager: &DeviceManager<SimulatedPlatform>,
    device: &SimulatedDevice,
) -> Arc<FitnessDevice<SimulatedPlatform>> {
    let handle = manager.add_or_get_existing(&discovered(device)).await.unwrap();
    handle.connect().await.unwrap();
    handle
}

/// Manager with the trainer connected and assigned as primary trainer.
pub async fn manager_with_trainer(
    platform: &Arc<SimulatedPlatform>,
) -> Arc<DeviceManager<SimulatedPlatform>> {
    let manager = Arc::new(DeviceManager::new(
        Arc::clone(platform),
        TransportConfig::default(),
    ));
    connect(&manager, &SimulatedDevice::trainer(TRAINER_ID, "KICKR CORE")).await;
    manager
        .assign_role(Role::PrimaryTrainer, TRAINER_ID)
        .await
        .unwrap();
    manager
}
