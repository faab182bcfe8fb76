//! In-memory BLE platform.
//!
//! Backs the test suite and the `--simulate` mode of the binary. Adapter,
//! permission and location state are scriptable; devices advertise on demand;
//! Control Point writes are logged and answered with a configurable result
//! code, the way an FTMS trainer indicates its responses.

use crate::sensors::ftms::{
    build_control_point_response, ResultCode, CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID,
    CYCLING_POWER_MEASUREMENT_UUID, CYCLING_POWER_SERVICE_UUID, FTMS_CONTROL_POINT_UUID,
    FTMS_FEATURE_UUID, FTMS_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
    INDOOR_BIKE_DATA_UUID,
};
use crate::sensors::platform::{AdapterEvent, BlePlatform, Notification};
use crate::sensors::types::{AdapterState, Advertisement, PermissionStatus, SensorError};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A device known to the simulated adapter.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    /// Platform identifier
    pub id: String,
    /// Advertised name
    pub name: String,
    /// Advertised RSSI
    pub rssi: i16,
    /// Advertised services
    pub services: Vec<Uuid>,
    /// Characteristics found on service discovery
    pub characteristics: Vec<Uuid>,
    /// Fitness Machine Feature value, if the device has one
    pub features: Option<Vec<u8>>,
}

impl SimulatedDevice {
    /// An FTMS trainer that supports power target setting.
    pub fn trainer(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            rssi: -55,
            services: vec![FTMS_SERVICE_UUID],
            characteristics: vec![
                INDOOR_BIKE_DATA_UUID,
                FTMS_CONTROL_POINT_UUID,
                FTMS_FEATURE_UUID,
            ],
            // Cadence + power measurement; power target setting
            features: Some(vec![0x02, 0x40, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00]),
        }
    }

    /// A heart rate strap.
    pub fn heart_rate_monitor(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            rssi: -65,
            services: vec![HEART_RATE_SERVICE_UUID],
            characteristics: vec![HEART_RATE_MEASUREMENT_UUID],
            features: None,
        }
    }

    /// A crank-based power meter.
    pub fn power_meter(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            rssi: -60,
            services: vec![CYCLING_POWER_SERVICE_UUID],
            characteristics: vec![CYCLING_POWER_MEASUREMENT_UUID],
            features: None,
        }
    }

    /// A speed/cadence sensor.
    pub fn cadence_sensor(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            rssi: -70,
            services: vec![CSC_SERVICE_UUID],
            characteristics: vec![CSC_MEASUREMENT_UUID],
            features: None,
        }
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            id: self.id.clone(),
            name: Some(self.name.clone()),
            rssi: Some(self.rssi),
            services: self.services.clone(),
        }
    }
}

/// A characteristic write seen by the simulated adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Target device
    pub device_id: String,
    /// Target characteristic
    pub characteristic: Uuid,
    /// Bytes written
    pub value: Vec<u8>,
}

struct DeviceSlot {
    device: SimulatedDevice,
    connected: bool,
    notify_tx: broadcast::Sender<Notification>,
    target_watts: Option<i16>,
}

impl DeviceSlot {
    fn new(device: SimulatedDevice) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            device,
            connected: false,
            notify_tx,
            target_watts: None,
        }
    }
}

struct SimState {
    adapter: AdapterState,
    permission: PermissionStatus,
    permission_on_request: PermissionStatus,
    location_enabled: bool,
    scanning: bool,
    scan_starts: usize,
    devices: HashMap<String, DeviceSlot>,
    failing_writes: u32,
    control_result: ResultCode,
    respond_to_control: bool,
    unreachable: Vec<String>,
    writes: Vec<WriteRecord>,
}

/// Scriptable in-memory [`BlePlatform`].
pub struct SimulatedPlatform {
    state: Mutex<SimState>,
    adapter_tx: broadcast::Sender<AdapterEvent>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    /// Adapter on, permission granted, location enabled, no devices.
    pub fn new() -> Self {
        let (adapter_tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(SimState {
                adapter: AdapterState::On,
                permission: PermissionStatus::Granted,
                permission_on_request: PermissionStatus::Granted,
                location_enabled: true,
                scanning: false,
                scan_starts: 0,
                devices: HashMap::new(),
                failing_writes: 0,
                control_result: ResultCode::Success,
                respond_to_control: true,
                unreachable: Vec::new(),
                writes: Vec::new(),
            }),
            adapter_tx,
        }
    }

    fn emit(&self, event: AdapterEvent) {
        let _ = self.adapter_tx.send(event);
    }

    /// Register a device (it does not advertise until [`Self::advertise`]).
    pub async fn add_device(&self, device: SimulatedDevice) {
        let mut state = self.state.lock().await;
        state
            .devices
            .insert(device.id.clone(), DeviceSlot::new(device));
    }

    /// Emit one advertisement for a registered device.
    pub async fn advertise(&self, device_id: &str) {
        let advertisement = {
            let state = self.state.lock().await;
            match state.devices.get(device_id) {
                Some(slot) => slot.device.advertisement(),
                None => return,
            }
        };
        self.emit(AdapterEvent::Advertisement(advertisement));
    }

    /// Emit an advertisement for every registered device.
    pub async fn advertise_all(&self) {
        let advertisements: Vec<Advertisement> = {
            let state = self.state.lock().await;
            state
                .devices
                .values()
                .map(|slot| slot.device.advertisement())
                .collect()
        };
        for advertisement in advertisements {
            self.emit(AdapterEvent::Advertisement(advertisement));
        }
    }

    /// Change the adapter state and report it.
    pub async fn set_adapter_state(&self, adapter: AdapterState) {
        {
            let mut state = self.state.lock().await;
            state.adapter = adapter;
            if adapter != AdapterState::On {
                state.scanning = false;
            }
        }
        self.emit(AdapterEvent::StateChanged(adapter));
    }

    /// Change the permission status and report it.
    pub async fn set_permission(&self, permission: PermissionStatus) {
        self.state.lock().await.permission = permission;
        self.emit(AdapterEvent::PermissionChanged(permission));
    }

    /// Status returned the next time permission is requested.
    pub async fn set_permission_on_request(&self, permission: PermissionStatus) {
        self.state.lock().await.permission_on_request = permission;
    }

    /// Toggle the location service and report it.
    pub async fn set_location_enabled(&self, enabled: bool) {
        self.state.lock().await.location_enabled = enabled;
        self.emit(AdapterEvent::LocationServiceChanged(enabled));
    }

    /// Make the next `count` writes fail at the GATT level.
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.failing_writes = count;
    }

    /// Result code used to answer Set Target Power.
    pub async fn set_control_result(&self, result: ResultCode) {
        self.state.lock().await.control_result = result;
    }

    /// Whether Control Point writes get a response indication at all.
    pub async fn set_respond_to_control(&self, respond: bool) {
        self.state.lock().await.respond_to_control = respond;
    }

    /// Make connection attempts to a device hang until they time out.
    pub async fn set_unreachable(&self, device_id: &str) {
        self.state
            .lock()
            .await
            .unreachable
            .push(device_id.to_string());
    }

    /// Push a notification from a connected device.
    pub async fn notify(&self, device_id: &str, characteristic: Uuid, value: Vec<u8>) {
        let state = self.state.lock().await;
        if let Some(slot) = state.devices.get(device_id) {
            if slot.connected {
                let _ = slot.notify_tx.send(Notification {
                    characteristic,
                    value,
                });
            }
        }
    }

    /// Push an Indoor Bike Data notification with speed, cadence and power.
    pub async fn emit_bike_data(&self, device_id: &str, power: i16, cadence_rpm: f32, speed_kmh: f32) {
        // Flags: instantaneous cadence + instantaneous power, speed present
        let mut data = vec![0x44, 0x00];
        data.extend_from_slice(&((speed_kmh * 100.0) as u16).to_le_bytes());
        data.extend_from_slice(&((cadence_rpm * 2.0) as u16).to_le_bytes());
        data.extend_from_slice(&power.to_le_bytes());
        self.notify(device_id, INDOOR_BIKE_DATA_UUID, data).await;
    }

    /// Push a Heart Rate Measurement notification.
    pub async fn emit_heart_rate(&self, device_id: &str, bpm: u8) {
        self.notify(device_id, HEART_RATE_MEASUREMENT_UUID, vec![0x00, bpm])
            .await;
    }

    /// Drop the link to a device, ending its notification stream.
    pub async fn drop_link(&self, device_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.devices.get_mut(device_id) {
            slot.connected = false;
            let (notify_tx, _) = broadcast::channel(64);
            slot.notify_tx = notify_tx;
        }
    }

    /// Every write seen so far.
    pub async fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().await.writes.clone()
    }

    /// Writes to the Control Point of one device, as raw frames.
    pub async fn control_writes(&self, device_id: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .writes
            .iter()
            .filter(|w| w.device_id == device_id && w.characteristic == FTMS_CONTROL_POINT_UUID)
            .map(|w| w.value.clone())
            .collect()
    }

    /// Last target power accepted by a simulated trainer.
    pub async fn target_power(&self, device_id: &str) -> Option<i16> {
        self.state
            .lock()
            .await
            .devices
            .get(device_id)
            .and_then(|slot| slot.target_watts)
    }

    /// Whether the platform scan is running.
    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scanning
    }

    /// How many times the platform scan was started.
    pub async fn scan_start_count(&self) -> usize {
        self.state.lock().await.scan_starts
    }

    /// Whether a device is connected.
    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.state
            .lock()
            .await
            .devices
            .get(device_id)
            .map(|slot| slot.connected)
            .unwrap_or(false)
    }

    /// A trainer and a heart rate strap, for demos.
    pub async fn with_demo_devices() -> Arc<Self> {
        let platform = Arc::new(Self::new());
        platform
            .add_device(SimulatedDevice::trainer("sim-trainer", "SIM Smart Trainer"))
            .await;
        platform
            .add_device(SimulatedDevice::heart_rate_monitor("sim-hrm", "SIM HRM"))
            .await;
        platform
    }

    /// Advertise every second and stream rider data that follows the ERG target.
    pub fn spawn_demo_feed(self: &Arc<Self>) -> JoinHandle<()> {
        let platform = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut beat: u8 = 0;
            loop {
                interval.tick().await;
                platform.advertise_all().await;

                let trainer_ids: Vec<(String, Option<i16>)> = {
                    let state = platform.state.lock().await;
                    state
                        .devices
                        .values()
                        .filter(|slot| slot.connected && slot.device.services.contains(&FTMS_SERVICE_UUID))
                        .map(|slot| (slot.device.id.clone(), slot.target_watts))
                        .collect()
                };
                for (id, target) in trainer_ids {
                    let power = target.unwrap_or(100);
                    let cadence = 85.0 + f32::from(beat % 10);
                    platform.emit_bike_data(&id, power, cadence, 30.0).await;
                }

                beat = beat.wrapping_add(1);
                platform.emit_heart_rate("sim-hrm", 120 + beat % 20).await;
            }
        })
    }

    async fn connected_slot_check(&self, device_id: &str) -> Result<(), SensorError> {
        let state = self.state.lock().await;
        match state.devices.get(device_id) {
            Some(slot) if slot.connected => Ok(()),
            Some(_) => Err(SensorError::NotConnected),
            None => Err(SensorError::DeviceNotFound(device_id.to_string())),
        }
    }
}

impl BlePlatform for SimulatedPlatform {
    fn adapter_events(&self) -> BoxStream<'static, AdapterEvent> {
        let rx = self.adapter_tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    async fn adapter_state(&self) -> AdapterState {
        self.state.lock().await.adapter
    }

    async fn check_permission(&self) -> PermissionStatus {
        self.state.lock().await.permission
    }

    async fn request_permission(&self) -> PermissionStatus {
        let permission = {
            let mut state = self.state.lock().await;
            state.permission = state.permission_on_request;
            state.permission
        };
        self.emit(AdapterEvent::PermissionChanged(permission));
        permission
    }

    async fn location_service_enabled(&self) -> bool {
        self.state.lock().await.location_enabled
    }

    async fn start_scan(&self, _services: &[Uuid]) -> Result<(), SensorError> {
        let mut state = self.state.lock().await;
        if state.adapter != AdapterState::On {
            return Err(SensorError::BluetoothDisabled);
        }
        state.scanning = true;
        state.scan_starts += 1;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), SensorError> {
        self.state.lock().await.scanning = false;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<(), SensorError> {
        let hang = {
            let mut state = self.state.lock().await;
            if state.unreachable.iter().any(|id| id == device_id) {
                true
            } else {
                let slot = state
                    .devices
                    .get_mut(device_id)
                    .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))?;
                slot.connected = true;
                false
            }
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), SensorError> {
        self.drop_link(device_id).await;
        Ok(())
    }

    async fn discover_characteristics(&self, device_id: &str) -> Result<Vec<Uuid>, SensorError> {
        let state = self.state.lock().await;
        state
            .devices
            .get(device_id)
            .map(|slot| slot.device.characteristics.clone())
            .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))
    }

    async fn subscribe(&self, device_id: &str, characteristic: Uuid) -> Result<(), SensorError> {
        let state = self.state.lock().await;
        let slot = state
            .devices
            .get(device_id)
            .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))?;
        if slot.device.characteristics.contains(&characteristic) {
            Ok(())
        } else {
            Err(SensorError::SubscriptionFailed(characteristic.to_string()))
        }
    }

    async fn notifications(
        &self,
        device_id: &str,
    ) -> Result<BoxStream<'static, Notification>, SensorError> {
        let rx = {
            let state = self.state.lock().await;
            let slot = state
                .devices
                .get(device_id)
                .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))?;
            slot.notify_tx.subscribe()
        };

        Ok(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => return Some((notification, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }

    async fn read(&self, device_id: &str, characteristic: Uuid) -> Result<Vec<u8>, SensorError> {
        self.connected_slot_check(device_id).await?;
        let state = self.state.lock().await;
        let slot = state
            .devices
            .get(device_id)
            .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))?;

        if characteristic == FTMS_FEATURE_UUID {
            slot.device
                .features
                .clone()
                .ok_or_else(|| SensorError::ReadFailed("no feature characteristic".to_string()))
        } else {
            Err(SensorError::ReadFailed(characteristic.to_string()))
        }
    }

    async fn write(
        &self,
        device_id: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), SensorError> {
        self.connected_slot_check(device_id).await?;
        let mut state = self.state.lock().await;

        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(SensorError::WriteFailed("simulated GATT failure".to_string()));
        }

        state.writes.push(WriteRecord {
            device_id: device_id.to_string(),
            characteristic,
            value: value.to_vec(),
        });

        if characteristic != FTMS_CONTROL_POINT_UUID || value.is_empty() {
            return Ok(());
        }

        let opcode = value[0];
        let result = if opcode == 0x05 {
            state.control_result
        } else {
            ResultCode::Success
        };
        let respond = state.respond_to_control;

        if let Some(slot) = state.devices.get_mut(device_id) {
            if opcode == 0x05 && result.is_success() && value.len() >= 3 {
                slot.target_watts = Some(i16::from_le_bytes([value[1], value[2]]));
            }
            if respond {
                let _ = slot.notify_tx.send(Notification {
                    characteristic: FTMS_CONTROL_POINT_UUID,
                    value: build_control_point_response(opcode, result),
                });
            }
        }

        Ok(())
    }
}
