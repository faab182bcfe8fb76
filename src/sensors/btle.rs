//! btleplug-backed BLE platform.
//!
//! Desktop stacks have no runtime Bluetooth permission or location-service
//! precondition, so both are reported as satisfied once an adapter exists.

use crate::sensors::platform::{AdapterEvent, BlePlatform, Notification};
use crate::sensors::types::{AdapterState, Advertisement, PermissionStatus, SensorError};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, BoxStream, StreamExt};
use uuid::Uuid;

/// BLE platform over the first btleplug adapter.
pub struct BtleplugPlatform {
    adapter: Adapter,
}

impl BtleplugPlatform {
    /// Initialize the BLE adapter.
    pub async fn new() -> Result<Self, SensorError> {
        tracing::info!("Initializing btleplug adapter");

        let manager = Manager::new()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(SensorError::AdapterNotFound)?;

        tracing::info!("BLE adapter initialized");
        Ok(Self { adapter })
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral, SensorError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))
    }

    async fn characteristic(
        &self,
        device_id: &str,
        uuid: Uuid,
    ) -> Result<(Peripheral, Characteristic), SensorError> {
        let peripheral = self.peripheral(device_id).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(SensorError::Unsupported)?;
        Ok((peripheral, characteristic))
    }
}

/// Turn a central event into an advertisement, if it carries one.
async fn advertisement_for(adapter: &Adapter, event: CentralEvent) -> Option<AdapterEvent> {
    let id: PeripheralId = match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ServicesAdvertisement { id, .. }
        | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
        _ => return None,
    };

    let peripheral = adapter.peripheral(&id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;

    Some(AdapterEvent::Advertisement(Advertisement {
        id: id.to_string(),
        name: properties.local_name,
        rssi: properties.rssi,
        services: properties.services,
    }))
}

impl BlePlatform for BtleplugPlatform {
    fn adapter_events(&self) -> BoxStream<'static, AdapterEvent> {
        let adapter = self.adapter.clone();
        let lookup = self.adapter.clone();

        let central_events = stream::once(async move { adapter.events().await })
            .filter_map(|events| async move {
                match events {
                    Ok(events) => Some(events),
                    Err(e) => {
                        tracing::error!("Failed to get adapter events: {}", e);
                        None
                    }
                }
            })
            .flatten()
            .filter_map(move |event| {
                let adapter = lookup.clone();
                async move { advertisement_for(&adapter, event).await }
            });

        stream::once(async { AdapterEvent::StateChanged(AdapterState::On) })
            .chain(central_events)
            .boxed()
    }

    async fn adapter_state(&self) -> AdapterState {
        AdapterState::On
    }

    async fn check_permission(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn request_permission(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn location_service_enabled(&self) -> bool {
        true
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), SensorError> {
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| SensorError::ScanFailed(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), SensorError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| SensorError::ScanFailed(e.to_string()))
    }

    async fn connect(&self, device_id: &str) -> Result<(), SensorError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| SensorError::ConnectionFailed(e.to_string()))
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), SensorError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))
    }

    async fn discover_characteristics(&self, device_id: &str) -> Result<Vec<Uuid>, SensorError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| SensorError::ConnectionFailed(e.to_string()))?;

        Ok(peripheral.characteristics().iter().map(|c| c.uuid).collect())
    }

    async fn subscribe(&self, device_id: &str, characteristic: Uuid) -> Result<(), SensorError> {
        let (peripheral, characteristic) = self.characteristic(device_id, characteristic).await?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| SensorError::SubscriptionFailed(e.to_string()))
    }

    async fn notifications(
        &self,
        device_id: &str,
    ) -> Result<BoxStream<'static, Notification>, SensorError> {
        let peripheral = self.peripheral(device_id).await?;
        let stream = peripheral
            .notifications()
            .await
            .map_err(|e| SensorError::SubscriptionFailed(e.to_string()))?;

        Ok(stream
            .map(|n| Notification {
                characteristic: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    async fn read(&self, device_id: &str, characteristic: Uuid) -> Result<Vec<u8>, SensorError> {
        let (peripheral, characteristic) = self.characteristic(device_id, characteristic).await?;
        peripheral
            .read(&characteristic)
            .await
            .map_err(|e| SensorError::ReadFailed(e.to_string()))
    }

    async fn write(
        &self,
        device_id: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), SensorError> {
        let (peripheral, characteristic) = self.characteristic(device_id, characteristic).await?;
        peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await
            .map_err(|e| SensorError::WriteFailed(e.to_string()))
    }
}
