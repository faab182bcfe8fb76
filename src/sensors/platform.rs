//! BLE platform boundary.
//!
//! The engine only talks to Bluetooth through this trait: adapter state,
//! permissions, scanning, connections and GATT characteristic access. The
//! production implementation lives in [`crate::sensors::btle`], an in-memory
//! one in [`crate::sensors::simulated`].

use crate::sensors::types::{AdapterState, Advertisement, PermissionStatus, SensorError};
use futures::stream::BoxStream;
use std::future::Future;
use uuid::Uuid;

/// Something the adapter reports without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// Adapter power state changed
    StateChanged(AdapterState),
    /// Bluetooth permission changed (e.g. granted in system settings)
    PermissionChanged(PermissionStatus),
    /// Location service toggled
    LocationServiceChanged(bool),
    /// A device advertised
    Advertisement(Advertisement),
}

/// A notification or indication from a connected device.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Characteristic that changed
    pub characteristic: Uuid,
    /// Raw value
    pub value: Vec<u8>,
}

/// Narrow async interface over a platform BLE stack.
pub trait BlePlatform: Send + Sync + 'static {
    /// Stream of unsolicited adapter events.
    fn adapter_events(&self) -> BoxStream<'static, AdapterEvent>;

    /// Current adapter state.
    fn adapter_state(&self) -> impl Future<Output = AdapterState> + Send;

    /// Current permission status, without prompting.
    fn check_permission(&self) -> impl Future<Output = PermissionStatus> + Send;

    /// Prompt for permission if the platform allows it.
    fn request_permission(&self) -> impl Future<Output = PermissionStatus> + Send;

    /// Whether the location service is on.
    fn location_service_enabled(&self) -> impl Future<Output = bool> + Send;

    /// Start scanning for devices advertising any of `services`.
    fn start_scan(
        &self,
        services: &[Uuid],
    ) -> impl Future<Output = Result<(), SensorError>> + Send;

    /// Stop scanning.
    fn stop_scan(&self) -> impl Future<Output = Result<(), SensorError>> + Send;

    /// Connect to a device.
    fn connect(&self, device_id: &str) -> impl Future<Output = Result<(), SensorError>> + Send;

    /// Disconnect from a device.
    fn disconnect(&self, device_id: &str)
        -> impl Future<Output = Result<(), SensorError>> + Send;

    /// Discover services and return every characteristic UUID found.
    fn discover_characteristics(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<Vec<Uuid>, SensorError>> + Send;

    /// Enable notifications/indications on a characteristic.
    fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<(), SensorError>> + Send;

    /// Stream of notifications from a connected device. Ends when the link drops.
    fn notifications(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<BoxStream<'static, Notification>, SensorError>> + Send;

    /// Read a characteristic.
    fn read(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<Vec<u8>, SensorError>> + Send;

    /// Write a characteristic with response.
    fn write(
        &self,
        device_id: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> impl Future<Output = Result<(), SensorError>> + Send;
}
