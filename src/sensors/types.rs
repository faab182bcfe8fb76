//! Sensor types and enums for BLE fitness devices.
//!
//! Shared vocabulary for the scanner, transport, device handles and the
//! device manager: adapter/permission state, discovered devices, readings,
//! capabilities and the sensor error taxonomy.

use crate::sensors::ftms::{
    ResultCode, CSC_SERVICE_UUID, CYCLING_POWER_SERVICE_UUID, FTMS_SERVICE_UUID,
    HEART_RATE_SERVICE_UUID,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Default interval at which FTMS trainers must be re-sent their ERG target.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Kind of fitness device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Smart trainer with FTMS support
    Trainer,
    /// Standalone power meter
    PowerMeter,
    /// Cadence (or combined speed/cadence) sensor
    CadenceSensor,
    /// Heart rate monitor
    HeartRateMonitor,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Trainer => write!(f, "Smart Trainer"),
            DeviceKind::PowerMeter => write!(f, "Power Meter"),
            DeviceKind::CadenceSensor => write!(f, "Cadence Sensor"),
            DeviceKind::HeartRateMonitor => write!(f, "Heart Rate"),
        }
    }
}

/// A metric a device can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Power in watts
    Power,
    /// Cadence in RPM
    Cadence,
    /// Heart rate in BPM
    HeartRate,
    /// Speed in km/h
    Speed,
}

impl Metric {
    /// All metrics, in aggregation order.
    pub const ALL: [Metric; 4] = [
        Metric::Power,
        Metric::Cadence,
        Metric::HeartRate,
        Metric::Speed,
    ];
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Power => write!(f, "power"),
            Metric::Cadence => write!(f, "cadence"),
            Metric::HeartRate => write!(f, "heart rate"),
            Metric::Speed => write!(f, "speed"),
        }
    }
}

/// A single decoded measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Which metric this is
    pub metric: Metric,
    /// Value in the metric's unit (W, RPM, BPM, km/h)
    pub value: f32,
    /// Capture time
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Create a reading captured now.
    pub fn now(metric: Metric, value: f32) -> Self {
        Self {
            metric,
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Connection state of a device transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Active connection
    Connected,
    /// Last connection attempt or link failed
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Error => write!(f, "Error"),
        }
    }
}

/// Power state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    /// Not yet reported by the platform
    #[default]
    Unknown,
    /// No usable adapter on this host
    Unavailable,
    /// Adapter present but powered off
    Off,
    /// Powering on
    TurningOn,
    /// Powering off
    TurningOff,
    /// Powered on
    On,
}

impl AdapterState {
    /// Whether devices discovered so far must be forgotten.
    pub fn clears_devices(self) -> bool {
        matches!(self, AdapterState::Off | AdapterState::Unavailable)
    }
}

/// Bluetooth permission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionStatus {
    /// Never asked
    #[default]
    NotDetermined,
    /// Granted
    Granted,
    /// Denied, may be asked again
    Denied,
    /// Denied and the platform will not show the prompt again
    PermanentlyDenied,
}

/// Everything that decides whether scanning is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BluetoothState {
    /// Adapter power state
    pub adapter: AdapterState,
    /// Permission status
    pub permission: PermissionStatus,
    /// Location service enabled (platform precondition for scanning)
    pub location_enabled: bool,
}

impl BluetoothState {
    /// Adapter on, permission granted and location service enabled.
    pub fn can_scan(&self) -> bool {
        self.adapter == AdapterState::On
            && self.permission == PermissionStatus::Granted
            && self.location_enabled
    }

    /// Whether the user must go to system settings to grant access.
    pub fn permanently_denied(&self) -> bool {
        self.permission == PermissionStatus::PermanentlyDenied
    }
}

/// A single advertisement as reported by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Platform device identifier
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
}

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    /// BLE device address/identifier
    pub id: String,
    /// User-friendly name (from BLE advertisement)
    pub name: String,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
    /// Advertised services
    pub services: Vec<Uuid>,
    /// First advertisement since the device was last forgotten
    pub first_seen: Instant,
    /// Most recent advertisement
    pub last_seen: Instant,
}

impl DiscoveredDevice {
    /// Create a fresh entry from an advertisement.
    pub fn from_advertisement(adv: &Advertisement, now: Instant) -> Self {
        Self {
            id: adv.id.clone(),
            name: adv
                .name
                .clone()
                .unwrap_or_else(|| "Unknown Sensor".to_string()),
            rssi: adv.rssi,
            services: adv.services.clone(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Device kind implied by the advertised services, if it is a fitness device.
    pub fn kind(&self) -> Option<DeviceKind> {
        DeviceCapabilities::from_services(&self.services).map(|c| c.kind)
    }
}

/// What a device can do, fixed when the device handle is created.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    /// Device kind
    pub kind: DeviceKind,
    /// Metrics the device streams
    pub metrics: Vec<Metric>,
    /// Accepts FTMS Set Target Power
    pub supports_erg: bool,
    /// Trainer reverts to free ride unless the target is re-sent
    pub requires_continuous_refresh: bool,
    /// How often to re-send the target
    pub refresh_interval: Duration,
}

impl DeviceCapabilities {
    /// Derive capabilities from the advertised service set.
    ///
    /// FTMS wins over the other services since trainers commonly also expose
    /// Cycling Power and Heart Rate.
    pub fn from_services(services: &[Uuid]) -> Option<Self> {
        if services.contains(&FTMS_SERVICE_UUID) {
            Some(Self::trainer())
        } else if services.contains(&CYCLING_POWER_SERVICE_UUID) {
            Some(Self::sensor(
                DeviceKind::PowerMeter,
                vec![Metric::Power, Metric::Cadence],
            ))
        } else if services.contains(&CSC_SERVICE_UUID) {
            Some(Self::sensor(
                DeviceKind::CadenceSensor,
                vec![Metric::Cadence, Metric::Speed],
            ))
        } else if services.contains(&HEART_RATE_SERVICE_UUID) {
            Some(Self::sensor(
                DeviceKind::HeartRateMonitor,
                vec![Metric::HeartRate],
            ))
        } else {
            None
        }
    }

    /// Capabilities of an FTMS smart trainer.
    pub fn trainer() -> Self {
        Self {
            kind: DeviceKind::Trainer,
            metrics: vec![Metric::Power, Metric::Cadence, Metric::Speed],
            supports_erg: true,
            requires_continuous_refresh: true,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    fn sensor(kind: DeviceKind, metrics: Vec<Metric>) -> Self {
        Self {
            kind,
            metrics,
            supports_erg: false,
            requires_continuous_refresh: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Whether the device streams `metric`.
    pub fn provides(&self, metric: Metric) -> bool {
        self.metrics.contains(&metric)
    }
}

/// Errors that can occur in the sensor system.
#[derive(Debug, Clone, Error)]
pub enum SensorError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// BLE is not enabled on the system
    #[error("Bluetooth is disabled")]
    BluetoothDisabled,

    /// Permission denied for Bluetooth access
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// Failed to start BLE scanning
    #[error("Failed to start scanning: {0}")]
    ScanFailed(String),

    /// Device not found with given id
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Connection to device failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timed out
    #[error("Connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// Operation needs a connected device
    #[error("Device not connected")]
    NotConnected,

    /// Failed to subscribe to device notifications
    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    /// Failed to write to a characteristic
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Failed to read a characteristic
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// No control point response arrived in time
    #[error("No acknowledgment from trainer within {0:?}")]
    AckTimeout(Duration),

    /// A different target is already queued and was kept
    #[error("Target {0}W already queued")]
    TargetPending(i16),

    /// Trainer answered the command with a failure result code
    #[error("Trainer rejected command: {0}")]
    ControlRejected(ResultCode),

    /// Unsupported device or operation
    #[error("Unsupported device or operation")]
    Unsupported,

    /// Generic BLE error
    #[error("BLE error: {0}")]
    BleError(String),
}

impl SensorError {
    /// Whether retrying the same command may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SensorError::WriteFailed(_)
            | SensorError::AckTimeout(_)
            | SensorError::BleError(_)
            | SensorError::TargetPending(_) => true,
            SensorError::ControlRejected(code) => *code == ResultCode::OperationFailed,
            _ => false,
        }
    }

    /// Whether this is a connection-level failure surfaced to the caller.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SensorError::DeviceNotFound(_)
                | SensorError::ConnectionFailed(_)
                | SensorError::ConnectionTimeout(_)
        )
    }
}
