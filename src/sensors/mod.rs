//! Sensor module for BLE fitness device communication.

pub mod btle;
pub mod command_queue;
pub mod device;
pub mod ftms;
pub mod manager;
pub mod platform;
pub mod scanner;
pub mod simulated;
pub mod transport;
pub mod types;

pub use btle::BtleplugPlatform;
pub use command_queue::{CommandQueue, QueuePoll};
pub use device::FitnessDevice;
pub use ftms::{ControlCommand, ControlPointResponse, FtmsError, IndoorBikeData, ResultCode};
pub use manager::{DeviceManager, Role, RoleAssignments};
pub use platform::{AdapterEvent, BlePlatform, Notification};
pub use scanner::{ScanController, ScanToken, Scanner, ScannerConfig};
pub use simulated::{SimulatedDevice, SimulatedPlatform};
pub use transport::{MetricStreams, Transport, TransportConfig};
pub use types::{
    AdapterState, Advertisement, BluetoothState, ConnectionState, DeviceCapabilities, DeviceKind,
    DiscoveredDevice, Metric, PermissionStatus, Reading, SensorError,
};
