//! Fitness device handle.
//!
//! A [`FitnessDevice`] pairs a discovered device's identity and capabilities
//! with the [`Transport`] that talks to it.

use crate::sensors::platform::BlePlatform;
use crate::sensors::transport::{Transport, TransportConfig};
use crate::sensors::types::{
    ConnectionState, DeviceCapabilities, DeviceKind, DiscoveredDevice, Metric, Reading,
    SensorError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// A connectable fitness device.
pub struct FitnessDevice<P: BlePlatform> {
    id: String,
    name: String,
    capabilities: DeviceCapabilities,
    transport: Transport<P>,
}

impl<P: BlePlatform> FitnessDevice<P> {
    /// Create a handle for a discovered device.
    ///
    /// Fails with [`SensorError::Unsupported`] when none of the advertised
    /// services is a fitness service.
    pub fn from_discovered(
        platform: Arc<P>,
        discovered: &DiscoveredDevice,
        config: TransportConfig,
    ) -> Result<Self, SensorError> {
        let capabilities = DeviceCapabilities::from_services(&discovered.services)
            .ok_or(SensorError::Unsupported)?;
        Ok(Self::new(
            platform,
            &discovered.id,
            &discovered.name,
            capabilities,
            config,
        ))
    }

    /// Create a handle with explicit capabilities.
    pub fn new(
        platform: Arc<P>,
        id: &str,
        name: &str,
        capabilities: DeviceCapabilities,
        config: TransportConfig,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            capabilities,
            transport: Transport::new(platform, id, config),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.capabilities.kind
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// The underlying link.
    pub fn transport(&self) -> &Transport<P> {
        &self.transport
    }

    /// Connect and start streaming.
    pub async fn connect(&self) -> Result<(), SensorError> {
        self.transport.connect().await?;

        if self.capabilities.supports_erg && !self.supports_erg() {
            tracing::warn!(
                "{} does not advertise power target support, ERG disabled",
                self.name
            );
        }
        Ok(())
    }

    /// Disconnect.
    pub async fn disconnect(&self) -> Result<(), SensorError> {
        self.transport.disconnect().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Observe connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe_state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Whether this device accepts ERG targets.
    ///
    /// A trainer whose feature characteristic was read and does not list power
    /// target setting is treated as not supporting ERG.
    pub fn supports_erg(&self) -> bool {
        self.capabilities.supports_erg
            && self
                .transport
                .features()
                .map_or(true, |f| f.supports_power_target())
    }

    pub fn requires_continuous_refresh(&self) -> bool {
        self.capabilities.requires_continuous_refresh
    }

    pub fn refresh_interval(&self) -> Duration {
        self.capabilities.refresh_interval
    }

    /// Whether the device streams `metric`.
    pub fn provides(&self, metric: Metric) -> bool {
        self.capabilities.provides(metric)
    }

    /// Readings for a metric this device provides.
    pub fn subscribe(&self, metric: Metric) -> Option<broadcast::Receiver<Reading>> {
        self.provides(metric)
            .then(|| self.transport.subscribe(metric))
    }

    /// Send an ERG target and wait for the trainer's acknowledgment.
    pub async fn set_target_power(&self, watts: u16) -> Result<(), SensorError> {
        if !self.supports_erg() {
            return Err(SensorError::Unsupported);
        }
        if !self.is_connected() {
            return Err(SensorError::NotConnected);
        }
        self.transport.set_target_power(i32::from(watts)).await
    }
}

impl<P: BlePlatform> std::fmt::Debug for FitnessDevice<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitnessDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.capabilities.kind)
            .field("state", &self.connection_state())
            .finish()
    }
}
