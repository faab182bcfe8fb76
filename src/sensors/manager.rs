//! Device manager with role assignment and metric aggregation.
//!
//! Keeps one [`FitnessDevice`] per platform id, records which device plays
//! which role, and republishes each metric from the device currently chosen
//! for it:
//!
//! 1. the device explicitly assigned to that metric's source role;
//! 2. otherwise the primary trainer, if it streams the metric.
//!
//! Heart rate never falls back to the trainer.

use crate::sensors::device::FitnessDevice;
use crate::sensors::platform::BlePlatform;
use crate::sensors::transport::{MetricStreams, TransportConfig};
use crate::sensors::types::{DiscoveredDevice, Metric, Reading, SensorError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// A job a device can be assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Receives ERG targets
    PrimaryTrainer,
    /// Source of power readings
    PowerSource,
    /// Source of cadence readings
    CadenceSource,
    /// Source of speed readings
    SpeedSource,
    /// Source of heart rate readings
    HeartRateSource,
}

impl Role {
    /// Source role for a metric.
    pub fn for_metric(metric: Metric) -> Self {
        match metric {
            Metric::Power => Role::PowerSource,
            Metric::Cadence => Role::CadenceSource,
            Metric::Speed => Role::SpeedSource,
            Metric::HeartRate => Role::HeartRateSource,
        }
    }

    /// Metric a source role feeds; `None` for the trainer role.
    pub fn metric(self) -> Option<Metric> {
        match self {
            Role::PrimaryTrainer => None,
            Role::PowerSource => Some(Metric::Power),
            Role::CadenceSource => Some(Metric::Cadence),
            Role::SpeedSource => Some(Metric::Speed),
            Role::HeartRateSource => Some(Metric::HeartRate),
        }
    }
}

/// Device id held by each role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleAssignments {
    pub primary_trainer: Option<String>,
    pub power_source: Option<String>,
    pub cadence_source: Option<String>,
    pub speed_source: Option<String>,
    pub heart_rate_source: Option<String>,
}

impl RoleAssignments {
    /// Device holding `role`.
    pub fn get(&self, role: Role) -> Option<&str> {
        self.slot(role).as_deref()
    }

    fn slot(&self, role: Role) -> &Option<String> {
        match role {
            Role::PrimaryTrainer => &self.primary_trainer,
            Role::PowerSource => &self.power_source,
            Role::CadenceSource => &self.cadence_source,
            Role::SpeedSource => &self.speed_source,
            Role::HeartRateSource => &self.heart_rate_source,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<String> {
        match role {
            Role::PrimaryTrainer => &mut self.primary_trainer,
            Role::PowerSource => &mut self.power_source,
            Role::CadenceSource => &mut self.cadence_source,
            Role::SpeedSource => &mut self.speed_source,
            Role::HeartRateSource => &mut self.heart_rate_source,
        }
    }

    /// Put `device_id` in `role`, or clear it.
    pub fn set(&mut self, role: Role, device_id: Option<String>) {
        *self.slot_mut(role) = device_id;
    }

    /// Clear every role held by `device_id`. Returns the roles cleared.
    pub fn release_device(&mut self, device_id: &str) -> Vec<Role> {
        let roles = [
            Role::PrimaryTrainer,
            Role::PowerSource,
            Role::CadenceSource,
            Role::SpeedSource,
            Role::HeartRateSource,
        ];
        roles
            .into_iter()
            .filter(|role| {
                let slot = self.slot_mut(*role);
                if slot.as_deref() == Some(device_id) {
                    *slot = None;
                    true
                } else {
                    false
                }
            })
            .collect()
    }
}

struct Forwarder {
    source_id: String,
    task: JoinHandle<()>,
}

/// Registry of devices and their roles.
pub struct DeviceManager<P: BlePlatform> {
    platform: Arc<P>,
    config: TransportConfig,
    devices: RwLock<HashMap<String, Arc<FitnessDevice<P>>>>,
    roles: Mutex<RoleAssignments>,
    roles_tx: watch::Sender<RoleAssignments>,
    aggregated: MetricStreams,
    forwarders: Mutex<HashMap<Metric, Forwarder>>,
}

impl<P: BlePlatform> DeviceManager<P> {
    /// Create an empty manager.
    pub fn new(platform: Arc<P>, config: TransportConfig) -> Self {
        let (roles_tx, _) = watch::channel(RoleAssignments::default());
        Self {
            platform,
            config,
            devices: RwLock::new(HashMap::new()),
            roles: Mutex::new(RoleAssignments::default()),
            roles_tx,
            aggregated: MetricStreams::new(),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Return the handle for a discovered device, creating it on first use.
    ///
    /// The same id always yields the same handle, so the device keeps a
    /// single transport.
    pub async fn add_or_get_existing(
        &self,
        discovered: &DiscoveredDevice,
    ) -> Result<Arc<FitnessDevice<P>>, SensorError> {
        let mut devices = self.devices.write().await;
        if let Some(existing) = devices.get(&discovered.id) {
            return Ok(Arc::clone(existing));
        }

        let device = Arc::new(FitnessDevice::from_discovered(
            Arc::clone(&self.platform),
            discovered,
            self.config,
        )?);
        tracing::info!("Added {} ({}) as {}", device.name(), device.id(), device.kind());
        devices.insert(discovered.id.clone(), Arc::clone(&device));
        Ok(device)
    }

    /// Register a prebuilt handle, unless one already exists for its id.
    pub async fn add_device(&self, device: FitnessDevice<P>) -> Arc<FitnessDevice<P>> {
        let mut devices = self.devices.write().await;
        Arc::clone(
            devices
                .entry(device.id().to_string())
                .or_insert_with(|| Arc::new(device)),
        )
    }

    /// Look up a device.
    pub async fn device(&self, id: &str) -> Option<Arc<FitnessDevice<P>>> {
        self.devices.read().await.get(id).cloned()
    }

    /// All known devices.
    pub async fn devices(&self) -> Vec<Arc<FitnessDevice<P>>> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Forget a device: release its roles and disconnect it.
    pub async fn remove(&self, id: &str) -> Option<Arc<FitnessDevice<P>>> {
        let device = self.devices.write().await.remove(id)?;

        {
            let mut roles = self.roles.lock().await;
            let released = roles.release_device(id);
            if !released.is_empty() {
                tracing::info!("{} released roles {:?}", id, released);
                self.rewire(&roles).await;
                self.roles_tx.send_replace(roles.clone());
            }
        }

        if device.is_connected() {
            if let Err(e) = device.disconnect().await {
                tracing::warn!("Failed to disconnect {}: {}", id, e);
            }
        }
        Some(device)
    }

    /// Assign a role to a known device.
    ///
    /// Source roles require the device to stream that metric.
    pub async fn assign_role(&self, role: Role, device_id: &str) -> Result<(), SensorError> {
        let device = self
            .device(device_id)
            .await
            .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))?;

        if let Some(metric) = role.metric() {
            if !device.provides(metric) {
                tracing::warn!("{} cannot be the {} source", device.name(), metric);
                return Err(SensorError::Unsupported);
            }
        }

        let mut roles = self.roles.lock().await;
        roles.set(role, Some(device_id.to_string()));
        tracing::info!("{} assigned to {:?}", device.name(), role);
        self.rewire(&roles).await;
        self.roles_tx.send_replace(roles.clone());
        Ok(())
    }

    /// Clear a role.
    pub async fn clear_role(&self, role: Role) {
        let mut roles = self.roles.lock().await;
        roles.set(role, None);
        self.rewire(&roles).await;
        self.roles_tx.send_replace(roles.clone());
    }

    /// Device holding `role`.
    pub async fn role(&self, role: Role) -> Option<Arc<FitnessDevice<P>>> {
        let id = self.roles.lock().await.get(role)?.to_string();
        self.device(&id).await
    }

    /// Device receiving ERG targets.
    pub async fn primary_trainer(&self) -> Option<Arc<FitnessDevice<P>>> {
        self.role(Role::PrimaryTrainer).await
    }

    /// Current role assignments.
    pub fn roles(&self) -> RoleAssignments {
        self.roles_tx.borrow().clone()
    }

    /// Observe role assignments.
    pub fn subscribe_roles(&self) -> watch::Receiver<RoleAssignments> {
        self.roles_tx.subscribe()
    }

    /// Aggregated readings for a metric.
    pub fn subscribe(&self, metric: Metric) -> broadcast::Receiver<Reading> {
        self.aggregated.subscribe(metric)
    }

    /// Device currently feeding `metric`.
    pub async fn source_for(&self, metric: Metric) -> Option<String> {
        let roles = self.roles.lock().await.clone();
        self.resolve_source(&roles, metric)
            .await
            .map(|d| d.id().to_string())
    }

    async fn resolve_source(
        &self,
        roles: &RoleAssignments,
        metric: Metric,
    ) -> Option<Arc<FitnessDevice<P>>> {
        let devices = self.devices.read().await;

        let explicit = roles
            .get(Role::for_metric(metric))
            .and_then(|id| devices.get(id))
            .filter(|d| d.provides(metric));
        if let Some(device) = explicit {
            return Some(Arc::clone(device));
        }

        if metric == Metric::HeartRate {
            return None;
        }

        roles
            .get(Role::PrimaryTrainer)
            .and_then(|id| devices.get(id))
            .filter(|d| d.provides(metric))
            .cloned()
    }

    /// Point every aggregated stream at its current source.
    async fn rewire(&self, roles: &RoleAssignments) {
        let mut forwarders = self.forwarders.lock().await;

        for metric in Metric::ALL {
            let source = self.resolve_source(roles, metric).await;
            let current = forwarders.get(&metric).map(|f| f.source_id.as_str());

            if current == source.as_ref().map(|d| d.id()) {
                continue;
            }

            if let Some(old) = forwarders.remove(&metric) {
                old.task.abort();
            }

            let Some(device) = source else {
                tracing::debug!("No {} source", metric);
                continue;
            };
            let Some(mut rx) = device.subscribe(metric) else {
                continue;
            };

            tracing::debug!("{} now sourced from {}", metric, device.id());
            let tx = self.aggregated.sender(metric).clone();
            let task = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(reading) => {
                            let _ = tx.send(reading);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::trace!("Aggregator skipped {} readings", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });
            forwarders.insert(
                metric,
                Forwarder {
                    source_id: device.id().to_string(),
                    task,
                },
            );
        }
    }

    /// Stop forwarding and disconnect every device.
    pub async fn shutdown(&self) {
        for (_, forwarder) in self.forwarders.lock().await.drain() {
            forwarder.task.abort();
        }
        for device in self.devices().await {
            if device.is_connected() {
                if let Err(e) = device.disconnect().await {
                    tracing::warn!("Failed to disconnect {}: {}", device.id(), e);
                }
            }
        }
    }
}

impl<P: BlePlatform> Drop for DeviceManager<P> {
    fn drop(&mut self) {
        for (_, forwarder) in self.forwarders.get_mut().drain() {
            forwarder.task.abort();
        }
    }
}
