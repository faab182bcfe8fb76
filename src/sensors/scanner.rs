//! Reference-counted device scanner.
//!
//! Any number of consumers may want scanning at once; each holds a
//! [`ScanToken`] and the platform scan runs while at least one token is
//! outstanding, the adapter is on, permission is granted, location is enabled
//! and the app is in the foreground. Discovered devices expire when they stop
//! advertising.
//!
//! [`ScanController`] holds the bookkeeping and decides when the platform scan
//! must start or stop; [`Scanner`] applies its decisions to a [`BlePlatform`].

use crate::sensors::ftms::FITNESS_SERVICES;
use crate::sensors::platform::{AdapterEvent, BlePlatform};
use crate::sensors::types::{
    AdapterState, Advertisement, BluetoothState, DiscoveredDevice, PermissionStatus,
};
use futures::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Scanner settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerConfig {
    /// Devices silent for longer than this are forgotten
    pub expiry: Duration,
    /// How often expired devices are swept
    pub sweep_interval: Duration,
    /// Services to scan for; devices advertising none of them are ignored
    pub services: Vec<Uuid>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            services: FITNESS_SERVICES.to_vec(),
        }
    }
}

/// Proof of an outstanding scan request.
///
/// Token numbers are unique across the process, so a token only ever
/// releases the request of the controller that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Platform call the controller wants made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    /// Start the platform scan
    Start,
    /// Stop the platform scan
    Stop,
    /// Leave it as is
    None,
}

/// Scan bookkeeping without I/O.
#[derive(Debug)]
pub struct ScanController {
    bluetooth: BluetoothState,
    tokens: HashSet<ScanToken>,
    devices: HashMap<String, DiscoveredDevice>,
    foreground: bool,
    platform_scanning: bool,
    expiry: Duration,
}

impl ScanController {
    /// Create a controller; the app starts in the foreground.
    pub fn new(expiry: Duration) -> Self {
        Self {
            bluetooth: BluetoothState::default(),
            tokens: HashSet::new(),
            devices: HashMap::new(),
            foreground: true,
            platform_scanning: false,
            expiry,
        }
    }

    /// Current Bluetooth preconditions.
    pub fn bluetooth(&self) -> BluetoothState {
        self.bluetooth
    }

    /// Whether the platform scan is running.
    pub fn is_scanning(&self) -> bool {
        self.platform_scanning
    }

    /// Outstanding scan requests.
    pub fn outstanding(&self) -> usize {
        self.tokens.len()
    }

    /// Discovered devices, strongest signal first.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<DiscoveredDevice> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| {
            b.rssi
                .unwrap_or(i16::MIN)
                .cmp(&a.rssi.unwrap_or(i16::MIN))
                .then_with(|| a.id.cmp(&b.id))
        });
        devices
    }

    /// Look up a discovered device.
    pub fn device(&self, id: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(id)
    }

    /// Register a scan request.
    pub fn acquire(&mut self) -> ScanToken {
        let token = ScanToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        self.tokens.insert(token);
        token
    }

    /// Release a scan request. Unknown tokens are ignored and return `false`.
    pub fn release(&mut self, token: ScanToken) -> bool {
        self.tokens.remove(&token)
    }

    /// Record an adapter state change. Returns `true` when devices were cleared.
    pub fn set_adapter_state(&mut self, adapter: AdapterState) -> bool {
        self.bluetooth.adapter = adapter;
        if adapter.clears_devices() && !self.devices.is_empty() {
            self.devices.clear();
            return true;
        }
        false
    }

    /// Record a permission change.
    pub fn set_permission(&mut self, permission: PermissionStatus) {
        self.bluetooth.permission = permission;
    }

    /// Record a location service change.
    pub fn set_location_enabled(&mut self, enabled: bool) {
        self.bluetooth.location_enabled = enabled;
    }

    /// Record an app lifecycle change.
    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
    }

    /// Merge an advertisement. Returns `true` for a device not seen before.
    pub fn upsert(&mut self, advertisement: &Advertisement, now: Instant) -> bool {
        match self.devices.get_mut(&advertisement.id) {
            Some(device) => {
                device.last_seen = now;
                if advertisement.rssi.is_some() {
                    device.rssi = advertisement.rssi;
                }
                if let Some(name) = &advertisement.name {
                    device.name = name.clone();
                }
                for service in &advertisement.services {
                    if !device.services.contains(service) {
                        device.services.push(*service);
                    }
                }
                false
            }
            None => {
                self.devices.insert(
                    advertisement.id.clone(),
                    DiscoveredDevice::from_advertisement(advertisement, now),
                );
                true
            }
        }
    }

    /// Forget devices not seen within the expiry window. Returns their ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let expiry = self.expiry;
        let expired: Vec<String> = self
            .devices
            .values()
            .filter(|d| now.saturating_duration_since(d.last_seen) > expiry)
            .map(|d| d.id.clone())
            .collect();

        for id in &expired {
            self.devices.remove(id);
        }
        expired
    }

    fn wants_scan(&self) -> bool {
        !self.tokens.is_empty() && self.bluetooth.can_scan() && self.foreground
    }

    /// Compare the desired and actual scan state.
    pub fn reconcile(&self) -> ScanAction {
        match (self.wants_scan(), self.platform_scanning) {
            (true, false) => ScanAction::Start,
            (false, true) => ScanAction::Stop,
            _ => ScanAction::None,
        }
    }

    /// Record the outcome of a platform start/stop.
    pub fn set_platform_scanning(&mut self, scanning: bool) {
        self.platform_scanning = scanning;
    }
}

struct ScannerShared<P: BlePlatform> {
    platform: Arc<P>,
    config: ScannerConfig,
    controller: Mutex<ScanController>,
    bluetooth_tx: watch::Sender<BluetoothState>,
    devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
    scanning_tx: watch::Sender<bool>,
}

impl<P: BlePlatform> ScannerShared<P> {
    fn publish(&self, controller: &ScanController) {
        self.bluetooth_tx.send_replace(controller.bluetooth());
        self.devices_tx.send_replace(controller.devices());
        self.scanning_tx.send_replace(controller.is_scanning());
    }

    /// Apply the controller's decision while holding its lock.
    async fn apply(&self, controller: &mut ScanController) {
        match controller.reconcile() {
            ScanAction::Start => match self.platform.start_scan(&self.config.services).await {
                Ok(()) => {
                    tracing::info!("Scanning for fitness devices");
                    controller.set_platform_scanning(true);
                }
                Err(e) => tracing::error!("Failed to start scan: {}", e),
            },
            ScanAction::Stop => {
                if let Err(e) = self.platform.stop_scan().await {
                    tracing::debug!("Stopping scan reported: {}", e);
                }
                tracing::info!("Scanning stopped");
                controller.set_platform_scanning(false);
            }
            ScanAction::None => {}
        }
        self.publish(controller);
    }

    fn accepts(&self, advertisement: &Advertisement) -> bool {
        self.config.services.is_empty()
            || advertisement
                .services
                .iter()
                .any(|s| self.config.services.contains(s))
    }

    async fn handle_event(&self, event: AdapterEvent) {
        let mut controller = self.controller.lock().await;
        match event {
            AdapterEvent::StateChanged(state) => {
                tracing::info!("Bluetooth adapter state: {:?}", state);
                if controller.set_adapter_state(state) {
                    tracing::info!("Adapter unavailable, forgetting discovered devices");
                }
                if state != AdapterState::On {
                    // The platform halts scanning by itself when the radio goes away.
                    controller.set_platform_scanning(false);
                }
                self.apply(&mut controller).await;
            }
            AdapterEvent::PermissionChanged(permission) => {
                tracing::info!("Bluetooth permission: {:?}", permission);
                controller.set_permission(permission);
                self.apply(&mut controller).await;
            }
            AdapterEvent::LocationServiceChanged(enabled) => {
                tracing::info!("Location service enabled: {}", enabled);
                controller.set_location_enabled(enabled);
                self.apply(&mut controller).await;
            }
            AdapterEvent::Advertisement(advertisement) => {
                // Late callbacks after a stop or an adapter loss.
                if !controller.is_scanning() || !self.accepts(&advertisement) {
                    return;
                }
                if controller.upsert(&advertisement, Instant::now()) {
                    tracing::debug!(
                        "Discovered {} ({})",
                        advertisement.name.as_deref().unwrap_or("unnamed"),
                        advertisement.id
                    );
                }
                self.devices_tx.send_replace(controller.devices());
            }
        }
    }

    async fn sweep(&self) {
        let mut controller = self.controller.lock().await;
        let expired = controller.sweep(Instant::now());
        if !expired.is_empty() {
            tracing::debug!("Expired devices: {:?}", expired);
            self.devices_tx.send_replace(controller.devices());
        }
    }
}

/// Scanner over a BLE platform.
pub struct Scanner<P: BlePlatform> {
    shared: Arc<ScannerShared<P>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: BlePlatform> Scanner<P> {
    /// Create a scanner. Call [`Scanner::start`] before use.
    pub fn new(platform: Arc<P>, config: ScannerConfig) -> Self {
        let controller = ScanController::new(config.expiry);
        let (bluetooth_tx, _) = watch::channel(controller.bluetooth());
        let (devices_tx, _) = watch::channel(Vec::new());
        let (scanning_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(ScannerShared {
                platform,
                config,
                controller: Mutex::new(controller),
                bluetooth_tx,
                devices_tx,
                scanning_tx,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Read the initial Bluetooth state and start tracking adapter events.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let shared = &self.shared;
        {
            let mut controller = shared.controller.lock().await;
            controller.set_adapter_state(shared.platform.adapter_state().await);
            controller.set_permission(shared.platform.check_permission().await);
            controller.set_location_enabled(shared.platform.location_service_enabled().await);
            shared.publish(&controller);
        }

        let events_shared = Arc::clone(shared);
        let mut events = shared.platform.adapter_events();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                events_shared.handle_event(event).await;
            }
            tracing::debug!("Adapter event stream ended");
        }));

        let sweep_shared = Arc::clone(shared);
        let period = shared.config.sweep_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sweep_shared.sweep().await;
            }
        }));
    }

    /// Ask for scanning. Prompts for permission when it was never asked or
    /// was denied without the "don't ask again" flag.
    pub async fn start_scan(&self) -> ScanToken {
        let permission = self.shared.controller.lock().await.bluetooth().permission;
        if matches!(
            permission,
            PermissionStatus::NotDetermined | PermissionStatus::Denied
        ) {
            let granted = self.shared.platform.request_permission().await;
            tracing::info!("Permission request answered: {:?}", granted);
            self.shared.controller.lock().await.set_permission(granted);
        }

        let mut controller = self.shared.controller.lock().await;
        let token = controller.acquire();
        tracing::debug!("Scan requested ({} outstanding)", controller.outstanding());
        self.shared.apply(&mut controller).await;
        token
    }

    /// Give a scan request back. Releasing an unknown token changes nothing.
    pub async fn stop_scan(&self, token: ScanToken) {
        let mut controller = self.shared.controller.lock().await;
        if !controller.release(token) {
            tracing::debug!("Ignoring unknown scan token {:?}", token);
            return;
        }
        self.shared.apply(&mut controller).await;
    }

    /// App moved to the foreground or background.
    pub async fn set_foreground(&self, foreground: bool) {
        let mut controller = self.shared.controller.lock().await;
        controller.set_foreground(foreground);
        self.shared.apply(&mut controller).await;
    }

    /// Current Bluetooth preconditions.
    pub fn bluetooth_state(&self) -> BluetoothState {
        *self.shared.bluetooth_tx.borrow()
    }

    /// Observe Bluetooth preconditions.
    pub fn subscribe_bluetooth_state(&self) -> watch::Receiver<BluetoothState> {
        self.shared.bluetooth_tx.subscribe()
    }

    /// Devices currently visible.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.shared.devices_tx.borrow().clone()
    }

    /// Observe the visible device list.
    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.shared.devices_tx.subscribe()
    }

    /// Whether the platform scan is running.
    pub fn is_scanning(&self) -> bool {
        *self.shared.scanning_tx.borrow()
    }

    /// Observe the platform scan state.
    pub fn subscribe_scanning(&self) -> watch::Receiver<bool> {
        self.shared.scanning_tx.subscribe()
    }

    /// Stop background work and the platform scan.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let mut controller = self.shared.controller.lock().await;
        if controller.is_scanning() {
            if let Err(e) = self.shared.platform.stop_scan().await {
                tracing::debug!("Stopping scan reported: {}", e);
            }
            controller.set_platform_scanning(false);
            self.shared.publish(&controller);
        }
    }
}

impl<P: BlePlatform> Drop for Scanner<P> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
