//! ERG target synchronization.
//!
//! Watches the current target and pushes each new value to the primary
//! trainer, retrying transient failures with a linearly growing delay. When
//! the trainer needs it, the last acknowledged target is re-sent on a timer so
//! the trainer does not drop back to free ride.

use crate::sensors::device::FitnessDevice;
use crate::sensors::manager::DeviceManager;
use crate::sensors::platform::BlePlatform;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

/// A power target and when it was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErgCommand {
    pub target_watts: u16,
    pub timestamp: DateTime<Utc>,
}

impl ErgCommand {
    pub fn new(target_watts: u16) -> Self {
        Self {
            target_watts,
            timestamp: Utc::now(),
        }
    }
}

/// Retry and refresh policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Delay before retry `n` is `n * retry_base_delay`
    pub retry_base_delay: Duration,
    /// Overrides the trainer's own refresh interval
    pub refresh_interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            refresh_interval: None,
        }
    }
}

/// What happened to a target.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Trainer acknowledged the target
    Synced(ErgCommand),
    /// Attempt failed, another one is scheduled
    Retrying { attempt: u32, max: u32, error: String },
    /// Gave up on the target
    Failed(String),
    /// Last target re-sent by the refresh timer
    Refreshed(ErgCommand),
}

/// Write side of the current target, handed to whoever computes targets.
#[derive(Debug, Clone)]
pub struct TargetHandle {
    tx: Arc<watch::Sender<Option<ErgCommand>>>,
}

impl TargetHandle {
    /// Publish a target. Repeating the current wattage is not a change.
    pub fn set(&self, command: ErgCommand) {
        self.tx.send_if_modified(|current| {
            if current.map(|c| c.target_watts) == Some(command.target_watts) {
                return false;
            }
            *current = Some(command);
            true
        });
    }

    /// Current target.
    pub fn current(&self) -> Option<ErgCommand> {
        *self.tx.borrow()
    }
}

struct SyncShared<P: BlePlatform> {
    manager: Arc<DeviceManager<P>>,
    config: SyncConfig,
    active: AtomicBool,
    last_command: watch::Sender<Option<ErgCommand>>,
    last_sync_time: watch::Sender<Option<DateTime<Utc>>>,
    sync_error: watch::Sender<Option<String>>,
    events: broadcast::Sender<SyncEvent>,
}

impl<P: BlePlatform> SyncShared<P> {
    async fn erg_trainer(&self) -> Result<Arc<FitnessDevice<P>>, String> {
        let trainer = self
            .manager
            .primary_trainer()
            .await
            .ok_or_else(|| "No trainer assigned".to_string())?;
        if !trainer.supports_erg() {
            return Err("Trainer does not support ERG mode".to_string());
        }
        Ok(trainer)
    }

    fn succeeded(&self, command: ErgCommand) {
        tracing::debug!("ERG target {}W acknowledged", command.target_watts);
        self.last_command.send_replace(Some(command));
        self.last_sync_time.send_replace(Some(Utc::now()));
        self.sync_error.send_replace(None);
        let _ = self.events.send(SyncEvent::Synced(command));
    }

    fn failed(&self, message: String) {
        tracing::error!("ERG sync failed: {}", message);
        self.sync_error.send_replace(Some(message.clone()));
        let _ = self.events.send(SyncEvent::Failed(message));
    }

    /// Push one target, retrying transient failures.
    async fn push(&self, command: ErgCommand) {
        let max = self.config.max_retries;
        let mut attempt = 0;

        loop {
            let trainer = match self.erg_trainer().await {
                Ok(trainer) => trainer,
                Err(message) => {
                    self.failed(message);
                    return;
                }
            };

            let error = match trainer.set_target_power(command.target_watts).await {
                Ok(()) => {
                    self.succeeded(command);
                    return;
                }
                Err(e) if !e.is_transient() => {
                    self.failed(e.to_string());
                    return;
                }
                Err(e) => e,
            };

            if attempt >= max {
                self.failed(format!("Failed after {} retries: {}", max, error));
                return;
            }

            attempt += 1;
            tracing::warn!(
                "Setting {}W failed ({}), retry {}/{}",
                command.target_watts,
                error,
                attempt,
                max
            );
            self.sync_error
                .send_replace(Some(format!("Retry {}/{}", attempt, max)));
            let _ = self.events.send(SyncEvent::Retrying {
                attempt,
                max,
                error: error.to_string(),
            });

            tokio::time::sleep(self.config.retry_base_delay * attempt).await;
            if !self.active.load(Ordering::SeqCst) {
                tracing::debug!("Sync stopped, abandoning retry");
                return;
            }
        }
    }

    /// Re-send the last acknowledged target once.
    async fn refresh(&self) {
        let Some(command) = *self.last_command.borrow() else {
            return;
        };
        let Ok(trainer) = self.erg_trainer().await else {
            return;
        };

        match trainer.set_target_power(command.target_watts).await {
            Ok(()) => {
                tracing::trace!("Refreshed ERG target {}W", command.target_watts);
                self.last_sync_time.send_replace(Some(Utc::now()));
                let _ = self.events.send(SyncEvent::Refreshed(command));
            }
            Err(e) => tracing::debug!("ERG refresh failed: {}", e),
        }
    }
}

/// Keeps the primary trainer on the current ERG target.
pub struct ErgSync<P: BlePlatform> {
    shared: Arc<SyncShared<P>>,
    target: Arc<watch::Sender<Option<ErgCommand>>>,
    syncing: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: BlePlatform> ErgSync<P> {
    pub fn new(manager: Arc<DeviceManager<P>>, config: SyncConfig) -> Self {
        let (target, _) = watch::channel(None);
        let (syncing, _) = watch::channel(false);
        let (last_command, _) = watch::channel(None);
        let (last_sync_time, _) = watch::channel(None);
        let (sync_error, _) = watch::channel(None);
        let (events, _) = broadcast::channel(64);

        Self {
            shared: Arc::new(SyncShared {
                manager,
                config,
                active: AtomicBool::new(false),
                last_command,
                last_sync_time,
                sync_error,
                events,
            }),
            target: Arc::new(target),
            syncing,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Handle for publishing targets.
    pub fn target_handle(&self) -> TargetHandle {
        TargetHandle {
            tx: Arc::clone(&self.target),
        }
    }

    /// Publish a target.
    pub fn set_target(&self, command: ErgCommand) {
        self.target_handle().set(command);
    }

    /// Current target, kept across stop/start.
    pub fn current_target(&self) -> Option<ErgCommand> {
        *self.target.borrow()
    }

    /// Start reacting to targets. Does nothing when already syncing.
    pub async fn start_sync(&self) {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("ERG sync started");
        self.syncing.send_replace(true);

        let mut tasks = self.tasks.lock().await;

        let shared = Arc::clone(&self.shared);
        let mut target_rx = self.target.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut next = *target_rx.borrow_and_update();
            loop {
                if let Some(command) = next.take() {
                    // A newer target replaces whatever is still being retried.
                    tokio::select! {
                        _ = shared.push(command) => {}
                        changed = target_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            next = *target_rx.borrow_and_update();
                            continue;
                        }
                    }
                }
                if target_rx.changed().await.is_err() {
                    break;
                }
                next = *target_rx.borrow_and_update();
            }
        }));

        let Some(trainer) = self.shared.manager.primary_trainer().await else {
            return;
        };
        if !trainer.requires_continuous_refresh() {
            return;
        }

        let period = self
            .shared
            .config
            .refresh_interval
            .unwrap_or_else(|| trainer.refresh_interval());
        tracing::debug!("Refreshing ERG target every {:?}", period);

        let shared = Arc::clone(&self.shared);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                shared.refresh().await;
            }
        }));
    }

    /// Stop reacting to targets and cancel pending retries and refreshes.
    /// The current target is kept.
    pub async fn stop_sync(&self) {
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.syncing.send_replace(false);
        tracing::info!("ERG sync stopped");
    }

    pub fn is_syncing(&self) -> bool {
        *self.syncing.borrow()
    }

    pub fn subscribe_syncing(&self) -> watch::Receiver<bool> {
        self.syncing.subscribe()
    }

    /// When the trainer last acknowledged a target.
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_sync_time.borrow()
    }

    pub fn subscribe_last_sync_time(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.shared.last_sync_time.subscribe()
    }

    /// Retry progress or the terminal failure; `None` once a target lands.
    pub fn sync_error(&self) -> Option<String> {
        self.shared.sync_error.borrow().clone()
    }

    pub fn subscribe_sync_error(&self) -> watch::Receiver<Option<String>> {
        self.shared.sync_error.subscribe()
    }

    /// Last target the trainer acknowledged.
    pub fn last_command(&self) -> Option<ErgCommand> {
        *self.shared.last_command.borrow()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }
}

impl<P: BlePlatform> Drop for ErgSync<P> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
