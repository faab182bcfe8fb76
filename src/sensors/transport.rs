//! Per-device BLE transport.
//!
//! Owns one device link: connection state, notification decoding into
//! per-metric reading streams, and the Control Point command path through a
//! [`CommandQueue`].

use crate::sensors::command_queue::{CommandQueue, QueuePoll};
use crate::sensors::ftms::{
    clamp_target_power, parse_control_point_response, parse_csc_measurement,
    parse_cycling_power_measurement, parse_fitness_machine_features,
    parse_heart_rate_measurement, parse_indoor_bike_data, ControlCommand, ControlPointResponse,
    FitnessMachineFeatures, RevolutionTracker, CSC_MEASUREMENT_UUID,
    CYCLING_POWER_MEASUREMENT_UUID, FTMS_CONTROL_POINT_UUID, FTMS_FEATURE_UUID,
    HEART_RATE_MEASUREMENT_UUID, INDOOR_BIKE_DATA_UUID, MEASUREMENT_CHARACTERISTICS,
};
use crate::sensors::platform::{BlePlatform, Notification};
use crate::sensors::types::{ConnectionState, Metric, Reading, SensorError};
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

/// Wheel circumference used to turn CSC wheel revolutions into speed (700x25c).
const WHEEL_CIRCUMFERENCE_M: f32 = 2.105;

/// Transport timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportConfig {
    /// Limit for connect and service discovery
    pub connect_timeout: Duration,
    /// Limit for characteristic reads
    pub read_timeout: Duration,
    /// Limit for a single characteristic write
    pub write_timeout: Duration,
    /// Minimum spacing between Control Point writes
    pub debounce: Duration,
    /// How long to wait for a Control Point response
    pub ack_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            debounce: Duration::from_millis(250),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// One broadcast channel per metric.
#[derive(Debug, Clone)]
pub struct MetricStreams {
    power: broadcast::Sender<Reading>,
    cadence: broadcast::Sender<Reading>,
    heart_rate: broadcast::Sender<Reading>,
    speed: broadcast::Sender<Reading>,
}

impl Default for MetricStreams {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStreams {
    /// Create the four channels.
    pub fn new() -> Self {
        Self {
            power: broadcast::channel(64).0,
            cadence: broadcast::channel(64).0,
            heart_rate: broadcast::channel(64).0,
            speed: broadcast::channel(64).0,
        }
    }

    /// Sender for a metric.
    pub fn sender(&self, metric: Metric) -> &broadcast::Sender<Reading> {
        match metric {
            Metric::Power => &self.power,
            Metric::Cadence => &self.cadence,
            Metric::HeartRate => &self.heart_rate,
            Metric::Speed => &self.speed,
        }
    }

    /// Subscribe to a metric.
    pub fn subscribe(&self, metric: Metric) -> broadcast::Receiver<Reading> {
        self.sender(metric).subscribe()
    }

    /// Publish a reading; dropped when nobody listens.
    pub fn publish(&self, reading: Reading) {
        let _ = self.sender(reading.metric).send(reading);
    }
}

/// Notification decoder with the revolution state derived rates need.
struct MeasurementDecoder {
    power_crank: RevolutionTracker,
    csc_crank: RevolutionTracker,
    csc_wheel: RevolutionTracker,
}

impl MeasurementDecoder {
    fn new() -> Self {
        Self {
            power_crank: RevolutionTracker::crank(),
            csc_crank: RevolutionTracker::crank(),
            csc_wheel: RevolutionTracker::wheel(1024.0),
        }
    }

    fn decode(&mut self, notification: &Notification) -> Vec<Reading> {
        let mut readings = Vec::new();
        let value = &notification.value;

        match notification.characteristic {
            uuid if uuid == INDOOR_BIKE_DATA_UUID => {
                if let Some(data) = parse_indoor_bike_data(value) {
                    if let Some(power) = data.power_watts {
                        readings.push(Reading::now(Metric::Power, f32::from(power)));
                    }
                    if let Some(cadence) = data.cadence_rpm {
                        readings.push(Reading::now(Metric::Cadence, cadence));
                    }
                    if let Some(speed) = data.speed_kmh {
                        readings.push(Reading::now(Metric::Speed, speed));
                    }
                }
            }
            uuid if uuid == CYCLING_POWER_MEASUREMENT_UUID => {
                if let Some(data) = parse_cycling_power_measurement(value) {
                    readings.push(Reading::now(Metric::Power, f32::from(data.power_watts)));
                    if let Some((revs, time)) = data.crank {
                        if let Some(rpm) = self.power_crank.update(u32::from(revs), time) {
                            readings.push(Reading::now(Metric::Cadence, rpm));
                        }
                    }
                }
            }
            uuid if uuid == CSC_MEASUREMENT_UUID => {
                if let Some(data) = parse_csc_measurement(value) {
                    if let Some((revs, time)) = data.crank {
                        if let Some(rpm) = self.csc_crank.update(u32::from(revs), time) {
                            readings.push(Reading::now(Metric::Cadence, rpm));
                        }
                    }
                    if let Some((revs, time)) = data.wheel {
                        if let Some(rpm) = self.csc_wheel.update(revs, time) {
                            let kmh = rpm * WHEEL_CIRCUMFERENCE_M * 60.0 / 1000.0;
                            readings.push(Reading::now(Metric::Speed, kmh));
                        }
                    }
                }
            }
            uuid if uuid == HEART_RATE_MEASUREMENT_UUID => {
                if let Some(data) = parse_heart_rate_measurement(value) {
                    readings.push(Reading::now(Metric::HeartRate, f32::from(data.heart_rate_bpm)));
                }
            }
            other => tracing::trace!("Ignoring notification from {}", other),
        }

        readings
    }
}

/// Owns a single device link.
pub struct Transport<P: BlePlatform> {
    platform: Arc<P>,
    device_id: String,
    config: TransportConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    streams: MetricStreams,
    responses: broadcast::Sender<ControlPointResponse>,
    queue: Arc<Mutex<CommandQueue>>,
    wake: Arc<Notify>,
    features: watch::Sender<Option<FitnessMachineFeatures>>,
    has_control_point: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: BlePlatform> Transport<P> {
    /// Create a disconnected transport.
    pub fn new(platform: Arc<P>, device_id: &str, config: TransportConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (responses, _) = broadcast::channel(16);
        let (features, _) = watch::channel(None);

        Self {
            platform,
            device_id: device_id.to_string(),
            config,
            state_tx: Arc::new(state_tx),
            streams: MetricStreams::new(),
            responses,
            queue: Arc::new(Mutex::new(CommandQueue::new(
                config.debounce,
                config.ack_timeout,
            ))),
            wake: Arc::new(Notify::new()),
            features,
            has_control_point: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Platform identifier of the device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Readings for one metric.
    pub fn subscribe(&self, metric: Metric) -> broadcast::Receiver<Reading> {
        self.streams.subscribe(metric)
    }

    /// Control Point responses as they arrive.
    pub fn subscribe_responses(&self) -> broadcast::Receiver<ControlPointResponse> {
        self.responses.subscribe()
    }

    /// Fitness Machine Feature value read on connect.
    pub fn features(&self) -> Option<FitnessMachineFeatures> {
        *self.features.borrow()
    }

    /// Whether the device exposes an FTMS Control Point.
    pub fn has_control_point(&self) -> bool {
        self.has_control_point.load(Ordering::SeqCst)
    }

    /// Connect, discover, subscribe and start the background tasks.
    ///
    /// Connecting an already connected transport is a no-op.
    pub async fn connect(&self) -> Result<(), SensorError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        tracing::info!("Connecting to {}", self.device_id);
        self.state_tx.send_replace(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                self.state_tx.send_replace(ConnectionState::Connected);
                tracing::info!("Connected to {}", self.device_id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", self.device_id, e);
                self.state_tx.send_replace(ConnectionState::Error);
                self.stop_tasks().await;
                if let Err(e) = self.platform.disconnect(&self.device_id).await {
                    tracing::debug!("Cleanup disconnect failed: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(), SensorError> {
        let limit = self.config.connect_timeout;

        timeout(limit, self.platform.connect(&self.device_id))
            .await
            .map_err(|_| SensorError::ConnectionTimeout(limit))??;

        let characteristics = timeout(limit, self.platform.discover_characteristics(&self.device_id))
            .await
            .map_err(|_| SensorError::ConnectionTimeout(limit))??;

        // Take the stream before enabling notifications so nothing is missed.
        let notifications = self.platform.notifications(&self.device_id).await?;

        for uuid in MEASUREMENT_CHARACTERISTICS {
            if characteristics.contains(&uuid) {
                self.platform.subscribe(&self.device_id, uuid).await?;
                tracing::debug!("Subscribed to {} on {}", uuid, self.device_id);
            }
        }

        let has_control_point = characteristics.contains(&FTMS_CONTROL_POINT_UUID);
        if has_control_point {
            self.platform
                .subscribe(&self.device_id, FTMS_CONTROL_POINT_UUID)
                .await?;
        }
        self.has_control_point
            .store(has_control_point, Ordering::SeqCst);

        if characteristics.contains(&FTMS_FEATURE_UUID) {
            self.read_features().await;
        }

        // Tasks left over from a link that dropped on its own.
        self.stop_tasks().await;
        self.queue.lock().await.reset(SensorError::NotConnected);
        self.spawn_tasks(notifications).await;
        Ok(())
    }

    async fn read_features(&self) {
        let read = timeout(
            self.config.read_timeout,
            self.platform.read(&self.device_id, FTMS_FEATURE_UUID),
        )
        .await;

        match read {
            Ok(Ok(value)) => match parse_fitness_machine_features(&value) {
                Ok(features) => {
                    tracing::debug!(
                        "{} features: power target {}",
                        self.device_id,
                        features.supports_power_target()
                    );
                    self.features.send_replace(Some(features));
                }
                Err(e) => tracing::warn!("Bad feature value from {}: {}", self.device_id, e),
            },
            Ok(Err(e)) => tracing::warn!("Failed to read features from {}: {}", self.device_id, e),
            Err(_) => tracing::warn!(
                "Feature read from {} timed out after {:?}",
                self.device_id,
                self.config.read_timeout
            ),
        }
    }

    async fn spawn_tasks(&self, notifications: BoxStream<'static, Notification>) {
        let pump = tokio::spawn(pump_notifications(
            notifications,
            self.device_id.clone(),
            self.streams.clone(),
            self.responses.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.wake),
            Arc::clone(&self.state_tx),
        ));

        let driver = tokio::spawn(drive_commands(
            Arc::clone(&self.platform),
            self.device_id.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.wake),
            self.config.write_timeout,
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.push(pump);
        tasks.push(driver);
    }

    async fn stop_tasks(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    /// Tear the link down. Pending commands fail with `NotConnected`.
    pub async fn disconnect(&self) -> Result<(), SensorError> {
        tracing::info!("Disconnecting from {}", self.device_id);
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.stop_tasks().await;
        self.queue.lock().await.reset(SensorError::NotConnected);
        self.platform.disconnect(&self.device_id).await
    }

    /// Queue a Control Point command and wait for the trainer's response.
    pub async fn send_command(&self, command: ControlCommand) -> Result<(), SensorError> {
        if self.state() != ConnectionState::Connected {
            return Err(SensorError::NotConnected);
        }
        if !self.has_control_point() {
            return Err(SensorError::Unsupported);
        }

        let (tx, rx) = oneshot::channel();
        self.queue.lock().await.enqueue(command, Some(tx));
        self.wake.notify_one();

        rx.await.unwrap_or(Err(SensorError::NotConnected))
    }

    /// Request control of the trainer.
    pub async fn request_control(&self) -> Result<(), SensorError> {
        self.send_command(ControlCommand::RequestControl).await
    }

    /// Set the ERG target, clamped into the accepted range.
    pub async fn set_target_power(&self, watts: i32) -> Result<(), SensorError> {
        self.send_command(ControlCommand::SetTargetPower(clamp_target_power(watts)))
            .await
    }
}

impl<P: BlePlatform> Drop for Transport<P> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn pump_notifications(
    mut notifications: BoxStream<'static, Notification>,
    device_id: String,
    streams: MetricStreams,
    responses: broadcast::Sender<ControlPointResponse>,
    queue: Arc<Mutex<CommandQueue>>,
    wake: Arc<Notify>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
) {
    let mut decoder = MeasurementDecoder::new();

    while let Some(notification) = notifications.next().await {
        if notification.characteristic == FTMS_CONTROL_POINT_UUID {
            match parse_control_point_response(&notification.value) {
                Ok(response) => {
                    tracing::debug!(
                        "{} answered opcode 0x{:02X}: {}",
                        device_id,
                        response.request_opcode,
                        response.result
                    );
                    queue.lock().await.on_response(response);
                    wake.notify_one();
                    let _ = responses.send(response);
                }
                Err(e) => tracing::warn!("Dropping control point frame from {}: {}", device_id, e),
            }
            continue;
        }

        for reading in decoder.decode(&notification) {
            streams.publish(reading);
        }
    }

    let was_connected = *state_tx.borrow() == ConnectionState::Connected;
    if was_connected {
        tracing::warn!("Link to {} lost", device_id);
        state_tx.send_replace(ConnectionState::Disconnected);
        queue.lock().await.reset(SensorError::NotConnected);
    }
}

async fn drive_commands<P: BlePlatform>(
    platform: Arc<P>,
    device_id: String,
    queue: Arc<Mutex<CommandQueue>>,
    wake: Arc<Notify>,
    write_timeout: Duration,
) {
    loop {
        let next = queue.lock().await.poll(Instant::now());

        match next {
            QueuePoll::Send(command) => {
                let bytes = command.encode();
                tracing::debug!("Writing {:?} to {}: {:02X?}", command, device_id, bytes);

                let written = match timeout(
                    write_timeout,
                    platform.write(&device_id, FTMS_CONTROL_POINT_UUID, &bytes),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SensorError::WriteFailed(format!(
                        "timed out after {:?}",
                        write_timeout
                    ))),
                };

                if let Err(e) = written {
                    tracing::warn!("Control point write to {} failed: {}", device_id, e);
                    queue.lock().await.on_write_failed(e);
                }
            }
            QueuePoll::WaitUntil(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = wake.notified() => {}
                }
            }
            QueuePoll::Idle => wake.notified().await,
        }
    }
}
