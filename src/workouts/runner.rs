//! Workout runner.
//!
//! Ties a [`WorkoutPlayer`] to the outside world: ticks it on a tokio
//! interval, lets it publish targets into [`ErgSync`], samples the aggregated
//! metric streams, and records the session through a [`SessionStore`].

use crate::sensors::manager::DeviceManager;
use crate::sensors::platform::BlePlatform;
use crate::sensors::types::{Metric, Reading};
use crate::storage::session::{
    SessionProgress, SessionStatus, SessionStore, WorkoutSample, WorkoutSession,
};
use crate::workouts::clock::Clock;
use crate::workouts::engine::WorkoutPlayer;
use crate::workouts::sync::ErgSync;
use crate::workouts::types::{
    PlaybackEvent, PlaybackProgress, PlaybackStatus, WorkoutError, WorkoutPlan,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Samples buffered before they are written out.
const SAMPLE_BATCH: usize = 10;

/// Runner timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// How often playback is advanced
    pub tick_interval: Duration,
    /// Workout time between recorded samples
    pub sample_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            sample_interval: Duration::from_secs(1),
        }
    }
}

/// Most recent value of each aggregated metric.
#[derive(Debug, Clone, Copy, Default)]
struct LatestMetrics {
    power: Option<f32>,
    cadence: Option<f32>,
    heart_rate: Option<f32>,
    speed: Option<f32>,
}

impl LatestMetrics {
    fn update(&mut self, reading: &Reading) {
        let slot = match reading.metric {
            Metric::Power => &mut self.power,
            Metric::Cadence => &mut self.cadence,
            Metric::HeartRate => &mut self.heart_rate,
            Metric::Speed => &mut self.speed,
        };
        *slot = Some(reading.value);
    }
}

fn session_progress(progress: &PlaybackProgress) -> SessionProgress {
    SessionProgress {
        current_block_index: progress.block_index,
        elapsed_ms: progress.elapsed_ms,
    }
}

struct RunnerShared<P: BlePlatform, S: SessionStore> {
    player: Mutex<WorkoutPlayer>,
    sync: Arc<ErgSync<P>>,
    manager: Arc<DeviceManager<P>>,
    store: Arc<S>,
    config: RunnerConfig,
    session_id: Mutex<Option<Uuid>>,
    latest: Mutex<LatestMetrics>,
    pending: Mutex<Vec<WorkoutSample>>,
    finished: AtomicBool,
    progress: watch::Sender<PlaybackProgress>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl<P: BlePlatform, S: SessionStore> RunnerShared<P, S> {
    /// Re-publish playback events. Returns true when the workout completed.
    fn forward(&self, fired: Vec<PlaybackEvent>) -> bool {
        let mut completed = false;
        for event in fired {
            match &event {
                PlaybackEvent::Event(e) => tracing::info!("Workout event {}: {:?}", e.id, e.kind),
                PlaybackEvent::Completed { .. } => completed = true,
                PlaybackEvent::BlockChanged { .. } => {}
            }
            let _ = self.events.send(event);
        }
        completed
    }

    async fn snapshot(&self) -> PlaybackProgress {
        let progress = self.player.lock().await.progress();
        self.progress.send_replace(progress.clone());
        progress
    }

    async fn record_sample(&self, progress: &PlaybackProgress) -> Result<(), WorkoutError> {
        let latest = *self.latest.lock().await;
        let sample = WorkoutSample {
            elapsed_ms: progress.elapsed_ms,
            timestamp: Utc::now(),
            target_watts: progress.target_power_watts,
            power_watts: latest.power,
            cadence_rpm: latest.cadence,
            heart_rate_bpm: latest.heart_rate,
            speed_kmh: latest.speed,
        };

        let full = {
            let mut pending = self.pending.lock().await;
            pending.push(sample);
            pending.len() >= SAMPLE_BATCH
        };
        if full {
            self.flush().await?;
            self.persist(SessionStatus::Active, progress).await?;
        }
        Ok(())
    }

    /// Write buffered samples.
    async fn flush(&self) -> Result<(), WorkoutError> {
        let Some(id) = *self.session_id.lock().await else {
            return Ok(());
        };
        let batch = std::mem::take(&mut *self.pending.lock().await);
        if batch.is_empty() {
            return Ok(());
        }
        tracing::trace!("Writing {} samples", batch.len());
        self.store.append_samples(id, &batch).await?;
        Ok(())
    }

    async fn persist(
        &self,
        status: SessionStatus,
        progress: &PlaybackProgress,
    ) -> Result<(), WorkoutError> {
        let Some(id) = *self.session_id.lock().await else {
            return Ok(());
        };
        self.store
            .update_session_status(id, status, session_progress(progress))
            .await?;
        Ok(())
    }

    /// Record the end of the session once.
    async fn finalize(&self, status: SessionStatus) -> Result<(), WorkoutError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sync.stop_sync().await;
        let progress = self.snapshot().await;
        self.flush().await?;
        self.persist(status, &progress).await?;
        tracing::info!(
            "Session ended ({:?}) at {} ms",
            status,
            progress.elapsed_ms
        );
        Ok(())
    }

    async fn run_ticks(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let sample_ms = self.config.sample_interval.as_millis() as u64;
        let mut next_sample_ms = 0;

        loop {
            interval.tick().await;

            let (fired, progress) = {
                let mut player = self.player.lock().await;
                let fired = player.tick();
                (fired, player.progress())
            };
            self.progress.send_replace(progress.clone());

            if self.forward(fired) {
                if let Err(e) = self.finalize(SessionStatus::Completed).await {
                    tracing::error!("Failed to record completed session: {}", e);
                }
                break;
            }

            if progress.status == PlaybackStatus::Running && progress.elapsed_ms >= next_sample_ms {
                next_sample_ms = progress.elapsed_ms + sample_ms;
                if let Err(e) = self.record_sample(&progress).await {
                    tracing::warn!("Failed to record sample: {}", e);
                }
            }
        }
    }

    async fn collect(self: Arc<Self>, metric: Metric) {
        let mut rx = self.manager.subscribe(metric);
        loop {
            match rx.recv().await {
                Ok(reading) => self.latest.lock().await.update(&reading),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("{:?} sampling lagged by {}", metric, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Plays a workout on the primary trainer and records it.
pub struct WorkoutRunner<P: BlePlatform, S: SessionStore> {
    shared: Arc<RunnerShared<P, S>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: BlePlatform, S: SessionStore> WorkoutRunner<P, S> {
    pub fn new(
        plan: WorkoutPlan,
        ftp: u16,
        clock: Arc<dyn Clock>,
        sync: Arc<ErgSync<P>>,
        manager: Arc<DeviceManager<P>>,
        store: Arc<S>,
        config: RunnerConfig,
    ) -> Result<Self, WorkoutError> {
        let player = WorkoutPlayer::new(plan, ftp, clock)?.with_target(sync.target_handle());
        let (progress, _) = watch::channel(player.progress());
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            shared: Arc::new(RunnerShared {
                player: Mutex::new(player),
                sync,
                manager,
                store,
                config,
                session_id: Mutex::new(None),
                latest: Mutex::new(LatestMetrics::default()),
                pending: Mutex::new(Vec::new()),
                finished: AtomicBool::new(false),
                progress,
                events,
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Recorded session, once started or resumed.
    pub async fn session_id(&self) -> Option<Uuid> {
        *self.shared.session_id.lock().await
    }

    /// Start or resume playback, creating the session on first start.
    pub async fn start(&self) -> Result<(), WorkoutError> {
        let shared = &self.shared;
        {
            let mut session_id = shared.session_id.lock().await;
            if session_id.is_none() {
                let (plan, ftp) = {
                    let player = shared.player.lock().await;
                    (player.plan().clone(), player.ftp())
                };
                let session = shared.store.create_session(&plan, ftp).await?;
                tracing::info!("Recording session {}", session.id);
                *session_id = Some(session.id);
            }
        }

        shared.player.lock().await.start()?;
        shared.sync.start_sync().await;
        let progress = shared.snapshot().await;
        shared.persist(SessionStatus::Active, &progress).await?;

        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            tasks.push(tokio::spawn(Arc::clone(shared).run_ticks()));
            for metric in Metric::ALL {
                tasks.push(tokio::spawn(Arc::clone(shared).collect(metric)));
            }
        }
        Ok(())
    }

    /// Pause playback and save the position.
    pub async fn pause(&self) -> Result<(), WorkoutError> {
        self.shared.player.lock().await.pause()?;
        let progress = self.shared.snapshot().await;
        self.shared.flush().await?;
        self.shared.persist(SessionStatus::Active, &progress).await
    }

    /// Move on to the next block.
    pub async fn skip(&self) -> Result<(), WorkoutError> {
        let fired = self.shared.player.lock().await.skip()?;
        self.shared.snapshot().await;
        if self.shared.forward(fired) {
            self.stop_tasks().await;
            self.shared.finalize(SessionStatus::Completed).await?;
        }
        Ok(())
    }

    /// Scale the remaining workout's intensity.
    pub async fn set_power_scale_factor(&self, factor: f32) {
        self.shared
            .player
            .lock()
            .await
            .set_power_scale_factor(factor);
        self.shared.snapshot().await;
    }

    /// End the workout now and record it as completed.
    pub async fn complete_early(&self) -> Result<(), WorkoutError> {
        self.stop_tasks().await;
        let fired = self.shared.player.lock().await.complete_early();
        self.shared.forward(fired);
        self.shared.finalize(SessionStatus::Completed).await
    }

    /// Give up on the workout.
    pub async fn abandon(&self) -> Result<(), WorkoutError> {
        self.stop_tasks().await;
        {
            let mut player = self.shared.player.lock().await;
            if player.status() == PlaybackStatus::Running {
                player.pause()?;
            }
        }
        self.shared.finalize(SessionStatus::Abandoned).await
    }

    /// Continue a session interrupted mid-workout. Playback stays paused
    /// until [`Self::start`].
    pub async fn resume(&self, session_id: Uuid) -> Result<WorkoutSession, WorkoutError> {
        let session = self.shared.store.load_session_metadata(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(WorkoutError::InvalidState(format!(
                "session {} already ended",
                session_id
            )));
        }

        {
            let mut player = self.shared.player.lock().await;
            if player.status() != PlaybackStatus::NotStarted {
                return Err(WorkoutError::InvalidState(
                    "playback already started".to_string(),
                ));
            }
            if player.plan().id != session.plan_id {
                tracing::warn!(
                    "Resuming session {} recorded for plan {}",
                    session_id,
                    session.plan_id
                );
            }
            player.restore_state(session.elapsed_ms, session.current_block_index);
        }

        *self.shared.session_id.lock().await = Some(session_id);
        self.shared.snapshot().await;
        Ok(session)
    }

    /// Latest playback snapshot.
    pub fn progress(&self) -> PlaybackProgress {
        self.shared.progress.borrow().clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<PlaybackProgress> {
        self.shared.progress.subscribe()
    }

    /// Block changes, plan events and completion.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.events.subscribe()
    }

    /// True once the session has been closed.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    async fn stop_tasks(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

impl<P: BlePlatform, S: SessionStore> Drop for WorkoutRunner<P, S> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
