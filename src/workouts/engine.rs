//! Workout playback engine.
//!
//! Owns the workout timeline. Elapsed time is always derived from clock
//! readings:
//!
//! ```text
//! elapsed = (now - started_at) - paused_total - current_pause
//! ```
//!
//! so a tick after an arbitrarily long gap lands on the right block, possibly
//! several blocks further on. `paused_total` is signed: skipping and restoring
//! move elapsed time forward by making it negative.
//!
//! Each tick advances the block index, fires due events once, and publishes
//! the target through a [`TargetHandle`].

use crate::workouts::clock::Clock;
use crate::workouts::sync::{ErgCommand, TargetHandle};
use crate::workouts::types::{
    PlaybackEvent, PlaybackProgress, PlaybackStatus, WorkoutBlock, WorkoutError, WorkoutPlan,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Lowest accepted intensity scale.
pub const MIN_POWER_SCALE: f32 = 0.1;
/// Highest accepted intensity scale.
pub const MAX_POWER_SCALE: f32 = 5.0;

/// Plays a [`WorkoutPlan`] against a clock.
pub struct WorkoutPlayer {
    plan: WorkoutPlan,
    ftp: u16,
    scale: f32,
    blocks: Vec<WorkoutBlock>,
    /// Start offset of each flattened block
    starts: Vec<u64>,
    clock: Arc<dyn Clock>,
    status: PlaybackStatus,
    index: usize,
    started_at: Option<Instant>,
    paused_total_ms: i64,
    paused_at: Option<Instant>,
    final_elapsed_ms: Option<u64>,
    triggered: HashSet<String>,
    target: Option<TargetHandle>,
    events: broadcast::Sender<PlaybackEvent>,
}

fn block_starts(blocks: &[WorkoutBlock]) -> Vec<u64> {
    blocks
        .iter()
        .scan(0u64, |acc, block| {
            let start = *acc;
            *acc += block.duration_ms();
            Some(start)
        })
        .collect()
}

impl WorkoutPlayer {
    /// Load a plan for playback.
    pub fn new(plan: WorkoutPlan, ftp: u16, clock: Arc<dyn Clock>) -> Result<Self, WorkoutError> {
        plan.validate()?;
        let blocks = plan.flatten(1.0);
        let starts = block_starts(&blocks);
        let (events, _) = broadcast::channel(64);

        tracing::info!(
            "Workout loaded: {} ({} blocks, {} s)",
            plan.name,
            blocks.len(),
            plan.total_duration_ms() / 1000
        );

        Ok(Self {
            plan,
            ftp,
            scale: 1.0,
            blocks,
            starts,
            clock,
            status: PlaybackStatus::NotStarted,
            index: 0,
            started_at: None,
            paused_total_ms: 0,
            paused_at: None,
            final_elapsed_ms: None,
            triggered: HashSet::new(),
            target: None,
            events,
        })
    }

    /// Publish targets through `target`.
    pub fn with_target(mut self, target: TargetHandle) -> Self {
        self.target = Some(target);
        self
    }

    pub fn plan(&self) -> &WorkoutPlan {
        &self.plan
    }

    pub fn ftp(&self) -> u16 {
        self.ftp
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    /// Index into the flattened block list.
    pub fn current_block_index(&self) -> usize {
        self.index
    }

    /// Flattened blocks at the current scale.
    pub fn blocks(&self) -> &[WorkoutBlock] {
        &self.blocks
    }

    pub fn power_scale(&self) -> f32 {
        self.scale
    }

    pub fn is_complete(&self) -> bool {
        self.status == PlaybackStatus::Complete
    }

    /// Playback events as they happen.
    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    fn total_ms(&self) -> u64 {
        self.blocks.iter().map(WorkoutBlock::duration_ms).sum()
    }

    fn block_end(&self, index: usize) -> u64 {
        match (self.starts.get(index), self.blocks.get(index)) {
            (Some(start), Some(block)) => start + block.duration_ms(),
            _ => self.total_ms(),
        }
    }

    fn elapsed_at(&self, now: Instant) -> u64 {
        if let Some(frozen) = self.final_elapsed_ms {
            return frozen;
        }
        let Some(started_at) = self.started_at else {
            return 0;
        };

        let wall = now.saturating_duration_since(started_at).as_millis() as i64;
        let current_pause = self
            .paused_at
            .map(|p| now.saturating_duration_since(p).as_millis() as i64)
            .unwrap_or(0);

        (wall - self.paused_total_ms - current_pause).max(0) as u64
    }

    /// Elapsed workout time now.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_at(self.clock.now())
    }

    /// Anchor the timeline, paused, so bookkeeping can move before `start()`.
    fn ensure_anchor(&mut self, now: Instant) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
            self.paused_at = Some(now);
        }
    }

    fn emit(&self, event: PlaybackEvent, fired: &mut Vec<PlaybackEvent>) {
        let _ = self.events.send(event.clone());
        fired.push(event);
    }

    fn target_at(&self, elapsed_ms: u64) -> Option<(u16, Option<u16>)> {
        let block = self.blocks.get(self.index)?;
        let start = self.starts.get(self.index).copied().unwrap_or(0);
        let local = elapsed_ms.saturating_sub(start);
        Some((block.power_watts_at(local, self.ftp), block.cadence_at(local)))
    }

    fn push_target(&self, elapsed_ms: u64) {
        let (Some(target), Some((watts, _))) = (&self.target, self.target_at(elapsed_ms)) else {
            return;
        };
        target.set(ErgCommand::new(watts));
    }

    /// Start or resume.
    pub fn start(&mut self) -> Result<(), WorkoutError> {
        match self.status {
            PlaybackStatus::Complete => {
                return Err(WorkoutError::InvalidState("workout is complete".to_string()))
            }
            PlaybackStatus::Running => return Ok(()),
            PlaybackStatus::NotStarted | PlaybackStatus::Paused => {}
        }

        let now = self.clock.now();
        match (self.started_at, self.paused_at.take()) {
            (None, _) => self.started_at = Some(now),
            (Some(_), Some(paused_at)) => {
                self.paused_total_ms += now.saturating_duration_since(paused_at).as_millis() as i64;
            }
            (Some(_), None) => {}
        }

        let resumed = self.status == PlaybackStatus::Paused;
        self.status = PlaybackStatus::Running;
        tracing::info!(
            "Workout {} at {} ms",
            if resumed { "resumed" } else { "started" },
            self.elapsed_at(now)
        );
        self.push_target(self.elapsed_at(now));
        Ok(())
    }

    /// Pause the clock.
    pub fn pause(&mut self) -> Result<(), WorkoutError> {
        if self.status != PlaybackStatus::Running {
            return Err(WorkoutError::InvalidState("workout not running".to_string()));
        }
        self.paused_at = Some(self.clock.now());
        self.status = PlaybackStatus::Paused;
        tracing::info!("Workout paused");
        Ok(())
    }

    /// Start when paused, pause when running.
    pub fn toggle(&mut self) -> Result<(), WorkoutError> {
        if self.status == PlaybackStatus::Running {
            self.pause()
        } else {
            self.start()
        }
    }

    /// Recompute position, fire due events, publish the target.
    ///
    /// Returns what happened during this tick.
    pub fn tick(&mut self) -> Vec<PlaybackEvent> {
        let mut fired = Vec::new();
        if self.status != PlaybackStatus::Running {
            return fired;
        }

        let elapsed = self.elapsed_at(self.clock.now());
        self.fire_due_events(elapsed, &mut fired);

        let before = self.index;
        while self.index < self.blocks.len() && elapsed > self.block_end(self.index) {
            self.index += 1;
        }

        if self.index >= self.blocks.len() {
            self.finish(self.total_ms().min(elapsed), &mut fired);
            return fired;
        }

        if self.index != before {
            tracing::debug!("Block {} -> {}", before, self.index);
            self.emit(PlaybackEvent::BlockChanged { index: self.index }, &mut fired);
        }
        self.push_target(elapsed);
        fired
    }

    fn fire_due_events(&mut self, elapsed: u64, fired: &mut Vec<PlaybackEvent>) {
        let mut due: Vec<_> = self
            .plan
            .events
            .iter()
            .filter(|e| e.at_ms <= elapsed && !self.triggered.contains(&e.id))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.at_ms);

        for event in due {
            self.triggered.insert(event.id.clone());
            tracing::debug!("Event {} at {} ms", event.id, event.at_ms);
            self.emit(PlaybackEvent::Event(event), fired);
        }
    }

    fn finish(&mut self, elapsed: u64, fired: &mut Vec<PlaybackEvent>) {
        self.final_elapsed_ms = Some(elapsed);
        self.status = PlaybackStatus::Complete;
        self.index = self.index.min(self.blocks.len());
        tracing::info!("Workout complete at {} ms", elapsed);
        self.emit(PlaybackEvent::Completed { elapsed_ms: elapsed }, fired);
    }

    /// Jump to the end of the current block and move to the next one.
    ///
    /// Events already due fire first; events inside the skipped part are
    /// marked as fired without firing.
    pub fn skip(&mut self) -> Result<Vec<PlaybackEvent>, WorkoutError> {
        if self.status == PlaybackStatus::Complete {
            return Err(WorkoutError::InvalidState("workout is complete".to_string()));
        }

        let now = self.clock.now();
        self.ensure_anchor(now);

        let mut fired = Vec::new();
        let elapsed = self.elapsed_at(now);
        self.fire_due_events(elapsed, &mut fired);

        let end = self.block_end(self.index);
        if end > elapsed {
            self.paused_total_ms -= (end - elapsed) as i64;
        }

        let skipped: Vec<String> = self
            .plan
            .events
            .iter()
            .filter(|e| e.at_ms < end)
            .map(|e| e.id.clone())
            .collect();
        self.triggered.extend(skipped);

        self.index += 1;
        tracing::info!("Skipped to block {}", self.index);

        if self.index >= self.blocks.len() {
            self.finish(end, &mut fired);
            return Ok(fired);
        }

        self.emit(PlaybackEvent::BlockChanged { index: self.index }, &mut fired);
        if self.status == PlaybackStatus::Running {
            self.push_target(end);
        }
        Ok(fired)
    }

    /// Scale every block's intensity; position is kept.
    pub fn set_power_scale_factor(&mut self, factor: f32) {
        let factor = if factor.is_finite() {
            factor.clamp(MIN_POWER_SCALE, MAX_POWER_SCALE)
        } else {
            1.0
        };
        self.scale = factor;
        self.blocks = self.plan.flatten(factor);
        self.starts = block_starts(&self.blocks);
        tracing::info!("Intensity scaled to {:.0}%", factor * 100.0);

        if self.status == PlaybackStatus::Running {
            self.push_target(self.elapsed_ms());
        }
    }

    /// End now, keeping the elapsed time.
    pub fn complete_early(&mut self) -> Vec<PlaybackEvent> {
        let mut fired = Vec::new();
        if self.status != PlaybackStatus::Complete {
            let elapsed = self.elapsed_ms();
            self.finish(elapsed, &mut fired);
        }
        fired
    }

    /// Rebuild the timeline after a crash. Stays paused until [`Self::start`].
    pub fn restore_state(&mut self, elapsed_ms: u64, block_index: usize) {
        let now = self.clock.now();
        self.index = block_index.min(self.blocks.len().saturating_sub(1));
        self.started_at = Some(now);
        self.paused_at = Some(now);
        self.paused_total_ms = -(elapsed_ms as i64);
        self.final_elapsed_ms = None;
        self.status = PlaybackStatus::Paused;

        self.triggered = self
            .plan
            .events
            .iter()
            .filter(|e| e.at_ms < elapsed_ms)
            .map(|e| e.id.clone())
            .collect();

        tracing::info!(
            "Workout restored at {} ms, block {}",
            elapsed_ms,
            self.index
        );
    }

    /// Snapshot of the current position and targets.
    pub fn progress(&self) -> PlaybackProgress {
        let elapsed = self.elapsed_ms();
        let total = self.total_ms();
        let current = self.blocks.get(self.index);
        let start = self.starts.get(self.index).copied().unwrap_or(total);
        let block_elapsed = elapsed.saturating_sub(start);
        let target = if self.is_complete() {
            None
        } else {
            self.target_at(elapsed)
        };

        PlaybackProgress {
            status: self.status,
            block_index: self.index,
            block_count: self.blocks.len(),
            elapsed_ms: elapsed,
            block_elapsed_ms: block_elapsed,
            block_remaining_ms: current
                .map(|b| b.duration_ms().saturating_sub(block_elapsed))
                .unwrap_or(0),
            total_remaining_ms: total.saturating_sub(elapsed),
            target_power_watts: target.map(|(watts, _)| watts),
            target_cadence_rpm: target.and_then(|(_, cadence)| cadence),
            current_block: current.cloned(),
            next_block: self.blocks.get(self.index + 1).cloned(),
            power_scale: self.scale,
        }
    }
}
