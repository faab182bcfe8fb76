//! Workout types and enums.
//!
//! A [`WorkoutPlan`] is authored as a list of blocks and repeated interval
//! groups plus time-indexed events. Playback works on the flattened form:
//! repeats unrolled and every %FTP multiplied by the intensity scale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Cadence window in RPM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CadenceRange {
    /// Minimum target cadence in RPM
    pub min_rpm: u16,
    /// Maximum target cadence in RPM
    pub max_rpm: u16,
}

/// A timed block of a workout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkoutBlock {
    /// Hold one power target
    Constant {
        duration_ms: u64,
        /// Percent of FTP (75.0 = 75%)
        power_pct: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cadence_rpm: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cadence_range: Option<CadenceRange>,
    },
    /// Linear change from start to end
    Ramp {
        duration_ms: u64,
        start_pct: f32,
        end_pct: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_cadence_rpm: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_cadence_rpm: Option<u16>,
    },
}

impl WorkoutBlock {
    /// Constant block without cadence target.
    pub fn constant(duration_ms: u64, power_pct: f32) -> Self {
        WorkoutBlock::Constant {
            duration_ms,
            power_pct,
            cadence_rpm: None,
            cadence_range: None,
        }
    }

    /// Ramp block without cadence target.
    pub fn ramp(duration_ms: u64, start_pct: f32, end_pct: f32) -> Self {
        WorkoutBlock::Ramp {
            duration_ms,
            start_pct,
            end_pct,
            start_cadence_rpm: None,
            end_cadence_rpm: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            WorkoutBlock::Constant { duration_ms, .. } | WorkoutBlock::Ramp { duration_ms, .. } => {
                *duration_ms
            }
        }
    }

    /// Copy with every %FTP multiplied by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        let mut block = self.clone();
        match &mut block {
            WorkoutBlock::Constant { power_pct, .. } => *power_pct *= factor,
            WorkoutBlock::Ramp {
                start_pct, end_pct, ..
            } => {
                *start_pct *= factor;
                *end_pct *= factor;
            }
        }
        block
    }

    /// Fraction of the block done after `elapsed_ms`, clamped to [0, 1].
    pub fn progress(&self, elapsed_ms: u64) -> f32 {
        let duration = self.duration_ms();
        if duration == 0 {
            return 1.0;
        }
        (elapsed_ms as f64 / duration as f64).clamp(0.0, 1.0) as f32
    }

    /// %FTP at `elapsed_ms` into the block.
    pub fn power_pct_at(&self, elapsed_ms: u64) -> f32 {
        match self {
            WorkoutBlock::Constant { power_pct, .. } => *power_pct,
            WorkoutBlock::Ramp {
                start_pct, end_pct, ..
            } => start_pct + (end_pct - start_pct) * self.progress(elapsed_ms),
        }
    }

    /// Target watts at `elapsed_ms` into the block.
    pub fn power_watts_at(&self, elapsed_ms: u64, ftp: u16) -> u16 {
        let watts = f32::from(ftp) * self.power_pct_at(elapsed_ms) / 100.0;
        watts.round().clamp(0.0, f32::from(u16::MAX)) as u16
    }

    /// Target cadence at `elapsed_ms` into the block, if the block sets one.
    pub fn cadence_at(&self, elapsed_ms: u64) -> Option<u16> {
        match self {
            WorkoutBlock::Constant {
                cadence_rpm,
                cadence_range,
                ..
            } => cadence_rpm.or_else(|| {
                cadence_range.map(|r| (r.min_rpm + r.max_rpm) / 2)
            }),
            WorkoutBlock::Ramp {
                start_cadence_rpm,
                end_cadence_rpm,
                ..
            } => match (start_cadence_rpm, end_cadence_rpm) {
                (Some(start), Some(end)) => {
                    let start = f32::from(*start);
                    let end = f32::from(*end);
                    let rpm = start + (end - start) * self.progress(elapsed_ms);
                    Some(rpm.round() as u16)
                }
                (Some(only), None) | (None, Some(only)) => Some(*only),
                (None, None) => None,
            },
        }
    }
}

/// An authored plan entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanItem {
    /// A single block
    Block { block: WorkoutBlock },
    /// Blocks played `repeats` times in order
    Intervals {
        repeats: u32,
        blocks: Vec<WorkoutBlock>,
    },
}

impl PlanItem {
    /// Duration with repeats unrolled.
    pub fn duration_ms(&self) -> u64 {
        match self {
            PlanItem::Block { block } => block.duration_ms(),
            PlanItem::Intervals { repeats, blocks } => {
                u64::from(*repeats) * blocks.iter().map(WorkoutBlock::duration_ms).sum::<u64>()
            }
        }
    }
}

/// What an event does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// On-screen text
    Message { text: String },
    /// Named effect for the UI to play
    Effect { name: String },
}

/// A one-shot event at an absolute workout time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutEvent {
    /// Unique within the plan
    pub id: String,
    /// Trigger time from workout start
    pub at_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// A structured training workout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutPlan {
    /// Unique identifier
    pub id: Uuid,
    /// Workout name
    pub name: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Workout creator/author
    #[serde(default)]
    pub author: Option<String>,
    /// Blocks and interval groups in order
    pub items: Vec<PlanItem>,
    /// Time-indexed events
    #[serde(default)]
    pub events: Vec<WorkoutEvent>,
    /// User-defined tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Import/creation timestamp
    pub created_at: DateTime<Utc>,
}

impl WorkoutPlan {
    /// Create a plan with the given name and items.
    pub fn new(name: impl Into<String>, items: Vec<PlanItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            author: None,
            items,
            events: Vec::new(),
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Plan made of plain blocks.
    pub fn from_blocks(name: impl Into<String>, blocks: Vec<WorkoutBlock>) -> Self {
        Self::new(
            name,
            blocks
                .into_iter()
                .map(|block| PlanItem::Block { block })
                .collect(),
        )
    }

    /// Attach events.
    pub fn with_events(mut self, events: Vec<WorkoutEvent>) -> Self {
        self.events = events;
        self
    }

    /// Flat block sequence with repeats unrolled and power scaled.
    pub fn flatten(&self, scale: f32) -> Vec<WorkoutBlock> {
        let mut blocks = Vec::new();
        for item in &self.items {
            match item {
                PlanItem::Block { block } => blocks.push(block.scaled(scale)),
                PlanItem::Intervals { repeats, blocks: set } => {
                    for _ in 0..*repeats {
                        blocks.extend(set.iter().map(|b| b.scaled(scale)));
                    }
                }
            }
        }
        blocks
    }

    /// Total duration in milliseconds.
    pub fn total_duration_ms(&self) -> u64 {
        self.items.iter().map(PlanItem::duration_ms).sum()
    }

    /// Check the plan can be played.
    pub fn validate(&self) -> Result<(), WorkoutError> {
        let blocks = self.flatten(1.0);
        if blocks.is_empty() {
            return Err(WorkoutError::InvalidPlan("plan has no blocks".to_string()));
        }
        if blocks.iter().any(|b| b.duration_ms() == 0) {
            return Err(WorkoutError::InvalidPlan(
                "every block needs a duration".to_string(),
            ));
        }
        let mut ids = std::collections::HashSet::new();
        for event in &self.events {
            if !ids.insert(event.id.as_str()) {
                return Err(WorkoutError::InvalidPlan(format!(
                    "duplicate event id {}",
                    event.id
                )));
            }
        }
        Ok(())
    }

    /// Parse a plan from JSON.
    pub fn from_json(json: &str) -> Result<Self, WorkoutParseError> {
        serde_json::from_str(json).map_err(|e| WorkoutParseError::InvalidJson(e.to_string()))
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, WorkoutParseError> {
        serde_json::to_string_pretty(self).map_err(|e| WorkoutParseError::InvalidJson(e.to_string()))
    }

    /// Load a plan file, `.zwo` or JSON by extension.
    pub fn load(path: &Path) -> Result<Self, WorkoutParseError> {
        let is_zwo = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("zwo"));

        if is_zwo {
            return crate::workouts::parser_zwo::parse_zwo_file(path);
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| WorkoutParseError::IoError(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Estimated intensity factor and TSS at scale 1.0.
    pub fn estimate_load(&self) -> Option<(f32, f32)> {
        let blocks = self.flatten(1.0);
        let total_ms: u64 = blocks.iter().map(WorkoutBlock::duration_ms).sum();
        if total_ms == 0 {
            return None;
        }

        let weighted: f64 = blocks
            .iter()
            .map(|b| {
                let avg_pct = match b {
                    WorkoutBlock::Constant { power_pct, .. } => f64::from(*power_pct),
                    WorkoutBlock::Ramp {
                        start_pct, end_pct, ..
                    } => (f64::from(*start_pct) + f64::from(*end_pct)) / 2.0,
                };
                avg_pct * b.duration_ms() as f64
            })
            .sum();

        let intensity_factor = (weighted / total_ms as f64 / 100.0) as f32;
        let hours = total_ms as f32 / 3_600_000.0;
        Some((intensity_factor, hours * intensity_factor * intensity_factor * 100.0))
    }
}

/// Playback status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    /// Loaded, never started
    #[default]
    NotStarted,
    /// Clock running
    Running,
    /// Clock stopped mid-workout
    Paused,
    /// Finished or ended early
    Complete,
}

/// Snapshot of playback position and targets.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackProgress {
    pub status: PlaybackStatus,
    /// Index into the flattened blocks
    pub block_index: usize,
    pub block_count: usize,
    pub elapsed_ms: u64,
    pub block_elapsed_ms: u64,
    pub block_remaining_ms: u64,
    pub total_remaining_ms: u64,
    pub target_power_watts: Option<u16>,
    pub target_cadence_rpm: Option<u16>,
    pub current_block: Option<WorkoutBlock>,
    pub next_block: Option<WorkoutBlock>,
    pub power_scale: f32,
}

/// Something playback reports as it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Now playing the block at this index
    BlockChanged { index: usize },
    /// A plan event fired
    Event(WorkoutEvent),
    /// Workout finished
    Completed { elapsed_ms: u64 },
}

/// Errors related to workout operations.
#[derive(Debug, Error)]
pub enum WorkoutError {
    /// Plan cannot be played
    #[error("Invalid workout: {0}")]
    InvalidPlan(String),

    /// Operation not allowed in the current playback state
    #[error("Invalid playback state: {0}")]
    InvalidState(String),

    /// Workout parsing failed
    #[error("Failed to parse workout: {0}")]
    ParseError(#[from] WorkoutParseError),

    /// Session persistence failed
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Errors during workout file parsing.
#[derive(Debug, Error)]
pub enum WorkoutParseError {
    /// Invalid XML structure
    #[error("Invalid XML: {0}")]
    InvalidXml(String),

    /// Invalid JSON plan
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid field value
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Unsupported workout content
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Empty workout (no segments)
    #[error("Workout has no segments")]
    EmptyWorkout,

    /// IO error reading file
    #[error("IO error: {0}")]
    IoError(String),
}
