//! Workout module for structured training sessions.

pub mod clock;
pub mod engine;
pub mod parser_zwo;
pub mod runner;
pub mod sync;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::WorkoutPlayer;
pub use parser_zwo::{parse_zwo, parse_zwo_file};
pub use runner::{RunnerConfig, WorkoutRunner};
pub use sync::{ErgCommand, ErgSync, SyncConfig, SyncEvent, TargetHandle};
pub use types::{
    CadenceRange, EventKind, PlanItem, PlaybackEvent, PlaybackProgress, PlaybackStatus,
    WorkoutBlock, WorkoutError, WorkoutEvent, WorkoutParseError, WorkoutPlan,
};
