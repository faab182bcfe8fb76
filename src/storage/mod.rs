//! Storage module for configuration and workout sessions.

pub mod config;
pub mod session;

pub use config::{AppConfig, ConfigError, ControlSettings, SensorSettings, WorkoutSettings};
pub use session::{
    MemorySessionStore, SessionProgress, SessionStatus, SessionStore, StorageError, WorkoutSample,
    WorkoutSession,
};
