//! RideLink - FTMS trainer control and structured workout playback.
//!
//! Discovers BLE fitness devices, keeps a rate-limited control channel to
//! smart trainers, aggregates rider metrics by role, and plays structured
//! workouts in ERG mode.

pub mod sensors;
pub mod storage;
pub mod workouts;

// Re-export commonly used types
pub use sensors::manager::DeviceManager;
pub use sensors::scanner::Scanner;
pub use storage::config::AppConfig;
pub use workouts::engine::WorkoutPlayer;
pub use workouts::runner::WorkoutRunner;
