//! Application configuration.
//!
//! Stored as TOML in the platform data directory. Missing files and missing
//! keys fall back to defaults. Each runtime component gets its own typed
//! config derived from here.

use crate::sensors::scanner::ScannerConfig;
use crate::sensors::transport::TransportConfig;
use crate::workouts::runner::RunnerConfig;
use crate::workouts::sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application version
    pub version: String,
    /// Data directory path
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Sensor settings
    pub sensors: SensorSettings,
    /// Trainer control settings
    pub control: ControlSettings,
    /// Workout settings
    pub workout: WorkoutSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::new(),
            sensors: SensorSettings::default(),
            control: ControlSettings::default(),
            workout: WorkoutSettings::default(),
        }
    }
}

/// Sensor-related settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Connection timeout in seconds
    pub connection_timeout_secs: u32,
    /// Characteristic read timeout in seconds
    pub read_timeout_secs: u32,
    /// Forget devices silent for this long (ms)
    pub device_expiry_ms: u64,
    /// Expiry sweep period (ms)
    pub sweep_interval_ms: u64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 15,
            read_timeout_secs: 10,
            device_expiry_ms: 5_000,
            sweep_interval_ms: 1_000,
        }
    }
}

/// Trainer control settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    /// Minimum spacing between control point writes (ms)
    pub debounce_ms: u64,
    /// Wait this long for a control point response (ms)
    pub ack_timeout_ms: u64,
    /// Re-send the ERG target this often (ms)
    pub refresh_interval_ms: u64,
    /// Retries after a failed target write
    pub max_retries: u32,
    /// Base of the linear retry delay (ms)
    pub retry_base_delay_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            ack_timeout_ms: 5_000,
            refresh_interval_ms: 2_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
        }
    }
}

/// Workout settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkoutSettings {
    /// Functional Threshold Power in watts (50-600)
    pub ftp: u16,
    /// Playback tick period (ms)
    pub tick_interval_ms: u64,
    /// Recording sample period (ms)
    pub sample_interval_ms: u64,
}

impl Default for WorkoutSettings {
    fn default() -> Self {
        Self {
            ftp: 200,
            tick_interval_ms: 250,
            sample_interval_ms: 1_000,
        }
    }
}

impl WorkoutSettings {
    /// Validate FTP value (50-600 watts).
    pub fn validate_ftp(ftp: u16) -> bool {
        (50..=600).contains(&ftp)
    }
}

impl AppConfig {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(u64::from(self.sensors.connection_timeout_secs)),
            read_timeout: Duration::from_secs(u64::from(self.sensors.read_timeout_secs)),
            debounce: Duration::from_millis(self.control.debounce_ms),
            ack_timeout: Duration::from_millis(self.control.ack_timeout_ms),
            ..TransportConfig::default()
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            expiry: Duration::from_millis(self.sensors.device_expiry_ms),
            sweep_interval: Duration::from_millis(self.sensors.sweep_interval_ms),
            ..ScannerConfig::default()
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            max_retries: self.control.max_retries,
            retry_base_delay: Duration::from_millis(self.control.retry_base_delay_ms),
            refresh_interval: Some(Duration::from_millis(self.control.refresh_interval_ms)),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            tick_interval: Duration::from_millis(self.workout.tick_interval_ms),
            sample_interval: Duration::from_millis(self.workout.sample_interval_ms),
        }
    }
}

/// Get the application data directory.
pub fn get_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "ridelink", "RideLink")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the configuration file path.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Load application configuration from the default location.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let mut config = load_config_from(&get_config_path())?;
    config.data_dir = get_data_dir();
    Ok(config)
}

/// Load configuration from `path`; defaults when the file does not exist.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    let config: AppConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    if !WorkoutSettings::validate_ftp(config.workout.ftp) {
        tracing::warn!("FTP {} outside 50-600 W", config.workout.ftp);
    }
    Ok(config)
}

/// Save application configuration to the default location.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &get_config_path())
}

/// Save configuration to `path`, creating parent directories.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content =
        toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}
