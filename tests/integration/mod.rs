//! Integration test modules.

mod device_manager_test;
mod erg_sync_test;
mod sensor_mock;
mod transport_test;
mod workout_execution_test;
