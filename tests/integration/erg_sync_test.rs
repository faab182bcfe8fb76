//! ERG target synchronization against a simulated trainer.

use super::sensor_mock::{
    manager_with_trainer, platform_with_devices, settle, within, TRAINER_ID,
};
use ridelink::sensors::ftms::ResultCode;
use ridelink::sensors::manager::DeviceManager;
use ridelink::sensors::simulated::{SimulatedDevice, SimulatedPlatform};
use ridelink::sensors::transport::TransportConfig;
use ridelink::sensors::types::{ConnectionState, SensorError};
use ridelink::workouts::sync::{ErgCommand, ErgSync, SyncConfig, SyncEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Refresh far enough out that it never interferes.
fn quiet_config() -> SyncConfig {
    SyncConfig {
        refresh_interval: Some(Duration::from_secs(600)),
        ..SyncConfig::default()
    }
}

async fn next_event(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
    within(rx.recv()).await.unwrap()
}

async fn synced_at_200(
    config: SyncConfig,
) -> (
    Arc<SimulatedPlatform>,
    ErgSync<SimulatedPlatform>,
    broadcast::Receiver<SyncEvent>,
) {
    let platform = platform_with_devices().await;
    let manager = manager_with_trainer(&platform).await;
    let sync = ErgSync::new(manager, config);
    let mut events = sync.subscribe_events();

    sync.start_sync().await;
    sync.set_target(ErgCommand::new(200));
    match next_event(&mut events).await {
        SyncEvent::Synced(command) => assert_eq!(command.target_watts, 200),
        other => panic!("unexpected event {:?}", other),
    }
    (platform, sync, events)
}

#[tokio::test(start_paused = true)]
async fn test_target_reaches_trainer() {
    let (platform, sync, _events) = synced_at_200(quiet_config()).await;

    assert!(sync.is_syncing());
    assert_eq!(sync.last_command().map(|c| c.target_watts), Some(200));
    assert!(sync.last_sync_time().is_some());
    assert_eq!(sync.sync_error(), None);
    assert_eq!(platform.target_power(TRAINER_ID).await, Some(200));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let (platform, sync, mut events) = synced_at_200(quiet_config()).await;
    let synced_at = sync.last_sync_time();

    platform.fail_next_writes(2).await;
    sync.set_target(ErgCommand::new(210));

    assert!(matches!(
        next_event(&mut events).await,
        SyncEvent::Retrying { attempt: 1, max: 3, .. }
    ));
    assert_eq!(sync.sync_error().as_deref(), Some("Retry 1/3"));

    assert!(matches!(
        next_event(&mut events).await,
        SyncEvent::Retrying { attempt: 2, max: 3, .. }
    ));
    assert_eq!(sync.sync_error().as_deref(), Some("Retry 2/3"));
    assert_eq!(sync.last_sync_time(), synced_at);

    match next_event(&mut events).await {
        SyncEvent::Synced(command) => assert_eq!(command.target_watts, 210),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(sync.sync_error(), None);
    assert_eq!(platform.target_power(TRAINER_ID).await, Some(210));
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_retries() {
    let (platform, sync, mut events) = synced_at_200(quiet_config()).await;

    platform.fail_next_writes(10).await;
    sync.set_target(ErgCommand::new(220));

    for expected in 1..=3 {
        match next_event(&mut events).await {
            SyncEvent::Retrying { attempt, .. } => assert_eq!(attempt, expected),
            other => panic!("unexpected event {:?}", other),
        }
    }

    let message = match next_event(&mut events).await {
        SyncEvent::Failed(message) => message,
        other => panic!("unexpected event {:?}", other),
    };
    assert!(message.starts_with("Failed after 3 retries"));
    assert_eq!(sync.sync_error(), Some(message));
    assert_eq!(sync.last_command().map(|c| c.target_watts), Some(200));
}

#[tokio::test(start_paused = true)]
async fn test_rejection_is_not_retried() {
    let platform = platform_with_devices().await;
    platform.set_control_result(ResultCode::NotSupported).await;
    let manager = manager_with_trainer(&platform).await;
    let sync = ErgSync::new(manager, quiet_config());
    let mut events = sync.subscribe_events();

    sync.start_sync().await;
    sync.set_target(ErgCommand::new(200));

    assert!(matches!(next_event(&mut events).await, SyncEvent::Failed(_)));
    assert!(sync.sync_error().is_some());
    assert_eq!(sync.last_command(), None);
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_trainer_is_not_retried() {
    let platform = platform_with_devices().await;
    let manager = manager_with_trainer(&platform).await;
    let trainer = manager.primary_trainer().await.unwrap();
    let sync = ErgSync::new(Arc::clone(&manager), quiet_config());
    let mut events = sync.subscribe_events();
    sync.start_sync().await;

    let mut state = trainer.subscribe_state();
    platform.drop_link(TRAINER_ID).await;
    within(state.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .unwrap();

    sync.set_target(ErgCommand::new(250));
    assert_eq!(
        next_event(&mut events).await,
        SyncEvent::Failed(SensorError::NotConnected.to_string())
    );
    assert_eq!(sync.last_command(), None);
}

#[tokio::test(start_paused = true)]
async fn test_newer_target_replaces_retrying_one() {
    let (platform, sync, mut events) = synced_at_200(quiet_config()).await;

    platform.fail_next_writes(10).await;
    sync.set_target(ErgCommand::new(210));
    assert!(matches!(
        next_event(&mut events).await,
        SyncEvent::Retrying { attempt: 1, .. }
    ));

    platform.fail_next_writes(0).await;
    sync.set_target(ErgCommand::new(230));

    match next_event(&mut events).await {
        SyncEvent::Synced(command) => assert_eq!(command.target_watts, 230),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(platform.target_power(TRAINER_ID).await, Some(230));
}

#[tokio::test(start_paused = true)]
async fn test_last_target_is_refreshed() {
    let (platform, sync, mut events) = synced_at_200(SyncConfig::default()).await;
    let writes_before = platform.control_writes(TRAINER_ID).await.len();

    match next_event(&mut events).await {
        SyncEvent::Refreshed(command) => assert_eq!(command.target_watts, 200),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        platform.control_writes(TRAINER_ID).await.len(),
        writes_before + 1
    );

    sync.stop_sync().await;
    assert!(!sync.is_syncing());
    let writes_stopped = platform.control_writes(TRAINER_ID).await.len();

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(
        platform.control_writes(TRAINER_ID).await.len(),
        writes_stopped
    );
    // The target survives a stop.
    assert_eq!(sync.current_target().map(|c| c.target_watts), Some(200));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_does_not_displace_queued_target() {
    let (platform, sync, mut events) = synced_at_200(SyncConfig::default()).await;

    // 210 goes out and hangs waiting for its response; 220 queues behind it.
    platform.set_respond_to_control(false).await;
    sync.set_target(ErgCommand::new(210));
    for _ in 0..100 {
        if platform
            .control_writes(TRAINER_ID)
            .await
            .contains(&vec![0x05, 210, 0x00])
        {
            break;
        }
        settle().await;
    }
    sync.set_target(ErgCommand::new(220));

    // A refresh of the acknowledged 200 W fires while 220 is still queued.
    tokio::time::sleep(Duration::from_secs(3)).await;
    platform.set_respond_to_control(true).await;

    match next_event(&mut events).await {
        SyncEvent::Synced(command) => assert_eq!(command.target_watts, 220),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(sync.last_command().map(|c| c.target_watts), Some(220));
    assert_eq!(platform.target_power(TRAINER_ID).await, Some(220));

    let writes = platform.control_writes(TRAINER_ID).await;
    let after_210 = writes
        .iter()
        .position(|w| *w == vec![0x05, 210, 0x00])
        .unwrap();
    assert_eq!(writes[after_210 + 1], vec![0x05, 220, 0x00]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_trainer_is_reported() {
    let platform = platform_with_devices().await;
    let manager = Arc::new(DeviceManager::new(
        Arc::clone(&platform),
        TransportConfig::default(),
    ));
    let sync = ErgSync::new(manager, quiet_config());
    let mut events = sync.subscribe_events();

    sync.start_sync().await;
    sync.set_target(ErgCommand::new(200));

    assert_eq!(
        next_event(&mut events).await,
        SyncEvent::Failed("No trainer assigned".to_string())
    );
    assert_eq!(sync.sync_error().as_deref(), Some("No trainer assigned"));
}

#[tokio::test(start_paused = true)]
async fn test_trainer_without_power_target_is_reported() {
    let platform = platform_with_devices().await;
    platform
        .add_device(SimulatedDevice {
            features: Some(vec![0x02, 0x40, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00]),
            ..SimulatedDevice::trainer(TRAINER_ID, "Basic Trainer")
        })
        .await;
    let manager = manager_with_trainer(&platform).await;
    let sync = ErgSync::new(manager, quiet_config());
    let mut events = sync.subscribe_events();

    sync.start_sync().await;
    sync.set_target(ErgCommand::new(200));

    assert_eq!(
        next_event(&mut events).await,
        SyncEvent::Failed("Trainer does not support ERG mode".to_string())
    );
    assert!(platform.control_writes(TRAINER_ID).await.is_empty());
}
