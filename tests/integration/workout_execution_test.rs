//! Integration tests for workout execution.
//!
//! Plays short workouts end to end: runner ticks the player, targets flow
//! through ERG sync to a simulated trainer fed by the demo loop, and the
//! session is recorded in memory.

use super::sensor_mock::{connect, within};
use ridelink::sensors::manager::{DeviceManager, Role};
use ridelink::sensors::simulated::{SimulatedDevice, SimulatedPlatform};
use ridelink::sensors::transport::TransportConfig;
use ridelink::storage::session::{MemorySessionStore, SessionStatus, SessionStore};
use ridelink::workouts::clock::SystemClock;
use ridelink::workouts::parser_zwo::parse_zwo;
use ridelink::workouts::runner::{RunnerConfig, WorkoutRunner};
use ridelink::workouts::sync::{ErgSync, SyncConfig};
use ridelink::workouts::types::{
    EventKind, PlaybackEvent, PlaybackStatus, WorkoutBlock, WorkoutError, WorkoutEvent,
    WorkoutPlan,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

const TRAINER: &str = "sim-trainer";
const HRM: &str = "sim-hrm";
const FTP: u16 = 200;

type Runner = WorkoutRunner<SimulatedPlatform, MemorySessionStore>;

struct Rig {
    platform: Arc<SimulatedPlatform>,
    sync: Arc<ErgSync<SimulatedPlatform>>,
    manager: Arc<DeviceManager<SimulatedPlatform>>,
    store: Arc<MemorySessionStore>,
    _feed: JoinHandle<()>,
}

impl Rig {
    async fn new() -> Self {
        let platform = SimulatedPlatform::with_demo_devices().await;
        let feed = platform.spawn_demo_feed();
        let manager = Arc::new(DeviceManager::new(
            Arc::clone(&platform),
            TransportConfig::default(),
        ));

        connect(&manager, &SimulatedDevice::trainer(TRAINER, "SIM Smart Trainer")).await;
        connect(&manager, &SimulatedDevice::heart_rate_monitor(HRM, "SIM HRM")).await;
        manager.assign_role(Role::PrimaryTrainer, TRAINER).await.unwrap();
        manager.assign_role(Role::HeartRateSource, HRM).await.unwrap();

        let sync = Arc::new(ErgSync::new(Arc::clone(&manager), SyncConfig::default()));

        Self {
            platform,
            sync,
            manager,
            store: Arc::new(MemorySessionStore::new()),
            _feed: feed,
        }
    }

    fn runner(&self, plan: WorkoutPlan) -> Runner {
        WorkoutRunner::new(
            plan,
            FTP,
            Arc::new(SystemClock),
            Arc::clone(&self.sync),
            Arc::clone(&self.manager),
            Arc::clone(&self.store),
            RunnerConfig::default(),
        )
        .unwrap()
    }

    async fn wait_for_status(&self, id: Uuid, status: SessionStatus) {
        for _ in 0..100 {
            let session = self.store.load_session_metadata(id).await.unwrap();
            if session.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("session never reached {:?}", status);
    }
}

/// 20 s at 50% then 20 s at 75%, with a message 5 s in.
fn two_step_plan() -> WorkoutPlan {
    WorkoutPlan::from_blocks(
        "Two Step",
        vec![
            WorkoutBlock::constant(20_000, 50.0),
            WorkoutBlock::constant(20_000, 75.0),
        ],
    )
    .with_events(vec![WorkoutEvent {
        id: "go".to_string(),
        at_ms: 5_000,
        kind: EventKind::Message {
            text: "Settle in".to_string(),
        },
    }])
}

async fn run_to_completion(runner: &Runner) -> Vec<PlaybackEvent> {
    let mut events = runner.subscribe_events();
    runner.start().await.unwrap();

    let mut seen = Vec::new();
    loop {
        let event = within(events.recv()).await.unwrap();
        let done = matches!(event, PlaybackEvent::Completed { .. });
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_workout_plays_to_completion() {
    let rig = Rig::new().await;
    let runner = rig.runner(two_step_plan());

    let events = run_to_completion(&runner).await;
    let id = runner.session_id().await.unwrap();
    rig.wait_for_status(id, SessionStatus::Completed).await;

    assert!(events.iter().any(|e| matches!(e, PlaybackEvent::Event(ev) if ev.id == "go")));
    assert!(events.contains(&PlaybackEvent::BlockChanged { index: 1 }));
    assert_eq!(
        events.last(),
        Some(&PlaybackEvent::Completed { elapsed_ms: 40_000 })
    );

    let session = rig.store.load_session_metadata(id).await.unwrap();
    assert_eq!(session.plan_name, "Two Step");
    assert_eq!(session.ftp, FTP);
    assert_eq!(session.elapsed_ms, 40_000);
    assert!(session.ended_at.is_some());
    assert!(runner.is_finished());
    assert_eq!(runner.progress().status, PlaybackStatus::Complete);

    // Both targets reached the trainer; sync is stopped with the session.
    let writes = rig.platform.control_writes(TRAINER).await;
    assert!(writes.contains(&vec![0x05, 100, 0x00]));
    assert!(writes.contains(&vec![0x05, 150, 0x00]));
    assert_eq!(rig.platform.target_power(TRAINER).await, Some(150));
    assert!(!rig.sync.is_syncing());

    let samples = rig.store.samples(id).await;
    assert!(samples.len() >= 30);
    assert!(samples.windows(2).all(|w| w[0].elapsed_ms < w[1].elapsed_ms));
    assert_eq!(samples[0].target_watts, Some(100));
    assert!(samples.iter().any(|s| s.target_watts == Some(150)));
    assert!(samples.iter().any(|s| s.heart_rate_bpm.is_some()));
    assert!(samples.iter().any(|s| s.power_watts.is_some()));
}

#[tokio::test(start_paused = true)]
async fn test_parsed_workout_runs() {
    let zwo = r#"<workout_file>
        <name>Openers</name>
        <workout>
            <SteadyState Duration="10" Power="0.6"/>
            <IntervalsT Repeat="2" OnDuration="5" OffDuration="5" OnPower="1.2" OffPower="0.5"/>
        </workout>
    </workout_file>"#;

    let rig = Rig::new().await;
    let runner = rig.runner(parse_zwo(zwo).unwrap());

    let events = run_to_completion(&runner).await;
    let block_changes = events
        .iter()
        .filter(|e| matches!(e, PlaybackEvent::BlockChanged { .. }))
        .count();
    assert_eq!(block_changes, 4);
    assert_eq!(
        events.last(),
        Some(&PlaybackEvent::Completed { elapsed_ms: 30_000 })
    );

    let writes = rig.platform.control_writes(TRAINER).await;
    assert!(writes.contains(&vec![0x05, 240, 0x00]));
}

#[tokio::test(start_paused = true)]
async fn test_abandon_records_position() {
    let rig = Rig::new().await;
    let runner = rig.runner(two_step_plan());
    runner.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(25)).await;
    runner.abandon().await.unwrap();

    let id = runner.session_id().await.unwrap();
    let session = rig.store.load_session_metadata(id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Abandoned);
    assert_eq!(session.current_block_index, 1);
    assert!((24_000..=26_000).contains(&session.elapsed_ms));
    assert!(session.ended_at.is_some());
    assert!(!rig.sync.is_syncing());

    // Closing twice changes nothing.
    runner.abandon().await.unwrap();
    assert!(runner.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_complete_early_keeps_elapsed() {
    let rig = Rig::new().await;
    let runner = rig.runner(two_step_plan());
    let mut events = runner.subscribe_events();
    runner.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(12)).await;
    runner.complete_early().await.unwrap();

    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        if let PlaybackEvent::Completed { elapsed_ms } = event {
            completed = Some(elapsed_ms);
        }
    }
    let elapsed = completed.unwrap();
    assert!((11_000..=13_000).contains(&elapsed));

    let id = runner.session_id().await.unwrap();
    let session = rig.store.load_session_metadata(id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.elapsed_ms, elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_session_resumes() {
    let rig = Rig::new().await;
    let plan = two_step_plan();

    let id = {
        let runner = rig.runner(plan.clone());
        runner.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        runner.pause().await.unwrap();
        runner.session_id().await.unwrap()
    };

    let saved = rig.store.load_session_metadata(id).await.unwrap();
    assert_eq!(saved.status, SessionStatus::Active);
    assert_eq!(saved.current_block_index, 1);
    assert_eq!(rig.store.active_sessions().await.len(), 1);

    let runner = rig.runner(plan);
    let session = runner.resume(id).await.unwrap();
    assert_eq!(session.id, id);

    let progress = runner.progress();
    assert_eq!(progress.status, PlaybackStatus::Paused);
    assert_eq!(progress.block_index, 1);
    assert_eq!(progress.elapsed_ms, saved.elapsed_ms);

    let events = run_to_completion(&runner).await;
    assert!(!events.iter().any(|e| matches!(e, PlaybackEvent::Event(_))));
    rig.wait_for_status(id, SessionStatus::Completed).await;
    assert!(rig.store.active_sessions().await.is_empty());

    // A closed session cannot be picked up again.
    let late = rig.runner(two_step_plan());
    assert!(matches!(
        late.resume(id).await,
        Err(WorkoutError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_resume_unknown_session_fails() {
    let rig = Rig::new().await;
    let runner = rig.runner(two_step_plan());

    assert!(matches!(
        runner.resume(Uuid::new_v4()).await,
        Err(WorkoutError::Storage(_))
    ));
}
