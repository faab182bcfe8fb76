//! RideLink command line.
//!
//! `scan` lists nearby fitness devices; `ride` plays a workout on the first
//! trainer found, in ERG mode.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ridelink::sensors::{
    BlePlatform, BtleplugPlatform, DeviceKind, DeviceManager, DiscoveredDevice, Role, Scanner,
    SimulatedPlatform,
};
use ridelink::storage::config::{load_config, AppConfig};
use ridelink::storage::MemorySessionStore;
use ridelink::workouts::{
    ErgSync, PlaybackEvent, SystemClock, WorkoutPlan, WorkoutRunner,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long `ride` waits for a trainer to show up.
const TRAINER_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "ridelink")]
#[command(about = "FTMS trainer control and ERG workout playback", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List fitness devices in range
    Scan {
        /// Scan duration in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Play a workout on the first trainer found
    Ride {
        /// Workout plan (.json or .zwo)
        plan: PathBuf,

        /// Functional Threshold Power in watts
        #[arg(long)]
        ftp: Option<u16>,

        /// Intensity scale (1.0 = as written)
        #[arg(long)]
        scale: Option<f32>,

        /// Use a simulated trainer and heart rate strap
        #[arg(long)]
        simulate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting RideLink v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = load_config().context("loading configuration")?;

    match cli.command {
        Commands::Scan { seconds } => {
            let platform = Arc::new(BtleplugPlatform::new().await?);
            cmd_scan(platform, &config, Duration::from_secs(seconds)).await
        }
        Commands::Ride {
            plan,
            ftp,
            scale,
            simulate,
        } => {
            let plan = WorkoutPlan::load(&plan)
                .with_context(|| format!("loading workout {}", plan.display()))?;
            let ftp = ftp.unwrap_or(config.workout.ftp);

            if simulate {
                let platform = SimulatedPlatform::with_demo_devices().await;
                let feed = platform.spawn_demo_feed();
                let result = cmd_ride(platform, &config, plan, ftp, scale).await;
                feed.abort();
                result
            } else {
                let platform = Arc::new(BtleplugPlatform::new().await?);
                cmd_ride(platform, &config, plan, ftp, scale).await
            }
        }
    }
}

async fn cmd_scan<P: BlePlatform>(
    platform: Arc<P>,
    config: &AppConfig,
    duration: Duration,
) -> Result<()> {
    let scanner = Scanner::new(platform, config.scanner_config());
    scanner.start().await;

    let bluetooth = scanner.bluetooth_state();
    if bluetooth.permanently_denied() {
        bail!("Bluetooth permission denied; enable it in system settings");
    }

    let token = scanner.start_scan().await;
    tokio::time::sleep(duration).await;
    scanner.stop_scan(token).await;

    let devices = scanner.devices();
    if devices.is_empty() {
        println!("No fitness devices found");
    }
    for device in &devices {
        let kind = device
            .kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<24} {:<16} {:>8}  {}", device.name, kind, rssi, device.id);
    }

    scanner.shutdown().await;
    Ok(())
}

/// Wait until the scanner has seen a trainer.
async fn find_trainer<P: BlePlatform>(scanner: &Scanner<P>) -> Result<DiscoveredDevice> {
    let mut devices = scanner.subscribe_devices();
    let search = async {
        loop {
            let trainer = devices
                .borrow_and_update()
                .iter()
                .find(|d| d.kind() == Some(DeviceKind::Trainer))
                .cloned();
            if let Some(trainer) = trainer {
                return Ok(trainer);
            }
            if devices.changed().await.is_err() {
                bail!("scanner stopped");
            }
        }
    };

    tokio::time::timeout(TRAINER_SEARCH_TIMEOUT, search)
        .await
        .context("no trainer found")?
}

async fn cmd_ride<P: BlePlatform>(
    platform: Arc<P>,
    config: &AppConfig,
    plan: WorkoutPlan,
    ftp: u16,
    scale: Option<f32>,
) -> Result<()> {
    let scanner = Scanner::new(Arc::clone(&platform), config.scanner_config());
    scanner.start().await;
    let token = scanner.start_scan().await;
    let found = find_trainer(&scanner).await;
    let nearby = scanner.devices();
    scanner.stop_scan(token).await;
    scanner.shutdown().await;
    let found = found?;

    let manager = Arc::new(DeviceManager::new(platform, config.transport_config()));
    let trainer = manager.add_or_get_existing(&found).await?;
    trainer.connect().await?;
    manager.assign_role(Role::PrimaryTrainer, trainer.id()).await?;
    println!("Connected to {}", trainer.name());

    if let Some(hrm) = nearby
        .iter()
        .find(|d| d.kind() == Some(DeviceKind::HeartRateMonitor))
    {
        let hrm = manager.add_or_get_existing(hrm).await?;
        match hrm.connect().await {
            Ok(()) => manager.assign_role(Role::HeartRateSource, hrm.id()).await?,
            Err(e) => tracing::warn!("Heart rate monitor unavailable: {}", e),
        }
    }

    let sync = Arc::new(ErgSync::new(Arc::clone(&manager), config.sync_config()));
    let store = Arc::new(MemorySessionStore::new());
    let runner = WorkoutRunner::new(
        plan,
        ftp,
        Arc::new(SystemClock),
        Arc::clone(&sync),
        Arc::clone(&manager),
        store,
        config.runner_config(),
    )?;
    if let Some(scale) = scale {
        runner.set_power_scale_factor(scale).await;
    }

    let mut events = runner.subscribe_events();
    let mut sync_events = sync.subscribe_events();
    runner.start().await?;
    print_target(&runner);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(PlaybackEvent::BlockChanged { .. }) => print_target(&runner),
                Ok(PlaybackEvent::Event(event)) => println!("  {:?}", event.kind),
                Ok(PlaybackEvent::Completed { elapsed_ms }) => {
                    println!("Workout complete in {} s", elapsed_ms / 1000);
                    break;
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            event = sync_events.recv() => {
                if let Ok(event) = event {
                    tracing::debug!("Sync: {:?}", event);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping workout");
                runner.abandon().await?;
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

fn print_target<P: BlePlatform, S: ridelink::storage::SessionStore>(runner: &WorkoutRunner<P, S>) {
    let progress = runner.progress();
    let target = progress
        .target_power_watts
        .map(|w| format!("{} W", w))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "Block {}/{}  target {}  remaining {} s",
        progress.block_index + 1,
        progress.block_count,
        target,
        progress.total_remaining_ms / 1000
    );
}
