//! camsync: trigger-synchronized multi-camera capture

use std::io::BufRead;
use std::path::PathBuf;
use std::thread;

use camsync::capture::DefaultDeviceFactory;
use camsync::group::{run_worker, ConfigUpdate, RouterSpec, WorkerSpec};
use camsync::pipeline::{run_router, DiskRecorder};
use camsync::{ExecutionMode, GroupManager, GroupSinks, Settings};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use flume::Sender;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "camsync", version, about = "Trigger-synchronized multi-camera capture")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a camera group until interrupted or the frame limit is reached
    Run {
        /// TOML settings file, overridden by CAMSYNC__* environment variables
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Stop after this many synchronized frames
        #[arg(long)]
        frames: Option<u64>,
        /// Record from the first frame (needs group.recording_dir)
        #[arg(long)]
        record: bool,
    },
    /// Capture worker process, spawned by `run`
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        spec: String,
    },
    /// Frame router process, spawned by `run`
    #[command(hide = true)]
    Router {
        #[arg(long)]
        spec: String,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camsync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run {
            config,
            frames,
            record,
        } => tokio::runtime::Runtime::new()?.block_on(run(config, frames, record)),
        Command::Worker { spec } => worker_process(&spec),
        Command::Router { spec } => {
            run_router(RouterSpec::from_json(&spec)?)?;
            Ok(())
        }
    }
}

async fn run(config: Option<PathBuf>, frames: Option<u64>, record: bool) -> Result<()> {
    info!("camsync launching...");
    let mut settings = Settings::load(config.as_deref())?;
    if frames.is_some() {
        settings.group.max_cycles = frames;
    }
    let configs = settings.camera_configs()?;
    let group = settings.group;
    info!(
        cameras = ?configs.enabled_ids(),
        mode = ?group.execution_mode,
        "loaded settings"
    );
    if record && group.recording_dir.is_none() {
        warn!("--record without group.recording_dir, frames will not be written");
    }

    // Routers in their own process record to disk themselves
    let mut recorder = None;
    let sinks = match (group.execution_mode, &group.recording_dir) {
        (ExecutionMode::Threads, Some(dir)) => {
            let (tx, rx) = flume::bounded(group.recording_capacity.max(1));
            recorder = Some(DiskRecorder::new(dir).spawn(rx)?);
            GroupSinks {
                recording: Some(tx),
                live_view: None,
            }
        }
        _ => GroupSinks::none(),
    };

    let mut manager = GroupManager::new(group, sinks);
    if record {
        manager.start_recording();
    }

    let kill_switch = manager.kill_switch();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            kill_switch.trigger();
        }
    });

    let outcome = tokio::task::spawn_blocking(move || {
        let started = manager.start(configs);
        if started.is_ok() {
            manager.wait_until_stopped(None);
        }
        let outcome = manager.close();
        drop(manager);

        if let Some(handle) = recorder {
            match handle.join() {
                Ok(Ok(summaries)) => {
                    for summary in summaries {
                        info!(session = %summary.session, cycles = summary.cycles, "recording written");
                    }
                }
                Ok(Err(err)) => error!(%err, "recorder failed"),
                Err(_) => error!("recorder thread panicked"),
            }
        }
        started.map(|()| outcome)
    })
    .await??;

    info!(
        cycles = outcome.cycles_completed,
        payloads = outcome.payloads_routed,
        recording_failed = outcome.recording_failed,
        "camsync shutting down"
    );
    match outcome.failure {
        Some(failure) => Err(eyre!("camera group failed: {failure}")),
        None => Ok(()),
    }
}

fn worker_process(spec: &str) -> Result<()> {
    let spec = WorkerSpec::from_json(spec)?;
    let (tx, rx) = flume::unbounded();
    thread::Builder::new()
        .name("camsync-updates".into())
        .spawn(move || forward_updates(tx))?;

    let exit = run_worker(spec, &DefaultDeviceFactory, rx)?;
    debug!(?exit, "worker process exiting");
    Ok(())
}

/// Reads one JSON `ConfigUpdate` per stdin line until the parent closes the pipe.
fn forward_updates(tx: Sender<ConfigUpdate>) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ConfigUpdate>(&line) {
            Ok(update) => {
                if tx.send(update).is_err() {
                    break;
                }
            }
            Err(err) => warn!(%err, "ignoring malformed config update"),
        }
    }
}
