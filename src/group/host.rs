//! Execution units: workers and the router as threads or child processes

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::Sender;
use tracing::{debug, info, warn};

use crate::capture::CameraId;
use crate::error::CaptureError;
use crate::group::worker::ConfigUpdate;
use crate::ipc::{wait_until, Waiter};

/// How a unit ended once joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    Clean,
    Failed(String),
    Panicked,
    /// Still running at the join deadline; processes are killed, threads detached.
    Abandoned,
}

impl UnitExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, UnitExit::Clean)
    }
}

enum UnitKind {
    Thread(Option<JoinHandle<Result<(), CaptureError>>>),
    Process(Child),
}

/// A running worker or router.
pub struct Unit {
    name: String,
    kind: UnitKind,
    exit: Option<UnitExit>,
}

impl Unit {
    pub fn spawn_thread<F>(name: impl Into<String>, run: F) -> Result<Self, CaptureError>
    where
        F: FnOnce() -> Result<(), CaptureError> + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(run)
            .map_err(|source| CaptureError::Spawn {
                unit: name.clone(),
                source,
            })?;
        debug!(unit = %name, "spawned thread");
        Ok(Self {
            name,
            kind: UnitKind::Thread(Some(handle)),
            exit: None,
        })
    }

    /// Spawns `program <args>` with a piped stdin and inherited stderr.
    pub fn spawn_process(
        name: impl Into<String>,
        program: &PathBuf,
        args: &[String],
    ) -> Result<(Self, Option<ChildStdin>), CaptureError> {
        let name = name.into();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                unit: name.clone(),
                source,
            })?;
        info!(unit = %name, pid = child.id(), "spawned process");
        let stdin = child.stdin.take();
        Ok((
            Self {
                name,
                kind: UnitKind::Process(child),
                exit: None,
            },
            stdin,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match &mut self.kind {
            UnitKind::Thread(handle) => handle.as_ref().map_or(true, |h| h.is_finished()),
            UnitKind::Process(child) => matches!(child.try_wait(), Ok(Some(_)) | Err(_)),
        }
    }

    /// Waits up to `timeout` for the unit to end. Repeated calls return the first result.
    pub fn join(&mut self, timeout: Duration) -> UnitExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let finished = wait_until(|| self.is_finished(), || false, Some(timeout)).is_ok();

        let exit = match &mut self.kind {
            UnitKind::Thread(handle) => match handle.take() {
                Some(handle) if finished => match handle.join() {
                    Ok(Ok(())) => UnitExit::Clean,
                    Ok(Err(err)) => UnitExit::Failed(err.to_string()),
                    Err(_) => UnitExit::Panicked,
                },
                Some(_) => {
                    warn!(unit = %self.name, "thread did not stop in time, detaching");
                    UnitExit::Abandoned
                }
                None => UnitExit::Abandoned,
            },
            UnitKind::Process(child) => {
                if !finished {
                    warn!(unit = %self.name, "process did not stop in time, killing");
                    let _ = child.kill();
                }
                match child.wait() {
                    Ok(status) if !finished => {
                        debug!(unit = %self.name, %status, "killed process reaped");
                        UnitExit::Abandoned
                    }
                    Ok(status) if status.success() => UnitExit::Clean,
                    Ok(status) => UnitExit::Failed(format!("exited with {status}")),
                    Err(err) => UnitExit::Failed(format!("wait failed: {err}")),
                }
            }
        };
        debug!(unit = %self.name, ?exit, "unit joined");
        self.exit = Some(exit.clone());
        exit
    }
}

impl Drop for Unit {
    fn drop(&mut self) {
        if self.exit.is_none() {
            if let UnitKind::Process(child) = &mut self.kind {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

/// Delivery path for config updates into a worker.
pub enum UpdateSender {
    Channel(Sender<ConfigUpdate>),
    /// One JSON document per line on the worker process's stdin.
    Stdin(ChildStdin),
}

impl UpdateSender {
    pub fn send(&mut self, update: &ConfigUpdate) -> Result<(), String> {
        match self {
            UpdateSender::Channel(tx) => tx.send(update.clone()).map_err(|e| e.to_string()),
            UpdateSender::Stdin(stdin) => {
                let mut line = serde_json::to_string(update).map_err(|e| e.to_string())?;
                line.push('\n');
                stdin
                    .write_all(line.as_bytes())
                    .and_then(|()| stdin.flush())
                    .map_err(|e| e.to_string())
            }
        }
    }
}

pub struct WorkerHandle {
    pub camera_id: CameraId,
    pub slot: usize,
    pub unit: Unit,
    pub updates: Option<UpdateSender>,
}

/// Joins every unit with a shared deadline.
pub fn join_all<'a>(units: impl IntoIterator<Item = &'a mut Unit>, timeout: Duration) -> Vec<(String, UnitExit)> {
    let waiter = Waiter::new();
    units
        .into_iter()
        .map(|unit| {
            let remaining = timeout.saturating_sub(waiter.elapsed());
            let exit = unit.join(remaining);
            (unit.name().to_owned(), exit)
        })
        .collect()
}
