//! Camera group lifecycle: shared memory, workers, router and the orchestrator thread

pub mod diff;
pub mod host;
pub mod orchestrator;
pub mod spec;
pub mod worker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{CameraConfigs, CameraId, DefaultDeviceFactory, DeviceFactory};
use crate::error::{CaptureError, ConfigError, FailureKind, GroupFailure};
use crate::ipc::{wait_until, ControlBlock, GroupFlag, KillSwitch, Signal, TriggerSnapshot, WaitError};
use crate::pipeline::{FrameBuffer, FrameBufferNames, FrameRouter, GroupSinks};
use crate::utils::TimebaseMapping;
use crate::{ExecutionMode, GroupSettings};

pub use diff::ConfigDiff;
pub use host::{join_all, Unit, UnitExit, UpdateSender, WorkerHandle};
pub use orchestrator::{Orchestrator, OrchestratorExit};
pub use spec::{ProtocolTimeouts, RouterBuffer, RouterSpec, WorkerSpec};
pub use worker::{run_worker, ConfigUpdate, WorkerExit};

const ROUTER_UNIT: &str = "camsync-router";
/// How often `start` checks for units that died before the handshake finished.
const STARTUP_POLL: Duration = Duration::from_millis(50);

/// Terminal result of a camera group, returned by [`GroupManager::close`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupOutcome {
    pub failure: Option<GroupFailure>,
    pub cycles_completed: u64,
    pub payloads_routed: u64,
    pub recording_failed: bool,
}

impl GroupOutcome {
    pub fn is_clean(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateMode {
    /// Nothing that affects capture changed.
    Unchanged,
    /// The group is not running; the configs take effect on the next `start`.
    Stored,
    InPlace,
    /// The group was rebuilt. `fallback` is set when an in-place update was rejected first.
    FullReset { fallback: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub mode: UpdateMode,
    pub diff: ConfigDiff,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    cycles_completed: u64,
    payloads_routed: u64,
    next_cycle_number: u64,
    recording_failed: bool,
}

/// One incarnation of the group. A full reset replaces it.
struct Session {
    control: Arc<ControlBlock>,
    buffers: BTreeMap<CameraId, FrameBuffer>,
    workers: BTreeMap<CameraId, WorkerHandle>,
    router: Unit,
    orchestrator: Option<JoinHandle<Result<OrchestratorExit, CaptureError>>>,
    orchestrator_result: Option<Result<OrchestratorExit, CaptureError>>,
}

impl Session {
    fn orchestrator_finished(&self) -> bool {
        self.orchestrator
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    fn units_mut(&mut self) -> impl Iterator<Item = &mut Unit> {
        self.workers
            .values_mut()
            .map(|worker| &mut worker.unit)
            .chain(std::iter::once(&mut self.router))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Closed,
}

/// Owns a camera group: allocates its shared memory, runs its units and the
/// orchestrator, applies config updates and reports how it ended.
pub struct GroupManager {
    settings: GroupSettings,
    sinks: GroupSinks,
    factory: Arc<dyn DeviceFactory>,
    kill_switch: KillSwitch,
    configs: ArcSwap<CameraConfigs>,
    timebase: TimebaseMapping,
    session: Option<Session>,
    state: State,
    recording: bool,
    generation: u64,
    totals: Totals,
    outcome: Option<GroupOutcome>,
}

impl GroupManager {
    pub fn new(settings: GroupSettings, sinks: GroupSinks) -> Self {
        Self::with_device_factory(settings, sinks, Arc::new(DefaultDeviceFactory))
    }

    /// Custom factories only reach workers running as threads.
    pub fn with_device_factory(
        settings: GroupSettings,
        sinks: GroupSinks,
        factory: Arc<dyn DeviceFactory>,
    ) -> Self {
        Self {
            settings,
            sinks,
            factory,
            kill_switch: KillSwitch::new(),
            configs: ArcSwap::from_pointee(CameraConfigs::default()),
            timebase: TimebaseMapping::capture(),
            session: None,
            state: State::Idle,
            recording: false,
            generation: 0,
            totals: Totals::default(),
            outcome: None,
        }
    }

    pub fn settings(&self) -> &GroupSettings {
        &self.settings
    }

    /// Allocates shared memory, spawns every unit and blocks until all cameras are ready.
    #[instrument(skip_all)]
    pub fn start(&mut self, configs: CameraConfigs) -> Result<(), CaptureError> {
        match self.state {
            State::Running => return Err(CaptureError::InvalidState("already running")),
            State::Closed => return Err(CaptureError::InvalidState("closed")),
            State::Idle => {}
        }
        if configs.enabled().next().is_none() {
            return Err(ConfigError::NoEnabledCameras.into());
        }
        self.configs.store(Arc::new(configs));
        let session = self.launch()?;
        self.session = Some(session);
        self.state = State::Running;
        info!(cameras = ?self.active_camera_ids(), "camera group started");
        Ok(())
    }

    /// Applies new configs, in place where possible and by rebuilding the group otherwise.
    #[instrument(skip_all)]
    pub fn update_configs(&mut self, new: CameraConfigs) -> Result<UpdateReport, CaptureError> {
        if self.state == State::Closed {
            return Err(CaptureError::InvalidState("closed"));
        }
        if new.enabled().next().is_none() {
            return Err(ConfigError::NoEnabledCameras.into());
        }
        let diff = ConfigDiff::between(&self.configs.load(), &new);
        info!(?diff, "updating camera configs");

        if self.state == State::Idle || !self.is_running() {
            self.configs.store(Arc::new(new));
            return Ok(UpdateReport {
                mode: UpdateMode::Stored,
                diff,
            });
        }
        if diff.is_noop() {
            self.configs.store(Arc::new(new));
            return Ok(UpdateReport {
                mode: UpdateMode::Unchanged,
                diff,
            });
        }
        if diff.requires_reset() {
            self.full_reset(new)?;
            return Ok(UpdateReport {
                mode: UpdateMode::FullReset { fallback: false },
                diff,
            });
        }

        match self.reconfigure_in_place(&new, &diff) {
            Ok(()) => {
                self.configs.store(Arc::new(new));
                Ok(UpdateReport {
                    mode: UpdateMode::InPlace,
                    diff,
                })
            }
            Err(err @ CaptureError::Reconfiguration { .. }) => {
                warn!(%err, "in-place update failed, rebuilding the group");
                self.full_reset(new)?;
                Ok(UpdateReport {
                    mode: UpdateMode::FullReset { fallback: true },
                    diff,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Stops every unit, releases shared memory and reports how the group ended.
    pub fn close(&mut self) -> GroupOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let failure = self.session.take().and_then(|session| self.teardown(session));
        let outcome = GroupOutcome {
            failure,
            cycles_completed: self.totals.cycles_completed,
            payloads_routed: self.totals.payloads_routed,
            recording_failed: self.totals.recording_failed,
        };
        match &outcome.failure {
            Some(failure) => error!(%failure, "camera group closed with a failure"),
            None => info!(cycles = outcome.cycles_completed, "camera group closed"),
        }
        self.state = State::Closed;
        self.outcome = Some(outcome.clone());
        outcome
    }

    pub fn start_recording(&mut self) {
        self.recording = true;
        if let Some(session) = &self.session {
            session.control.set_flag(GroupFlag::RecordingFailed, false);
            session.control.set_flag(GroupFlag::Recording, true);
        }
        info!("recording requested");
    }

    pub fn stop_recording(&mut self) {
        self.recording = false;
        if let Some(session) = &self.session {
            session.control.set_flag(GroupFlag::Recording, false);
        }
        info!("recording stop requested");
    }

    /// Whether the router is currently recording. Cleared if the recording sink failed.
    pub fn is_recording(&self) -> bool {
        match &self.session {
            Some(session) => session.control.flag(GroupFlag::Recording),
            None => self.recording,
        }
    }

    pub fn recording_failed(&self) -> bool {
        self.totals.recording_failed
            || self
                .session
                .as_ref()
                .is_some_and(|s| s.control.flag(GroupFlag::RecordingFailed))
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.kill_switch.clone()
    }

    pub fn configs(&self) -> Arc<CameraConfigs> {
        self.configs.load_full()
    }

    /// True while the orchestrator is cycling.
    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.orchestrator_finished() && !s.control.is_killed())
    }

    pub fn active_camera_ids(&self) -> Vec<CameraId> {
        self.session.as_ref().map_or_else(Vec::new, |s| {
            s.control
                .active_slots()
                .into_iter()
                .map(|slot| s.control.channel(slot).camera_id())
                .collect()
        })
    }

    pub fn frame_buffer_names(&self) -> BTreeMap<CameraId, FrameBufferNames> {
        self.session.as_ref().map_or_else(BTreeMap::new, |s| {
            s.buffers
                .iter()
                .map(|(&camera_id, buffer)| (camera_id, buffer.names()))
                .collect()
        })
    }

    pub fn cycles_completed(&self) -> u64 {
        self.totals.cycles_completed
            + self
                .session
                .as_ref()
                .map_or(0, |s| s.control.cycles_completed())
    }

    pub fn payloads_routed(&self) -> u64 {
        self.totals.payloads_routed
            + self
                .session
                .as_ref()
                .map_or(0, |s| s.control.payloads_routed())
    }

    pub fn trigger_snapshot(&self) -> Vec<TriggerSnapshot> {
        self.session
            .as_ref()
            .map_or_else(Vec::new, |s| s.control.snapshot())
    }

    /// Waits until at least `cycles` cycles completed. Fails early if the group stops.
    pub fn wait_for_cycles(&self, cycles: u64, timeout: Duration) -> Result<(), WaitError> {
        wait_until(
            || self.cycles_completed() >= cycles,
            || !self.is_running(),
            Some(timeout),
        )
        .or_else(|err| {
            // The last cycles may complete right as the group stops
            if self.cycles_completed() >= cycles {
                Ok(())
            } else {
                Err(err)
            }
        })
    }

    /// Waits for the orchestrator to stop on its own (cycle limit, fault or kill switch).
    pub fn wait_until_stopped(&self, timeout: Option<Duration>) -> bool {
        wait_until(
            || self.session.as_ref().map_or(true, Session::orchestrator_finished),
            || false,
            timeout,
        )
        .is_ok()
    }

    fn timeouts(&self) -> ProtocolTimeouts {
        ProtocolTimeouts::from_settings(&self.settings)
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.join_timeout_ms)
    }

    /// Builds a session for the current configs and runs the startup handshake.
    fn launch(&mut self) -> Result<Session, CaptureError> {
        let configs = self.configs.load_full();
        let enabled: Vec<_> = configs.enabled().cloned().collect();
        let camera_ids: Vec<CameraId> = enabled.iter().map(|c| c.camera_id).collect();

        let mut buffers = BTreeMap::new();
        for config in &enabled {
            buffers.insert(config.camera_id, FrameBuffer::create(config)?);
        }
        let control = Arc::new(ControlBlock::create(
            &camera_ids,
            self.timebase,
            self.totals.next_cycle_number,
        )?);
        control.set_flag(GroupFlag::Recording, self.recording);

        let router = self.spawn_router(&control, &buffers)?;
        let mut session = Session {
            control: control.clone(),
            buffers,
            workers: BTreeMap::new(),
            router,
            orchestrator: None,
            orchestrator_result: None,
        };

        let core_ids = if self.settings.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        for (slot, config) in enabled.into_iter().enumerate() {
            let names = session.buffers[&config.camera_id].names();
            let spec = WorkerSpec {
                slot,
                slot_count: camera_ids.len(),
                control_name: control.name().to_owned(),
                buffer: names,
                timeouts: self.timeouts(),
                // Core 0 is left to the orchestrator
                pin_core: (!core_ids.is_empty()).then(|| core_ids[(slot + 1) % core_ids.len()].id),
                config,
            };
            match self.spawn_worker(spec) {
                Ok(handle) => {
                    session.workers.insert(handle.camera_id, handle);
                }
                Err(err) => {
                    self.teardown(session);
                    return Err(err);
                }
            }
        }

        let (ready_tx, ready_rx) = flume::bounded(1);
        let mut orchestrator = Orchestrator::new(
            control.clone(),
            self.kill_switch.clone(),
            self.timeouts(),
            self.settings
                .max_cycles
                .map(|max| max.saturating_sub(self.totals.cycles_completed)),
        );
        let spawned = thread::Builder::new()
            .name("camsync-orchestrator".into())
            .spawn(move || {
                orchestrator.handshake()?;
                let _ = ready_tx.send(());
                orchestrator.run()
            });
        match spawned {
            Ok(handle) => session.orchestrator = Some(handle),
            Err(source) => {
                self.teardown(session);
                return Err(CaptureError::Spawn {
                    unit: "orchestrator".into(),
                    source,
                });
            }
        }

        loop {
            match ready_rx.recv_timeout(STARTUP_POLL) {
                Ok(()) => return Ok(session),
                Err(flume::RecvTimeoutError::Timeout) => {
                    // A unit that died before reaching ready would stall the handshake
                    if session.units_mut().any(|unit| unit.is_finished()) {
                        warn!("a unit exited during startup");
                        control.kill();
                    }
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    let failure = self.teardown(session).unwrap_or_else(|| GroupFailure {
                        camera_id: None,
                        kind: FailureKind::Resource,
                        message: "camera group stopped during startup".into(),
                    });
                    return Err(CaptureError::GroupFailed(failure));
                }
            }
        }
    }

    fn worker_program(&self) -> Result<PathBuf, CaptureError> {
        match &self.settings.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|source| CaptureError::Spawn {
                unit: "worker".into(),
                source,
            }),
        }
    }

    fn spawn_router(
        &self,
        control: &ControlBlock,
        buffers: &BTreeMap<CameraId, FrameBuffer>,
    ) -> Result<Unit, CaptureError> {
        let spec = RouterSpec {
            control_name: control.name().to_owned(),
            slot_count: control.slot_count(),
            buffers: buffers
                .iter()
                .filter_map(|(&camera_id, buffer)| {
                    control.slot_of(camera_id).map(|slot| RouterBuffer {
                        slot,
                        names: buffer.names(),
                    })
                })
                .collect(),
            recording_dir: self.settings.recording_dir.clone(),
            recording_capacity: self.settings.recording_capacity.max(1),
        };

        match self.settings.execution_mode {
            ExecutionMode::Threads => {
                let router = FrameRouter::attach(&spec, self.sinks.clone())?;
                Unit::spawn_thread(ROUTER_UNIT, move || router.run())
            }
            ExecutionMode::Processes => {
                if self.sinks.live_view.is_some() || self.sinks.recording.is_some() {
                    warn!("in-process sinks are not reachable from a router process");
                }
                let json = serde_json::to_string(&spec)
                    .map_err(|e| ConfigError::InvalidSpec(e.to_string()))?;
                let args = ["router".to_owned(), "--spec".to_owned(), json];
                let (unit, _stdin) = Unit::spawn_process(ROUTER_UNIT, &self.worker_program()?, &args)?;
                Ok(unit)
            }
        }
    }

    fn spawn_worker(&self, spec: WorkerSpec) -> Result<WorkerHandle, CaptureError> {
        let camera_id = spec.config.camera_id;
        let slot = spec.slot;
        let name = format!("camsync-camera-{camera_id}");

        let (unit, updates) = match self.settings.execution_mode {
            ExecutionMode::Threads => {
                let (tx, rx) = flume::unbounded();
                let factory = self.factory.clone();
                let unit = Unit::spawn_thread(name, move || {
                    run_worker(spec, factory.as_ref(), rx).map(|_| ())
                })?;
                (unit, Some(UpdateSender::Channel(tx)))
            }
            ExecutionMode::Processes => {
                let json = serde_json::to_string(&spec)
                    .map_err(|e| ConfigError::InvalidSpec(e.to_string()))?;
                let args = ["worker".to_owned(), "--spec".to_owned(), json];
                let (unit, stdin) = Unit::spawn_process(name, &self.worker_program()?, &args)?;
                (unit, stdin.map(UpdateSender::Stdin))
            }
        };
        Ok(WorkerHandle {
            camera_id,
            slot,
            unit,
            updates,
        })
    }

    fn full_reset(&mut self, new: CameraConfigs) -> Result<(), CaptureError> {
        info!("full reset");
        if let Some(session) = self.session.take() {
            if let Some(failure) = self.teardown(session) {
                // The old group already failed; surface that rather than masking it
                self.state = State::Idle;
                self.configs.store(Arc::new(new));
                return Err(CaptureError::GroupFailed(failure));
            }
        }
        self.configs.store(Arc::new(new));
        match self.launch() {
            Ok(session) => {
                self.session = Some(session);
                self.state = State::Running;
                Ok(())
            }
            Err(err) => {
                self.state = State::Idle;
                Err(err)
            }
        }
    }

    fn reconfigure_in_place(&mut self, new: &CameraConfigs, diff: &ConfigDiff) -> Result<(), CaptureError> {
        let timeouts = self.timeouts();
        let join_timeout = self.join_timeout();
        let mut generation = self.generation;
        let Some(session) = self.session.as_mut() else {
            return Err(CaptureError::InvalidState("not running"));
        };
        let control = session.control.clone();

        control.set_flag(GroupFlag::PauseRequested, true);
        let result = apply_in_place(session, new, diff, timeouts, join_timeout, &mut generation);
        control.set_flag(GroupFlag::PauseRequested, false);
        self.generation = generation;

        // Back-to-back updates must not see the previous pause still latched
        let resumed = wait_until(
            || !control.flag(GroupFlag::Paused),
            || control.is_killed(),
            Some(timeouts.trigger()),
        );
        if let Err(WaitError::TimedOut { waited }) = resumed {
            warn!(?waited, "orchestrator still paused after the update");
            if result.is_ok() {
                return Err(CaptureError::Timeout {
                    camera_id: None,
                    waiting_for: "resume",
                    waited,
                });
            }
        }

        if result.is_ok() {
            info!(changed = ?diff.changed, closed = ?diff.to_close, "in-place update applied");
        }
        result
    }

    /// Stops a session and works out whether (and why) it failed.
    ///
    /// A camera's own fault outranks the orchestrator's error, which outranks a
    /// router fault, which outranks a unit exiting abnormally.
    fn teardown(&mut self, mut session: Session) -> Option<GroupFailure> {
        let control = session.control.clone();
        control.kill();
        let join_timeout = self.join_timeout();

        if let Some(handle) = session.orchestrator.take() {
            let finished = wait_until(|| handle.is_finished(), || false, Some(join_timeout)).is_ok();
            if finished {
                session.orchestrator_result = match handle.join() {
                    Ok(result) => Some(result),
                    Err(_) => Some(Err(CaptureError::InvalidState("stopped by an orchestrator panic"))),
                };
            } else {
                warn!("orchestrator did not stop in time, detaching");
            }
        }

        let camera_ids: Vec<CameraId> = session.workers.keys().copied().collect();
        let mut exits = join_all(session.units_mut(), join_timeout)
            .into_iter()
            .map(|(_, exit)| exit);
        let worker_exits: BTreeMap<CameraId, UnitExit> = camera_ids
            .into_iter()
            .zip(exits.by_ref())
            .collect();
        let router_exit = exits.next().unwrap_or(UnitExit::Abandoned);

        let failure = session_failure(&session, &worker_exits, &router_exit);

        self.totals.cycles_completed += control.cycles_completed();
        self.totals.payloads_routed += control.payloads_routed();
        self.totals.next_cycle_number = control.next_cycle_number();
        self.totals.recording_failed |= control.flag(GroupFlag::RecordingFailed);
        debug!(
            cycles = self.totals.cycles_completed,
            payloads = self.totals.payloads_routed,
            "session torn down"
        );
        // Buffers and the control block unlink their names when dropped here
        drop(session);
        failure
    }
}

impl Drop for GroupManager {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.close();
        }
    }
}

fn apply_in_place(
    session: &mut Session,
    new: &CameraConfigs,
    diff: &ConfigDiff,
    timeouts: ProtocolTimeouts,
    join_timeout: Duration,
    generation: &mut u64,
) -> Result<(), CaptureError> {
    let control = session.control.clone();
    let stopped = || CaptureError::InvalidState("stopped during reconfiguration");

    // The orchestrator finishes its current cycle first, so allow for a full one
    let pause_timeout = timeouts.trigger() * 4;
    wait_until(|| control.flag(GroupFlag::Paused), || control.is_killed(), Some(pause_timeout))
        .map_err(|err| match err {
            WaitError::Killed => stopped(),
            WaitError::TimedOut { waited } => CaptureError::Timeout {
                camera_id: None,
                waiting_for: "pause",
                waited,
            },
        })?;

    for &camera_id in &diff.changed {
        let (Some(config), Some(worker)) = (new.get(camera_id), session.workers.get_mut(&camera_id)) else {
            continue;
        };
        *generation += 1;
        let update = ConfigUpdate {
            generation: *generation,
            config: config.clone(),
        };
        let reconfig_err = |reason: String| CaptureError::Reconfiguration { camera_id, reason };

        let sender = worker
            .updates
            .as_mut()
            .ok_or_else(|| reconfig_err("worker has no update channel".into()))?;
        sender.send(&update).map_err(reconfig_err)?;

        let channel = control.channel(worker.slot);
        let expected = *generation;
        wait_until(
            || channel.config_generation() == expected || channel.failed_generation() == expected,
            || control.is_killed(),
            Some(timeouts.trigger()),
        )
        .map_err(|err| match err {
            WaitError::Killed => stopped(),
            WaitError::TimedOut { .. } => reconfig_err("no acknowledgement from worker".into()),
        })?;
        if channel.failed_generation() == expected {
            return Err(reconfig_err("worker rejected the update".into()));
        }
        debug!(camera_id, generation = expected, "camera updated in place");
    }

    for &camera_id in &diff.to_close {
        let Some(mut worker) = session.workers.remove(&camera_id) else {
            continue;
        };
        let channel = control.channel(worker.slot);
        channel.set_active(false);
        channel.set(Signal::CloseSelf);
        let exit = worker.unit.join(join_timeout);
        if !exit.is_clean() {
            warn!(camera_id, ?exit, "removed camera did not exit cleanly");
        }
        session.buffers.remove(&camera_id);
        info!(camera_id, "camera closed");
    }
    Ok(())
}

fn session_failure(
    session: &Session,
    worker_exits: &BTreeMap<CameraId, UnitExit>,
    router_exit: &UnitExit,
) -> Option<GroupFailure> {
    let control = &session.control;
    let exit_message = |exit: Option<&UnitExit>| match exit {
        Some(UnitExit::Failed(message)) => Some(message.clone()),
        _ => None,
    };

    for (_, channel) in control.channels() {
        if let Some(kind) = channel.fault() {
            let camera_id = channel.camera_id();
            return Some(GroupFailure {
                camera_id: Some(camera_id),
                kind,
                message: exit_message(worker_exits.get(&camera_id))
                    .unwrap_or_else(|| format!("camera {camera_id} reported a {kind}")),
            });
        }
    }

    if let Some(Err(err)) = &session.orchestrator_result {
        return Some(GroupFailure::from_error(err));
    }

    if let Some(kind) = control.router_fault() {
        return Some(GroupFailure {
            camera_id: None,
            kind,
            message: exit_message(Some(router_exit))
                .unwrap_or_else(|| format!("router reported a {kind}")),
        });
    }

    let abnormal = worker_exits
        .iter()
        .map(|(&camera_id, exit)| (Some(camera_id), exit))
        .chain(std::iter::once((None, router_exit)))
        .find(|(_, exit)| !exit.is_clean());
    abnormal.map(|(camera_id, exit)| GroupFailure {
        camera_id,
        kind: FailureKind::Resource,
        message: format!("unit exited abnormally: {exit:?}"),
    })
}
