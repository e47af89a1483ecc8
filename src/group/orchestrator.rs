//! The trigger protocol that keeps every camera of a group in lockstep

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tracing::{debug, error, info, instrument, trace};

use crate::capture::CameraId;
use crate::error::CaptureError;
use crate::group::spec::ProtocolTimeouts;
use crate::ipc::{wait_until, ControlBlock, GroupFlag, KillSwitch, Signal, TriggerChannel, WaitError};
use crate::utils::monotonic_ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorExit {
    Killed,
    /// The cycle limit was reached; the group was stopped cleanly.
    CyclesCompleted(u64),
}

enum Halt {
    Killed,
    Fail(CaptureError),
}

impl From<CaptureError> for Halt {
    fn from(err: CaptureError) -> Self {
        Halt::Fail(err)
    }
}

/// Signals checked at the end of every cycle, and the value each must hold.
const SETTLED: [(Signal, bool); 7] = [
    (Signal::Ready, true),
    (Signal::Initial, false),
    (Signal::Grab, false),
    (Signal::Grabbed, false),
    (Signal::Retrieve, false),
    (Signal::Retrieved, false),
    (Signal::NewFrame, false),
];

pub struct Orchestrator {
    control: Arc<ControlBlock>,
    kill_switch: KillSwitch,
    timeouts: ProtocolTimeouts,
    cycle_limit: Option<u64>,
    active: Vec<usize>,
    cycles: u64,
}

impl Orchestrator {
    pub fn new(
        control: Arc<ControlBlock>,
        kill_switch: KillSwitch,
        timeouts: ProtocolTimeouts,
        cycle_limit: Option<u64>,
    ) -> Self {
        let active = control.active_slots();
        Self {
            control,
            kill_switch,
            timeouts,
            cycle_limit,
            active,
            cycles: 0,
        }
    }

    pub fn active_camera_ids(&self) -> Vec<CameraId> {
        self.active
            .iter()
            .map(|&slot| self.control.channel(slot).camera_id())
            .collect()
    }

    /// Waits for every worker to open its device, then fires and collects the initial trigger.
    #[instrument(skip_all, name = "handshake")]
    pub fn handshake(&mut self) -> Result<(), CaptureError> {
        let startup = self.timeouts.startup();
        let result = self
            .await_slots("ready", startup, |c| c.is_set(Signal::Ready))
            .and_then(|()| {
                self.fire(Signal::Initial);
                self.await_slots("initial trigger ack", startup, |c| !c.is_set(Signal::Initial))
            });
        match result {
            Ok(()) => {
                info!(cameras = ?self.active_camera_ids(), "all cameras ready");
                Ok(())
            }
            Err(Halt::Killed) => {
                self.control.kill();
                Err(CaptureError::InvalidState("stopped during startup"))
            }
            Err(Halt::Fail(err)) => {
                error!(%err, "startup handshake failed");
                self.control.kill();
                Err(err)
            }
        }
    }

    /// Runs cycles until kill, the cycle limit, or a fault. Faults raise kill.
    #[instrument(skip_all, name = "orchestrator")]
    pub fn run(&mut self) -> Result<OrchestratorExit, CaptureError> {
        loop {
            if let Some(limit) = self.cycle_limit {
                if self.cycles >= limit {
                    info!(cycles = self.cycles, "cycle limit reached, stopping group");
                    self.control.kill();
                    return Ok(OrchestratorExit::CyclesCompleted(self.cycles));
                }
            }
            match self.check_pause().and_then(|()| self.cycle()) {
                Ok(()) => {}
                Err(Halt::Killed) => {
                    // A process-local stop request has to reach the other units too
                    self.control.kill();
                    info!(cycles = self.cycles, "orchestrator stopped");
                    return Ok(OrchestratorExit::Killed);
                }
                Err(Halt::Fail(err)) => {
                    error!(%err, cycles = self.cycles, "capture cycle failed");
                    self.control.kill();
                    return Err(err);
                }
            }
        }
    }

    fn cycle(&mut self) -> Result<(), Halt> {
        let started = monotonic_ns();
        let trigger = self.timeouts.trigger();

        // ENSURE_READY
        if let Some(slot) = self.first_slot(|c| !c.is_set(Signal::Ready)) {
            return Err(self.violation(slot, "camera not ready at cycle start".into()));
        }

        self.fire(Signal::Grab);
        self.await_slots("grabbed", trigger, |c| c.is_set(Signal::Grabbed))?;
        self.clear(Signal::Grabbed);

        self.fire(Signal::Retrieve);
        self.await_slots("retrieved", trigger, |c| {
            c.is_set(Signal::Retrieved) && c.is_set(Signal::NewFrame)
        })?;
        self.clear(Signal::Retrieved);

        self.control.set_flag(GroupFlag::Pull, true);
        self.await_router(trigger)?;

        self.verify()?;
        self.control.complete_cycle();
        self.cycles += 1;

        counter!("camsync_cycles_total").increment(1);
        histogram!("camsync_cycle_duration_ns").record(monotonic_ns().saturating_sub(started) as f64);
        trace!(cycle = self.cycles, "cycle complete");
        Ok(())
    }

    /// Parks at a cycle boundary while the manager holds a pause request.
    fn check_pause(&mut self) -> Result<(), Halt> {
        if !self.control.flag(GroupFlag::PauseRequested) {
            return Ok(());
        }
        self.control.set_flag(GroupFlag::Paused, true);
        debug!("paused at cycle boundary");

        let paused = wait_until(
            || !self.control.flag(GroupFlag::PauseRequested),
            || self.killed(),
            None,
        );
        self.active = self.control.active_slots();
        self.control.set_flag(GroupFlag::Paused, false);
        if paused.is_err() {
            return Err(Halt::Killed);
        }
        debug!(cameras = ?self.active_camera_ids(), "resumed");

        self.await_slots("ready after resume", self.timeouts.trigger(), |c| {
            c.is_set(Signal::Ready)
        })
    }

    fn verify(&self) -> Result<(), Halt> {
        for &slot in &self.active {
            let channel = self.control.channel(slot);
            for (signal, expected) in SETTLED {
                if channel.is_set(signal) != expected {
                    return Err(self.violation(
                        slot,
                        format!("`{}` is {} after the cycle", signal.name(), !expected),
                    ));
                }
            }
        }
        if self.control.flag(GroupFlag::Pull) {
            return Err(Halt::Fail(CaptureError::ProtocolViolation {
                camera_id: None,
                detail: "pull trigger still set after the cycle".into(),
            }));
        }
        Ok(())
    }

    fn await_router(&self, timeout: Duration) -> Result<(), Halt> {
        let acked = || {
            !self.control.flag(GroupFlag::Pull)
                && self
                    .active
                    .iter()
                    .all(|&slot| !self.control.channel(slot).is_set(Signal::NewFrame))
        };
        wait_until(acked, || self.killed(), Some(timeout)).map_err(|err| match err {
            WaitError::Killed => Halt::Killed,
            WaitError::TimedOut { waited } => Halt::Fail(CaptureError::Timeout {
                camera_id: None,
                waiting_for: "router ack",
                waited,
            }),
        })
    }

    /// Waits until `done` holds for every active camera, naming the first laggard on timeout.
    fn await_slots<F>(&self, waiting_for: &'static str, timeout: Duration, done: F) -> Result<(), Halt>
    where
        F: Fn(&TriggerChannel) -> bool,
    {
        let all_done = || self.active.iter().all(|&slot| done(self.control.channel(slot)));
        wait_until(all_done, || self.killed(), Some(timeout)).map_err(|err| match err {
            WaitError::Killed => Halt::Killed,
            WaitError::TimedOut { waited } => {
                let camera_id = self
                    .first_slot(|c| !done(c))
                    .map(|slot| self.control.channel(slot).camera_id());
                Halt::Fail(CaptureError::Timeout {
                    camera_id,
                    waiting_for,
                    waited,
                })
            }
        })
    }

    fn first_slot(&self, pred: impl Fn(&TriggerChannel) -> bool) -> Option<usize> {
        self.active
            .iter()
            .copied()
            .find(|&slot| pred(self.control.channel(slot)))
    }

    fn fire(&self, signal: Signal) {
        for &slot in &self.active {
            self.control.channel(slot).set(signal);
        }
    }

    fn clear(&self, signal: Signal) {
        for &slot in &self.active {
            self.control.channel(slot).clear(signal);
        }
    }

    fn killed(&self) -> bool {
        self.control.is_killed() || self.kill_switch.is_triggered()
    }

    fn violation(&self, slot: usize, detail: String) -> Halt {
        Halt::Fail(CaptureError::ProtocolViolation {
            camera_id: Some(self.control.channel(slot).camera_id()),
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread::{self, JoinHandle};

    use super::*;
    use crate::utils::TimebaseMapping;

    const TIMEOUTS: ProtocolTimeouts = ProtocolTimeouts {
        trigger_ms: 1_000,
        idle_ms: 1_000,
        startup_ms: 1_000,
    };

    /// Plays one worker and the router over the control block until kill.
    /// With `leave_retrieve_set` the worker never clears its retrieve trigger.
    fn scripted_peers(control: Arc<ControlBlock>, leave_retrieve_set: bool) -> JoinHandle<()> {
        thread::spawn(move || {
            let channel = control.channel(0);
            channel.set(Signal::Ready);
            while !control.is_killed() {
                if channel.is_set(Signal::Initial) {
                    channel.clear(Signal::Initial);
                }
                if channel.is_set(Signal::Grab) {
                    channel.clear(Signal::Grab);
                    channel.set(Signal::Grabbed);
                }
                if channel.is_set(Signal::Retrieve) && !channel.is_set(Signal::Retrieved) {
                    if !leave_retrieve_set {
                        channel.clear(Signal::Retrieve);
                    }
                    channel.set(Signal::NewFrame);
                    channel.set(Signal::Retrieved);
                }
                if control.flag(GroupFlag::Pull) {
                    channel.clear(Signal::NewFrame);
                    control.set_flag(GroupFlag::Pull, false);
                }
                thread::sleep(Duration::from_micros(50));
            }
        })
    }

    fn control_block() -> Arc<ControlBlock> {
        Arc::new(ControlBlock::create(&[4], TimebaseMapping::capture(), 0).unwrap())
    }

    #[test]
    fn stops_at_the_cycle_limit() {
        let control = control_block();
        let peers = scripted_peers(control.clone(), false);
        let mut orchestrator = Orchestrator::new(control.clone(), KillSwitch::new(), TIMEOUTS, Some(3));

        orchestrator.handshake().unwrap();
        assert_eq!(orchestrator.run().unwrap(), OrchestratorExit::CyclesCompleted(3));
        assert!(control.is_killed());
        peers.join().unwrap();
    }

    #[test]
    fn unsettled_trigger_after_a_cycle_is_a_violation() {
        let control = control_block();
        let peers = scripted_peers(control.clone(), true);
        let mut orchestrator = Orchestrator::new(control.clone(), KillSwitch::new(), TIMEOUTS, None);

        orchestrator.handshake().unwrap();
        let err = orchestrator.run().unwrap_err();
        assert!(
            matches!(
                err,
                CaptureError::ProtocolViolation {
                    camera_id: Some(4),
                    ..
                }
            ),
            "{err:?}"
        );
        assert!(control.is_killed());
        peers.join().unwrap();
    }
}
