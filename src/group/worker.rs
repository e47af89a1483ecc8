//! Capture worker: one per camera, drives its device strictly on trigger

use std::time::Duration;

use flume::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::rotation::rotate_into;
use crate::capture::{CameraConfig, CameraId, CaptureDevice, DeviceFactory, FrameMetadata, Rotation};
use crate::error::{CaptureError, DeviceError};
use crate::group::spec::WorkerSpec;
use crate::ipc::{Access, ControlBlock, GroupFlag, Signal, WaitError, Waiter};
use crate::pipeline::FrameBuffer;
use crate::utils::monotonic_ns;

/// A settings change for a running worker, tagged so the manager can match the ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub generation: u64,
    pub config: CameraConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The group kill flag was raised.
    Killed,
    /// The camera was removed from a running group.
    Closed,
}

enum Halt {
    Exit(WorkerExit),
    Fail(CaptureError),
}

impl From<CaptureError> for Halt {
    fn from(err: CaptureError) -> Self {
        Halt::Fail(err)
    }
}

impl From<DeviceError> for Halt {
    fn from(err: DeviceError) -> Self {
        Halt::Fail(err.into())
    }
}

struct CaptureWorker {
    camera_id: CameraId,
    slot: usize,
    spec: WorkerSpec,
    config: CameraConfig,
    control: ControlBlock,
    buffer: FrameBuffer,
    device: Box<dyn CaptureDevice>,
    updates: Receiver<ConfigUpdate>,
    raw: Vec<u8>,
    rotated: Vec<u8>,
    frame_number: u64,
}

/// Runs a capture worker until kill, `close_self`, or a fault.
///
/// Faults are published in the camera's control slot and raise the group kill
/// flag before this returns, so the rest of the group stops with it.
#[instrument(skip_all, fields(camera_id = spec.config.camera_id))]
pub fn run_worker(
    spec: WorkerSpec,
    factory: &dyn DeviceFactory,
    updates: Receiver<ConfigUpdate>,
) -> Result<WorkerExit, CaptureError> {
    spec.validate()?;
    let control = ControlBlock::open(&spec.control_name, spec.slot_count)?;
    let slot = spec.slot;

    let result = CaptureWorker::start(spec, control, factory, updates).and_then(|mut worker| {
        let result = worker.run();
        worker.shutdown();
        result
    });

    let exit = match result {
        Ok(exit) | Err(Halt::Exit(exit)) => exit,
        Err(Halt::Fail(err)) => return Err(err),
    };
    info!(?exit, slot, "capture worker stopped");
    Ok(exit)
}

impl CaptureWorker {
    fn start(
        spec: WorkerSpec,
        control: ControlBlock,
        factory: &dyn DeviceFactory,
        updates: Receiver<ConfigUpdate>,
    ) -> Result<Self, Halt> {
        let camera_id = spec.config.camera_id;
        let slot = spec.slot;
        let fail = |control: &ControlBlock, err: CaptureError| {
            report_fault(control, slot, &err);
            Halt::Fail(err)
        };

        if let Some(core) = spec.pin_core {
            if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                warn!(core, "could not pin capture worker");
            }
        }

        let buffer = match FrameBuffer::open(&spec.buffer, Access::ReadWrite) {
            Ok(buffer) => buffer,
            Err(err) => return Err(fail(&control, err.into())),
        };
        let mut device = match factory.open(&spec.config) {
            Ok(device) => device,
            Err(err) => return Err(fail(&control, err.into())),
        };
        if let Err(err) = device.apply_config(&spec.config) {
            device.release();
            return Err(fail(&control, err.into()));
        }

        let image_len = spec.config.image_size_bytes();
        info!(camera = %spec.config.display_name(), "camera opened");
        Ok(Self {
            camera_id,
            slot,
            config: spec.config.clone(),
            spec,
            control,
            buffer,
            device,
            updates,
            raw: vec![0; image_len],
            rotated: vec![0; image_len],
            frame_number: 0,
        })
    }

    fn run(&mut self) -> Result<WorkerExit, Halt> {
        match self.serve() {
            Ok(exit) => Ok(exit),
            Err(Halt::Exit(exit)) => Ok(exit),
            Err(Halt::Fail(err)) => {
                report_fault(&self.control, self.slot, &err);
                Err(Halt::Fail(err))
            }
        }
    }

    fn serve(&mut self) -> Result<WorkerExit, Halt> {
        self.handshake()?;
        loop {
            self.await_grab_trigger()?;
            self.capture_cycle()?;
        }
    }

    fn shutdown(&mut self) {
        let channel = self.control.channel(self.slot);
        channel.clear(Signal::Ready);
        self.device.release();
    }

    fn handshake(&mut self) -> Result<(), Halt> {
        self.control.channel(self.slot).set(Signal::Ready);
        debug!("ready, waiting for initial trigger");
        let timeout = self.spec.timeouts.startup();
        self.wait_for(Signal::Initial, timeout, "initial trigger")?;
        self.control.channel(self.slot).clear(Signal::Initial);
        Ok(())
    }

    /// The top-level idle wait. Applies pending updates and does not time out
    /// while the group is paused.
    fn await_grab_trigger(&mut self) -> Result<(), Halt> {
        let idle_timeout = self.spec.timeouts.idle();
        let mut waiter = Waiter::new();
        loop {
            let channel = self.control.channel(self.slot);
            if channel.is_set(Signal::Grab) {
                return Ok(());
            }
            if self.control.is_killed() {
                return Err(Halt::Exit(WorkerExit::Killed));
            }
            if channel.is_set(Signal::CloseSelf) {
                return Err(Halt::Exit(WorkerExit::Closed));
            }
            if let Ok(update) = self.updates.try_recv() {
                self.apply_update(update);
                continue;
            }
            if self.control.flag(GroupFlag::PauseRequested) || self.control.flag(GroupFlag::Paused) {
                waiter.restart_clock();
            }
            if let Err(WaitError::TimedOut { waited }) = waiter.check_deadline(Some(idle_timeout)) {
                return Err(self.timeout("grab trigger", waited));
            }
            waiter.snooze();
        }
    }

    fn capture_cycle(&mut self) -> Result<(), Halt> {
        let channel = self.control.channel(self.slot);
        channel.clear(Signal::Grab);

        let mut metadata = FrameMetadata::initialize(&self.config, self.frame_number, monotonic_ns());
        metadata.pre_grab_ns = monotonic_ns();
        self.device.grab()?;
        metadata.post_grab_ns = monotonic_ns();
        self.control.channel(self.slot).set(Signal::Grabbed);

        // Twice the trigger timeout so the orchestrator's own deadline fires first
        let retrieve_timeout = self.spec.timeouts.trigger() * 2;
        self.wait_for(Signal::Retrieve, retrieve_timeout, "retrieve trigger")?;
        self.control.channel(self.slot).clear(Signal::Retrieve);

        metadata.pre_retrieve_ns = monotonic_ns();
        self.device.retrieve(&mut self.raw)?;
        metadata.post_retrieve_ns = monotonic_ns();

        let image = if self.config.rotation == Rotation::None {
            &self.raw
        } else {
            rotate_into(
                &self.raw,
                &mut self.rotated,
                self.config.resolution,
                self.config.color_channels as usize,
                self.config.rotation,
            );
            &self.rotated
        };
        metadata.copied_to_buffer_ns = monotonic_ns();
        self.buffer.put(image, &metadata)?;

        let channel = self.control.channel(self.slot);
        channel.set_last_frame_number(self.frame_number);
        channel.set(Signal::NewFrame);
        channel.set(Signal::Retrieved);
        trace!(frame = self.frame_number, "frame written");
        self.frame_number += 1;
        Ok(())
    }

    fn apply_update(&mut self, update: ConfigUpdate) {
        let channel = self.control.channel(self.slot);
        channel.clear(Signal::Ready);

        let result = if update.config.camera_id != self.camera_id {
            Err(format!("update is for camera {}", update.config.camera_id))
        } else if self.config.requires_reopen(&update.config) {
            Err("update changes geometry or source".to_owned())
        } else {
            self.device
                .apply_config(&update.config)
                .map_err(|err| err.to_string())
        };

        let channel = self.control.channel(self.slot);
        match result {
            Ok(()) => {
                debug!(generation = update.generation, "applied config update");
                self.config = update.config;
                channel.publish_config_generation(update.generation);
            }
            Err(reason) => {
                warn!(generation = update.generation, %reason, "rejected config update");
                channel.publish_failed_generation(update.generation);
            }
        }
        channel.set(Signal::Ready);
    }

    fn wait_for(&self, signal: Signal, timeout: Duration, waiting_for: &'static str) -> Result<(), Halt> {
        let channel = self.control.channel(self.slot);
        crate::ipc::wait_until(
            || channel.is_set(signal),
            || self.control.is_killed(),
            Some(timeout),
        )
        .map_err(|err| match err {
            WaitError::Killed => Halt::Exit(WorkerExit::Killed),
            WaitError::TimedOut { waited } => self.timeout(waiting_for, waited),
        })
    }

    fn timeout(&self, waiting_for: &'static str, waited: Duration) -> Halt {
        Halt::Fail(CaptureError::Timeout {
            camera_id: Some(self.camera_id),
            waiting_for,
            waited,
        })
    }
}

/// Publishes a worker fault and stops the group, unless the group is already stopping.
fn report_fault(control: &ControlBlock, slot: usize, err: &CaptureError) {
    if control.is_killed() {
        debug!(%err, "worker error after kill, not reported");
        return;
    }
    error!(%err, "capture worker failed");
    control.channel(slot).record_fault(err.kind());
    control.kill();
}
