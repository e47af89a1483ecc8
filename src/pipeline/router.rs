//! Frame router: turns the frame buffers of one cycle into a `MultiFramePayload`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{SendTimeoutError, TrySendError};
use metrics::{counter, histogram};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::CameraId;
use crate::error::CaptureError;
use crate::group::spec::RouterSpec;
use crate::ipc::{Access, ControlBlock, GroupFlag, Signal, Waiter};
use crate::pipeline::frame_buffer::FrameBuffer;
use crate::pipeline::payload::MultiFramePayload;
use crate::pipeline::recorder::DiskRecorder;
use crate::pipeline::sink::{GroupSinks, RecordingMessage};
use crate::utils::monotonic_ns;

/// How long a blocked recording send waits before re-checking the kill flag.
const RECORDING_SEND_SLICE: Duration = Duration::from_millis(50);
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct FrameRouter {
    control: ControlBlock,
    buffers: BTreeMap<usize, FrameBuffer>,
    sinks: GroupSinks,
    last_frame_numbers: BTreeMap<CameraId, u64>,
    was_recording: bool,
    live_view_open: bool,
}

impl FrameRouter {
    /// Attaches to the control block and every frame buffer named in `spec`.
    pub fn attach(spec: &RouterSpec, sinks: GroupSinks) -> Result<Self, CaptureError> {
        spec.validate()?;
        let control = ControlBlock::open(&spec.control_name, spec.slot_count)?;
        let mut buffers = BTreeMap::new();
        for buffer in &spec.buffers {
            buffers.insert(buffer.slot, FrameBuffer::open(&buffer.names, Access::ReadOnly)?);
        }
        Ok(Self {
            control,
            buffers,
            sinks,
            last_frame_numbers: BTreeMap::new(),
            was_recording: false,
            live_view_open: true,
        })
    }

    /// Serves pull requests until the kill flag is raised.
    #[instrument(skip_all, name = "router")]
    pub fn run(mut self) -> Result<(), CaptureError> {
        info!(cameras = self.buffers.len(), "frame router running");
        let mut waiter = Waiter::new();
        let result = loop {
            if self.control.is_killed() {
                break Ok(());
            }
            self.observe_recording_flag();
            if self.control.flag(GroupFlag::Pull) {
                if let Err(err) = self.route_cycle() {
                    break Err(err);
                }
                waiter = Waiter::new();
                continue;
            }
            waiter.snooze();
        };

        if self.was_recording {
            self.finalize_recording();
        }
        info!(
            payloads = self.control.payloads_routed(),
            "frame router stopped"
        );
        result
    }

    fn route_cycle(&mut self) -> Result<(), CaptureError> {
        let payload = match self.collect_payload() {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "router protocol violation");
                self.control.record_router_fault(err.kind());
                self.control.kill();
                return Err(err);
            }
        };

        // Release the read window before doing anything slow
        for (_, channel) in self.control.channels() {
            if channel.is_active() {
                channel.clear(Signal::NewFrame);
            }
        }
        self.control.set_flag(GroupFlag::Pull, false);
        self.control.count_routed_payload();

        counter!("camsync_payloads_routed_total").increment(1);
        histogram!("camsync_grab_skew_ns").record(payload.grab_skew_ns() as f64);
        trace!(cycle = payload.cycle_number, "payload routed");

        self.dispatch(Arc::new(payload));
        Ok(())
    }

    fn collect_payload(&mut self) -> Result<MultiFramePayload, CaptureError> {
        let slots = self.control.active_slots();
        let cycle_number = self.control.take_cycle_number();
        let mut payload = MultiFramePayload::new(cycle_number, self.control.timebase());
        let mut expected = Vec::with_capacity(slots.len());

        for slot in slots {
            let channel = self.control.channel(slot);
            let camera_id = channel.camera_id();
            expected.push(camera_id);
            let violation = |detail: String| CaptureError::ProtocolViolation {
                camera_id: Some(camera_id),
                detail,
            };

            if !channel.is_set(Signal::NewFrame) {
                return Err(violation(format!("no new frame in cycle {cycle_number}")));
            }
            let buffer = self
                .buffers
                .get(&slot)
                .ok_or_else(|| violation("router has no buffer for this camera".into()))?;
            let frame = buffer.read().to_payload(monotonic_ns());

            if frame.camera_id() != camera_id {
                return Err(violation(format!(
                    "buffer holds a frame from camera {}",
                    frame.camera_id()
                )));
            }
            let frame_number = frame.metadata.frame_number;
            if let Some(&last) = self.last_frame_numbers.get(&camera_id) {
                if frame_number <= last {
                    return Err(violation(format!(
                        "frame number {frame_number} does not follow {last}"
                    )));
                }
            }
            self.last_frame_numbers.insert(camera_id, frame_number);
            payload.insert(frame);
        }

        if !payload.is_full(&expected) {
            return Err(CaptureError::ProtocolViolation {
                camera_id: None,
                detail: format!("payload for cycle {cycle_number} is incomplete"),
            });
        }
        Ok(payload)
    }

    fn dispatch(&mut self, payload: Arc<MultiFramePayload>) {
        self.observe_recording_flag();
        if self.was_recording {
            self.send_recording(RecordingMessage::Payload(payload.clone()));
        }

        if !self.live_view_open {
            return;
        }
        if let Some(live_view) = &self.sinks.live_view {
            match live_view.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    counter!("camsync_live_view_dropped_total").increment(1);
                    trace!(cycle = dropped.cycle_number, "live view full, dropping payload");
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("live view receiver gone");
                    self.live_view_open = false;
                }
            }
        }
    }

    /// Emits `Finalize` on a recording true to false transition.
    fn observe_recording_flag(&mut self) {
        let recording = self.control.flag(GroupFlag::Recording);
        if self.was_recording && !recording {
            self.finalize_recording();
        } else if !self.was_recording && recording {
            info!("recording started");
        }
        self.was_recording = recording;
    }

    fn finalize_recording(&mut self) {
        self.was_recording = false;
        let Some(recording) = &self.sinks.recording else {
            return;
        };
        match recording.send_timeout(RecordingMessage::Finalize, FINALIZE_TIMEOUT) {
            Ok(()) => info!("recording stopped"),
            Err(err) => warn!(%err, "could not deliver recording finalize"),
        }
    }

    /// Blocking send. Once the group is killed the payload still gets
    /// `FINALIZE_TIMEOUT` to drain, after which the recording is marked failed.
    fn send_recording(&mut self, message: RecordingMessage) {
        let Some(recording) = self.sinks.recording.clone() else {
            return;
        };
        let mut message = message;
        let mut killed_at = None;
        loop {
            match recording.send_timeout(message, RECORDING_SEND_SLICE) {
                Ok(()) => {
                    counter!("camsync_recording_sent_total").increment(1);
                    return;
                }
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.control.is_killed() {
                        let since = *killed_at.get_or_insert_with(Instant::now);
                        if since.elapsed() >= FINALIZE_TIMEOUT {
                            self.fail_recording(CaptureError::Sink(
                                "recording queue did not drain on shutdown".into(),
                            ));
                            return;
                        }
                    }
                    message = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.fail_recording(CaptureError::Sink("recording receiver disconnected".into()));
                    return;
                }
            }
        }
    }

    /// Sink failures stay local: recording stops, capture carries on.
    fn fail_recording(&mut self, err: CaptureError) {
        error!(%err, kind = %err.kind(), "recording marked failed");
        counter!("camsync_recording_failures_total").increment(1);
        self.control.set_flag(GroupFlag::RecordingFailed, true);
        self.control.set_flag(GroupFlag::Recording, false);
        self.was_recording = false;
    }
}

/// Router entry point when it runs as its own process.
///
/// Recording goes to a `DiskRecorder` thread when `recording_dir` is set.
pub fn run_router(spec: RouterSpec) -> Result<(), CaptureError> {
    let mut sinks = GroupSinks::none();
    let recorder = match &spec.recording_dir {
        Some(dir) => {
            let (tx, rx) = flume::bounded(spec.recording_capacity);
            sinks.recording = Some(tx);
            let handle = DiskRecorder::new(dir)
                .spawn(rx)
                .map_err(|source| CaptureError::Spawn {
                    unit: "recorder".into(),
                    source,
                })?;
            Some(handle)
        }
        None => None,
    };

    let result = FrameRouter::attach(&spec, sinks).and_then(FrameRouter::run);

    if let Some(handle) = recorder {
        match handle.join() {
            Ok(Ok(summaries)) => debug!(sessions = summaries.len(), "recorder finished"),
            Ok(Err(err)) => error!(%err, "recorder failed"),
            Err(_) => error!("recorder thread panicked"),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CameraConfig;
    use crate::error::FailureKind;
    use crate::group::spec::RouterBuffer;
    use crate::utils::TimebaseMapping;

    #[test]
    fn missing_new_frame_is_a_router_fault() {
        let control = ControlBlock::create(&[0, 1], TimebaseMapping::capture(), 0).unwrap();
        let buffers: Vec<FrameBuffer> = [0, 1]
            .into_iter()
            .map(|id| FrameBuffer::create(&CameraConfig::new(id)).unwrap())
            .collect();
        let spec = RouterSpec {
            control_name: control.name().to_owned(),
            slot_count: 2,
            buffers: buffers
                .iter()
                .enumerate()
                .map(|(slot, buffer)| RouterBuffer {
                    slot,
                    names: buffer.names(),
                })
                .collect(),
            recording_dir: None,
            recording_capacity: 1,
        };
        let router = FrameRouter::attach(&spec, GroupSinks::none()).unwrap();

        // Camera 1 delivered, camera 0 did not
        control.channel(1).set(Signal::NewFrame);
        control.set_flag(GroupFlag::Pull, true);

        let err = router.run().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::ProtocolViolation {
                camera_id: Some(0),
                ..
            }
        ));
        assert_eq!(control.router_fault(), Some(FailureKind::ProtocolViolation));
        assert!(control.is_killed());
        assert_eq!(control.payloads_routed(), 0);
    }
}
