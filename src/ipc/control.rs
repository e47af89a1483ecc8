//! Control block: every trigger channel of a group in one shared memory region
//!
//! All fields are atomics so the block can be shared between processes without
//! locks. Flags are set and cleared with `Release` and read with `Acquire`, which
//! is what orders frame buffer writes against the reads on the other side.

use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::capture::CameraId;
use crate::error::{FailureKind, ShmError};
use crate::ipc::shm::{Access, SharedRegion};
use crate::utils::{unique_shm_name, TimebaseMapping};

const CONTROL_MAGIC: u64 = u64::from_le_bytes(*b"CAMSYNC1");

/// Per-camera signals exchanged between orchestrator, worker and router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Worker has its device open and is idle.
    Ready,
    Initial,
    Grab,
    Grabbed,
    Retrieve,
    Retrieved,
    /// Worker wrote a frame the router has not read yet.
    NewFrame,
    /// Worker should exit after finishing its current step.
    CloseSelf,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Ready => "ready",
            Signal::Initial => "initial",
            Signal::Grab => "grab",
            Signal::Grabbed => "grabbed",
            Signal::Retrieve => "retrieve",
            Signal::Retrieved => "retrieved",
            Signal::NewFrame => "new_frame",
            Signal::CloseSelf => "close_self",
        }
    }
}

/// Group-wide flags in the control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupFlag {
    Kill,
    Pull,
    PauseRequested,
    Paused,
    Recording,
    RecordingFailed,
}

#[repr(C)]
#[derive(Default)]
pub struct TriggerChannel {
    camera_id: AtomicU32,
    active: AtomicBool,
    ready: AtomicBool,
    initial: AtomicBool,
    grab: AtomicBool,
    grabbed: AtomicBool,
    retrieve: AtomicBool,
    retrieved: AtomicBool,
    new_frame: AtomicBool,
    close_self: AtomicBool,
    fault: AtomicU8,
    config_generation: AtomicU64,
    failed_generation: AtomicU64,
    last_frame_number: AtomicU64,
}

impl TriggerChannel {
    fn flag(&self, signal: Signal) -> &AtomicBool {
        match signal {
            Signal::Ready => &self.ready,
            Signal::Initial => &self.initial,
            Signal::Grab => &self.grab,
            Signal::Grabbed => &self.grabbed,
            Signal::Retrieve => &self.retrieve,
            Signal::Retrieved => &self.retrieved,
            Signal::NewFrame => &self.new_frame,
            Signal::CloseSelf => &self.close_self,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn set(&self, signal: Signal) {
        self.flag(signal).store(true, Ordering::Release);
    }

    pub fn clear(&self, signal: Signal) {
        self.flag(signal).store(false, Ordering::Release);
    }

    pub fn is_set(&self, signal: Signal) -> bool {
        self.flag(signal).load(Ordering::Acquire)
    }

    /// Records a fault unless one is already recorded. Returns whether this call won.
    pub fn record_fault(&self, kind: FailureKind) -> bool {
        self.fault
            .compare_exchange(0, kind.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn fault(&self) -> Option<FailureKind> {
        FailureKind::from_code(self.fault.load(Ordering::Acquire))
    }

    pub fn config_generation(&self) -> u64 {
        self.config_generation.load(Ordering::Acquire)
    }

    pub fn publish_config_generation(&self, generation: u64) {
        self.config_generation.store(generation, Ordering::Release);
    }

    pub fn failed_generation(&self) -> u64 {
        self.failed_generation.load(Ordering::Acquire)
    }

    pub fn publish_failed_generation(&self, generation: u64) {
        self.failed_generation.store(generation, Ordering::Release);
    }

    pub fn last_frame_number(&self) -> u64 {
        self.last_frame_number.load(Ordering::Acquire)
    }

    pub fn set_last_frame_number(&self, frame_number: u64) {
        self.last_frame_number.store(frame_number, Ordering::Release);
    }

    pub fn snapshot(&self) -> TriggerSnapshot {
        TriggerSnapshot {
            camera_id: self.camera_id(),
            active: self.is_active(),
            ready: self.is_set(Signal::Ready),
            initial: self.is_set(Signal::Initial),
            grab: self.is_set(Signal::Grab),
            grabbed: self.is_set(Signal::Grabbed),
            retrieve: self.is_set(Signal::Retrieve),
            retrieved: self.is_set(Signal::Retrieved),
            new_frame: self.is_set(Signal::NewFrame),
            fault: self.fault(),
        }
    }
}

#[repr(C)]
#[derive(Default)]
struct ControlHeader {
    magic: AtomicU64,
    slot_count: AtomicU64,
    slot_stride: AtomicU64,
    kill: AtomicBool,
    pull: AtomicBool,
    pause_requested: AtomicBool,
    paused: AtomicBool,
    recording: AtomicBool,
    recording_failed: AtomicBool,
    router_fault: AtomicU8,
    cycles_completed: AtomicU64,
    payloads_routed: AtomicU64,
    next_cycle_number: AtomicU64,
    timebase_unix_ns: AtomicU64,
    timebase_monotonic_ns: AtomicU64,
}

type PaddedHeader = CachePadded<ControlHeader>;
type PaddedChannel = CachePadded<TriggerChannel>;

/// Point-in-time copy of one trigger channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSnapshot {
    pub camera_id: CameraId,
    pub active: bool,
    pub ready: bool,
    pub initial: bool,
    pub grab: bool,
    pub grabbed: bool,
    pub retrieve: bool,
    pub retrieved: bool,
    pub new_frame: bool,
    pub fault: Option<FailureKind>,
}

impl TriggerSnapshot {
    /// No trigger or handoff is in flight for this camera.
    pub fn is_quiescent(&self) -> bool {
        !(self.initial
            || self.grab
            || self.grabbed
            || self.retrieve
            || self.retrieved
            || self.new_frame)
    }
}

/// A group's control block, created by the manager and attached by name elsewhere.
pub struct ControlBlock {
    region: SharedRegion,
    slot_count: usize,
}

impl ControlBlock {
    pub fn layout_size(slot_count: usize) -> usize {
        size_of::<PaddedHeader>() + slot_count * size_of::<PaddedChannel>()
    }

    /// Creates a block with one active channel per camera, in the given order.
    pub fn create(
        camera_ids: &[CameraId],
        timebase: TimebaseMapping,
        first_cycle_number: u64,
    ) -> Result<Self, ShmError> {
        let name = unique_shm_name("control");
        let region = SharedRegion::create(&name, Self::layout_size(camera_ids.len()))?;
        let block = Self {
            region,
            slot_count: camera_ids.len(),
        };

        let header = block.header();
        header
            .slot_count
            .store(camera_ids.len() as u64, Ordering::Relaxed);
        header
            .slot_stride
            .store(size_of::<PaddedChannel>() as u64, Ordering::Relaxed);
        header
            .timebase_unix_ns
            .store(timebase.unix_ns, Ordering::Relaxed);
        header
            .timebase_monotonic_ns
            .store(timebase.monotonic_ns, Ordering::Relaxed);
        header
            .next_cycle_number
            .store(first_cycle_number, Ordering::Relaxed);
        for (index, &camera_id) in camera_ids.iter().enumerate() {
            let channel = block.channel(index);
            channel.camera_id.store(camera_id, Ordering::Relaxed);
            channel.active.store(true, Ordering::Relaxed);
        }
        // Publishing the magic last makes the rest visible to anyone who checks it
        header.magic.store(CONTROL_MAGIC, Ordering::Release);
        Ok(block)
    }

    pub fn open(name: &str, slot_count: usize) -> Result<Self, ShmError> {
        let region = SharedRegion::open(name, Self::layout_size(slot_count), Access::ReadWrite)?;
        let block = Self { region, slot_count };
        let header = block.header();
        let layout_err = |reason: String| ShmError::Layout {
            name: name.to_owned(),
            reason,
        };
        if header.magic.load(Ordering::Acquire) != CONTROL_MAGIC {
            return Err(layout_err("bad magic".into()));
        }
        let stored = header.slot_count.load(Ordering::Relaxed);
        if stored != slot_count as u64 {
            return Err(layout_err(format!("holds {stored} slots, expected {slot_count}")));
        }
        let stride = header.slot_stride.load(Ordering::Relaxed);
        if stride != size_of::<PaddedChannel>() as u64 {
            return Err(layout_err(format!("slot stride {stride} does not match this build")));
        }
        Ok(block)
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn header(&self) -> &ControlHeader {
        // SAFETY: the region is page aligned and at least `layout_size` bytes. Every
        // field is an atomic for which all-zero bytes are a valid value.
        unsafe { &*(self.region.as_ptr() as *const PaddedHeader) }
    }

    /// Channel at `index`. Panics if `index >= slot_count()`.
    pub fn channel(&self, index: usize) -> &TriggerChannel {
        assert!(index < self.slot_count, "slot {index} out of range");
        // SAFETY: as for `header`; the index is bounds checked above.
        unsafe {
            let base = self.region.as_ptr().add(size_of::<PaddedHeader>()) as *const PaddedChannel;
            &*base.add(index)
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = (usize, &TriggerChannel)> {
        (0..self.slot_count).map(move |index| (index, self.channel(index)))
    }

    pub fn slot_of(&self, camera_id: CameraId) -> Option<usize> {
        self.channels()
            .find(|(_, channel)| channel.camera_id() == camera_id)
            .map(|(index, _)| index)
    }

    /// Slot indices of channels currently marked active.
    pub fn active_slots(&self) -> Vec<usize> {
        self.channels()
            .filter(|(_, channel)| channel.is_active())
            .map(|(index, _)| index)
            .collect()
    }

    fn group_flag(&self, flag: GroupFlag) -> &AtomicBool {
        let header = self.header();
        match flag {
            GroupFlag::Kill => &header.kill,
            GroupFlag::Pull => &header.pull,
            GroupFlag::PauseRequested => &header.pause_requested,
            GroupFlag::Paused => &header.paused,
            GroupFlag::Recording => &header.recording,
            GroupFlag::RecordingFailed => &header.recording_failed,
        }
    }

    pub fn set_flag(&self, flag: GroupFlag, value: bool) {
        self.group_flag(flag).store(value, Ordering::Release);
    }

    pub fn flag(&self, flag: GroupFlag) -> bool {
        self.group_flag(flag).load(Ordering::Acquire)
    }

    pub fn kill(&self) {
        self.set_flag(GroupFlag::Kill, true);
    }

    pub fn is_killed(&self) -> bool {
        self.flag(GroupFlag::Kill)
    }

    pub fn record_router_fault(&self, kind: FailureKind) -> bool {
        self.header()
            .router_fault
            .compare_exchange(0, kind.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn router_fault(&self) -> Option<FailureKind> {
        FailureKind::from_code(self.header().router_fault.load(Ordering::Acquire))
    }

    pub fn timebase(&self) -> TimebaseMapping {
        let header = self.header();
        TimebaseMapping {
            unix_ns: header.timebase_unix_ns.load(Ordering::Acquire),
            monotonic_ns: header.timebase_monotonic_ns.load(Ordering::Acquire),
        }
    }

    pub fn cycles_completed(&self) -> u64 {
        self.header().cycles_completed.load(Ordering::Acquire)
    }

    pub fn complete_cycle(&self) -> u64 {
        self.header().cycles_completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn payloads_routed(&self) -> u64 {
        self.header().payloads_routed.load(Ordering::Acquire)
    }

    pub fn count_routed_payload(&self) {
        self.header().payloads_routed.fetch_add(1, Ordering::AcqRel);
    }

    /// Hands out the next cycle number. Only the router calls this.
    pub fn take_cycle_number(&self) -> u64 {
        self.header().next_cycle_number.fetch_add(1, Ordering::AcqRel)
    }

    pub fn next_cycle_number(&self) -> u64 {
        self.header().next_cycle_number.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Vec<TriggerSnapshot> {
        self.channels().map(|(_, channel)| channel.snapshot()).collect()
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("name", &self.name())
            .field("slot_count", &self.slot_count)
            .finish()
    }
}

/// Process-local stop request, independent of any one control block.
///
/// `trigger` is a single atomic store, so it may be called from a signal handler.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(ids: &[CameraId]) -> ControlBlock {
        ControlBlock::create(ids, TimebaseMapping::capture(), 0).unwrap()
    }

    #[test]
    fn fresh_block_is_quiescent() {
        let block = block(&[3, 7]);
        assert_eq!(block.slot_of(7), Some(1));
        assert_eq!(block.active_slots(), vec![0, 1]);
        for snapshot in block.snapshot() {
            assert!(snapshot.active);
            assert!(!snapshot.ready);
            assert!(snapshot.is_quiescent());
            assert_eq!(snapshot.fault, None);
        }
        assert!(!block.is_killed());
    }

    #[test]
    fn attached_block_shares_flags() {
        let owner = block(&[0, 1]);
        let attached = ControlBlock::open(owner.name(), 2).unwrap();

        owner.channel(1).set(Signal::Grab);
        assert!(attached.channel(1).is_set(Signal::Grab));
        attached.channel(1).clear(Signal::Grab);
        assert!(!owner.channel(1).is_set(Signal::Grab));

        attached.kill();
        assert!(owner.is_killed());
        assert_eq!(attached.timebase(), owner.timebase());
    }

    #[test]
    fn open_checks_slot_count() {
        let owner = block(&[0, 1]);
        assert!(matches!(
            ControlBlock::open(owner.name(), 1),
            Err(ShmError::Layout { .. })
        ));
    }

    #[test]
    fn first_fault_wins() {
        let block = block(&[0]);
        assert!(block.channel(0).record_fault(FailureKind::Device));
        assert!(!block.channel(0).record_fault(FailureKind::Timeout));
        assert_eq!(block.channel(0).fault(), Some(FailureKind::Device));
    }

    #[test]
    fn cycle_numbers_continue_from_start() {
        let block = ControlBlock::create(&[0], TimebaseMapping::default(), 41).unwrap();
        assert_eq!(block.take_cycle_number(), 41);
        assert_eq!(block.take_cycle_number(), 42);
        assert_eq!(block.next_cycle_number(), 43);
    }

    #[test]
    fn kill_switch_is_shared() {
        let switch = KillSwitch::new();
        let clone = switch.clone();
        clone.trigger();
        assert!(switch.is_triggered());
    }
}
