use std::collections::BTreeMap;

use crate::capture::{CameraId, FramePayload};
use crate::utils::TimebaseMapping;

/// Every enabled camera's frame for one cycle.
#[derive(Debug, Clone)]
pub struct MultiFramePayload {
    pub cycle_number: u64,
    pub frames: BTreeMap<CameraId, FramePayload>,
    pub timebase: TimebaseMapping,
}

impl MultiFramePayload {
    pub fn new(cycle_number: u64, timebase: TimebaseMapping) -> Self {
        Self {
            cycle_number,
            frames: BTreeMap::new(),
            timebase,
        }
    }

    pub fn insert(&mut self, frame: FramePayload) {
        self.frames.insert(frame.camera_id(), frame);
    }

    pub fn get(&self, camera_id: CameraId) -> Option<&FramePayload> {
        self.frames.get(&camera_id)
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.frames.keys().copied()
    }

    /// Holds a frame for exactly the expected cameras.
    pub fn is_full(&self, expected: &[CameraId]) -> bool {
        self.frames.len() == expected.len() && expected.iter().all(|id| self.frames.contains_key(id))
    }

    /// Spread of post-grab timestamps across cameras.
    pub fn grab_skew_ns(&self) -> u64 {
        let grabs = self.frames.values().map(|f| f.metadata.post_grab_ns);
        match (grabs.clone().min(), grabs.max()) {
            (Some(min), Some(max)) => max - min,
            _ => 0,
        }
    }

    /// Mean post-grab time of the cycle, in unix nanoseconds.
    pub fn unix_timestamp_ns(&self) -> Option<u64> {
        if self.frames.is_empty() {
            return None;
        }
        let sum: u128 = self
            .frames
            .values()
            .map(|f| f.metadata.post_grab_ns as u128)
            .sum();
        let mean = (sum / self.frames.len() as u128) as u64;
        Some(self.timebase.to_unix_ns(mean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameMetadata;
    use bytes::Bytes;

    fn frame(camera_id: u64, post_grab_ns: u64) -> FramePayload {
        FramePayload {
            image: Bytes::from_static(&[0, 1, 2]),
            metadata: FrameMetadata {
                camera_id,
                post_grab_ns,
                ..FrameMetadata::default()
            },
        }
    }

    #[test]
    fn fullness_needs_exact_set() {
        let mut payload = MultiFramePayload::new(0, TimebaseMapping::default());
        payload.insert(frame(0, 100));
        assert!(!payload.is_full(&[0, 1]));
        payload.insert(frame(1, 130));
        assert!(payload.is_full(&[0, 1]));
        assert!(!payload.is_full(&[0]));
        assert!(!payload.is_full(&[0, 2]));
    }

    #[test]
    fn skew_and_unix_time() {
        let mut payload = MultiFramePayload::new(
            3,
            TimebaseMapping {
                unix_ns: 10_000,
                monotonic_ns: 100,
            },
        );
        assert_eq!(payload.grab_skew_ns(), 0);
        assert_eq!(payload.unix_timestamp_ns(), None);
        payload.insert(frame(0, 100));
        payload.insert(frame(1, 140));
        assert_eq!(payload.grab_skew_ns(), 40);
        assert_eq!(payload.unix_timestamp_ns(), Some(10_020));
    }
}
