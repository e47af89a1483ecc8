use std::collections::BTreeMap;

use serde::Serialize;

use crate::capture::{CameraConfig, CameraConfigs, CameraId};

/// How a new set of camera configs differs from the running one.
///
/// Only enabled cameras take part; a disabled camera is treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigDiff {
    pub unchanged: Vec<CameraId>,
    /// Changes a running worker can apply to its open device.
    pub changed: Vec<CameraId>,
    /// Changes that need a new device handle or new frame buffers.
    pub reopen: Vec<CameraId>,
    pub to_close: Vec<CameraId>,
    pub to_create: Vec<CameraId>,
}

impl ConfigDiff {
    pub fn between(old: &CameraConfigs, new: &CameraConfigs) -> Self {
        let old: BTreeMap<CameraId, &CameraConfig> = old.enabled().map(|c| (c.camera_id, c)).collect();
        let new: BTreeMap<CameraId, &CameraConfig> = new.enabled().map(|c| (c.camera_id, c)).collect();
        let mut diff = ConfigDiff::default();

        for (&camera_id, &before) in &old {
            match new.get(&camera_id) {
                None => diff.to_close.push(camera_id),
                Some(&after) if after == before => diff.unchanged.push(camera_id),
                Some(&after) if before.requires_reopen(after) => diff.reopen.push(camera_id),
                Some(_) => diff.changed.push(camera_id),
            }
        }
        diff.to_create = new
            .keys()
            .copied()
            .filter(|camera_id| !old.contains_key(camera_id))
            .collect();
        diff
    }

    /// New cameras or reopened devices can only be handled by rebuilding the group.
    pub fn requires_reset(&self) -> bool {
        !self.to_create.is_empty() || !self.reopen.is_empty()
    }

    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
            && self.reopen.is_empty()
            && self.to_close.is_empty()
            && self.to_create.is_empty()
    }
}
