//! Deterministic test-pattern camera

use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::capture::config::{CameraConfig, CameraId, DeviceSource};
use crate::capture::device::CaptureDevice;
use crate::error::DeviceError;

/// Generates images whose bytes encode camera id, frame number and position.
///
/// Frame numbers start at zero and advance on every grab, matching the
/// frame number the capture worker stamps into metadata.
pub struct SyntheticDevice {
    config: CameraConfig,
    grab_cost: Duration,
    retrieve_cost: Duration,
    grabbed: Option<u64>,
    next_frame: u64,
}

impl SyntheticDevice {
    pub fn open(config: &CameraConfig) -> Result<Self, DeviceError> {
        let (grab_cost, retrieve_cost) = match config.source {
            DeviceSource::Synthetic {
                grab_cost_us,
                retrieve_cost_us,
            } => (
                Duration::from_micros(grab_cost_us),
                Duration::from_micros(retrieve_cost_us),
            ),
            _ => {
                return Err(DeviceError::Open {
                    camera_id: config.camera_id,
                    reason: "not a synthetic source".into(),
                })
            }
        };
        debug!(camera_id = config.camera_id, "opened synthetic device");
        Ok(Self {
            config: config.clone(),
            grab_cost,
            retrieve_cost,
            grabbed: None,
            next_frame: 0,
        })
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }
}

/// Byte value at `index` of frame `frame_number` from camera `camera_id`.
pub fn pattern_byte(camera_id: CameraId, frame_number: u64, index: usize) -> u8 {
    (camera_id as u64)
        .wrapping_mul(31)
        .wrapping_add(frame_number.wrapping_mul(7))
        .wrapping_add(index as u64) as u8
}

/// Fills `out` with the pattern for one frame.
pub fn fill_pattern(camera_id: CameraId, frame_number: u64, out: &mut [u8]) {
    for (index, byte) in out.iter_mut().enumerate() {
        *byte = pattern_byte(camera_id, frame_number, index);
    }
}

impl CaptureDevice for SyntheticDevice {
    fn grab(&mut self) -> Result<(), DeviceError> {
        if !self.grab_cost.is_zero() {
            thread::sleep(self.grab_cost);
        }
        self.grabbed = Some(self.next_frame);
        self.next_frame += 1;
        Ok(())
    }

    fn retrieve(&mut self, out: &mut [u8]) -> Result<(), DeviceError> {
        let camera_id = self.config.camera_id;
        let frame_number = self.grabbed.take().ok_or_else(|| DeviceError::Retrieve {
            camera_id,
            reason: "retrieve without a grabbed frame".into(),
        })?;
        let expected = self.config.image_size_bytes();
        if out.len() != expected {
            return Err(DeviceError::BufferSize {
                camera_id,
                expected,
                actual: out.len(),
            });
        }
        if !self.retrieve_cost.is_zero() {
            thread::sleep(self.retrieve_cost);
        }
        fill_pattern(camera_id, frame_number, out);
        Ok(())
    }

    fn apply_config(&mut self, config: &CameraConfig) -> Result<(), DeviceError> {
        if self.config.requires_reopen(config) {
            return Err(DeviceError::Configure {
                camera_id: config.camera_id,
                reason: "geometry or source change needs a new device".into(),
            });
        }
        self.config = config.clone();
        Ok(())
    }
}
