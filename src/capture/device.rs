//! Device capability seam between the capture worker and a camera backend

use crate::capture::config::{CameraConfig, DeviceSource};
use crate::capture::synthetic::SyntheticDevice;
use crate::error::DeviceError;

/// An open camera.
///
/// `grab` latches a frame as fast as possible without decoding it, so grabs
/// across cameras land close together. `retrieve` does the expensive part.
pub trait CaptureDevice: Send {
    fn grab(&mut self) -> Result<(), DeviceError>;

    /// Decodes the last grabbed frame into `out`, sized `image_size_bytes()`
    /// of the config the device was opened (or last reconfigured) with.
    fn retrieve(&mut self, out: &mut [u8]) -> Result<(), DeviceError>;

    /// Applies settings that do not change geometry (exposure, framerate, rotation).
    fn apply_config(&mut self, config: &CameraConfig) -> Result<(), DeviceError>;

    fn release(&mut self) {}
}

/// Opens devices for the capture workers.
pub trait DeviceFactory: Send + Sync {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn CaptureDevice>, DeviceError>;
}

/// Opens whichever backend the config's `source` names.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDeviceFactory;

impl DeviceFactory for DefaultDeviceFactory {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        match &config.source {
            DeviceSource::Synthetic { .. } => Ok(Box::new(SyntheticDevice::open(config)?)),
            #[cfg(feature = "v4l2")]
            DeviceSource::V4l2 { path } => Ok(Box::new(
                crate::capture::v4l2::V4l2Device::open(path, config)?,
            )),
            #[cfg(not(feature = "v4l2"))]
            DeviceSource::V4l2 { path } => Err(DeviceError::Open {
                camera_id: config.camera_id,
                reason: format!("{path}: built without the `v4l2` feature"),
            }),
        }
    }
}
