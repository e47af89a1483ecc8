pub mod config;
pub mod decoder;
pub mod device;
pub mod frame;
pub mod rotation;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use config::{CameraConfig, CameraConfigs, CameraId, DeviceSource, Resolution, Rotation};
pub use device::{CaptureDevice, DefaultDeviceFactory, DeviceFactory};
pub use frame::{FrameMetadata, FramePayload, PixelFormat};
pub use synthetic::SyntheticDevice;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Device;
