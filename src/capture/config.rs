//! Per-camera configuration

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::capture::frame::PixelFormat;
use crate::error::ConfigError;

/// Small stable integer identifying a device.
pub type CameraId = u32;

/// Bytes per channel sample. Images are always 8-bit.
pub const BYTES_PER_SAMPLE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Rotation applied to each image after it is retrieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    CounterClockwise90,
}

impl Rotation {
    /// Whether this rotation swaps image width and height.
    pub fn transposes(self) -> bool {
        matches!(self, Rotation::Clockwise90 | Rotation::CounterClockwise90)
    }
}

/// Which backend opens the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceSource {
    /// Deterministic test pattern generator.
    Synthetic {
        #[serde(default)]
        grab_cost_us: u64,
        #[serde(default)]
        retrieve_cost_us: u64,
    },
    /// V4L2 capture device (requires the `v4l2` feature).
    V4l2 { path: String },
}

impl Default for DeviceSource {
    fn default() -> Self {
        DeviceSource::Synthetic {
            grab_cost_us: 0,
            retrieve_cost_us: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub camera_id: CameraId,
    pub name: String,
    pub resolution: Resolution,
    /// 1 (mono), 3 (RGB) or 4 (RGBA)
    pub color_channels: u32,
    /// OpenCV convention: exposure time is 2^exposure seconds.
    pub exposure: i32,
    pub framerate: f32,
    pub rotation: Rotation,
    pub capture_fourcc: String,
    pub writer_fourcc: String,
    pub enabled: bool,
    pub source: DeviceSource,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            name: String::new(),
            resolution: Resolution::new(640, 480),
            color_channels: 3,
            exposure: -7,
            framerate: 30.0,
            rotation: Rotation::None,
            capture_fourcc: "MJPG".into(),
            writer_fourcc: "MP4V".into(),
            enabled: true,
            source: DeviceSource::default(),
        }
    }
}

impl CameraConfig {
    pub fn new(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            ..Self::default()
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }

    pub fn with_channels(mut self, color_channels: u32) -> Self {
        self.color_channels = color_channels;
        self
    }

    pub fn with_exposure(mut self, exposure: i32) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn with_source(mut self, source: DeviceSource) -> Self {
        self.source = source;
        self
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("Camera-{}", self.camera_id)
        } else {
            self.name.clone()
        }
    }

    /// Size of one image in the frame buffer.
    pub fn image_size_bytes(&self) -> usize {
        self.resolution.width as usize
            * self.resolution.height as usize
            * self.color_channels as usize
            * BYTES_PER_SAMPLE
    }

    /// Width and height of the image after rotation.
    pub fn output_resolution(&self) -> Resolution {
        if self.rotation.transposes() {
            Resolution::new(self.resolution.height, self.resolution.width)
        } else {
            self.resolution
        }
    }

    pub fn capture_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(&self.capture_fourcc)
    }

    /// Changing any of these requires a new device handle or new buffers.
    pub fn requires_reopen(&self, other: &CameraConfig) -> bool {
        self.resolution != other.resolution
            || self.color_channels != other.color_channels
            || self.source != other.source
            || self.capture_fourcc != other.capture_fourcc
    }

    /// Checks the fields the capture core depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCamera {
            camera_id: self.camera_id,
            reason,
        };

        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(invalid(format!(
                "resolution {}x{} is empty",
                self.resolution.width, self.resolution.height
            )));
        }
        if !matches!(self.color_channels, 1 | 3 | 4) {
            return Err(invalid(format!(
                "unsupported channel count {}",
                self.color_channels
            )));
        }
        for (field, tag) in [
            ("capture_fourcc", &self.capture_fourcc),
            ("writer_fourcc", &self.writer_fourcc),
        ] {
            if tag.len() != 4 || !tag.is_ascii() {
                return Err(invalid(format!("{field} `{tag}` is not a four character code")));
            }
        }
        if !(self.framerate.is_finite() && self.framerate > 0.0) {
            return Err(invalid(format!("framerate {} is not positive", self.framerate)));
        }
        Ok(())
    }
}

/// Validated set of camera configs keyed by camera id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraConfigs(BTreeMap<CameraId, CameraConfig>);

impl CameraConfigs {
    pub fn new(configs: impl IntoIterator<Item = CameraConfig>) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for config in configs {
            config.validate()?;
            let camera_id = config.camera_id;
            if map.insert(camera_id, config).is_some() {
                return Err(ConfigError::DuplicateCamera { camera_id });
            }
        }
        Ok(Self(map))
    }

    pub fn get(&self, camera_id: CameraId) -> Option<&CameraConfig> {
        self.0.get(&camera_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CameraConfig> {
        self.0.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CameraConfig> {
        self.0.values().filter(|config| config.enabled)
    }

    pub fn enabled_ids(&self) -> Vec<CameraId> {
        self.enabled().map(|config| config.camera_id).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_ids() {
        let err = CameraConfigs::new([CameraConfig::new(1), CameraConfig::new(1)]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCamera { camera_id: 1 }));
    }

    #[test]
    fn rejects_bad_geometry() {
        let zero = CameraConfig::new(0).with_resolution(0, 480);
        assert!(zero.validate().is_err());

        let two_channels = CameraConfig::new(0).with_channels(2);
        assert!(two_channels.validate().is_err());

        let mut bad_tag = CameraConfig::new(0);
        bad_tag.writer_fourcc = "H26".into();
        assert!(bad_tag.validate().is_err());
    }

    #[test]
    fn image_size_and_rotation() {
        let mut config = CameraConfig::new(0).with_resolution(64, 32).with_channels(3);
        assert_eq!(config.image_size_bytes(), 64 * 32 * 3);

        config.rotation = Rotation::Clockwise90;
        assert_eq!(config.output_resolution(), Resolution::new(32, 64));
        assert_eq!(config.image_size_bytes(), 64 * 32 * 3);
    }

    #[test]
    fn exposure_change_keeps_device() {
        let before = CameraConfig::new(0).with_exposure(-7);
        let after = before.clone().with_exposure(-5);
        assert!(!before.requires_reopen(&after));
        assert!(before.requires_reopen(&after.clone().with_resolution(1280, 720)));
    }

    #[test]
    fn enabled_ids_skip_disabled() {
        let mut off = CameraConfig::new(2);
        off.enabled = false;
        let configs = CameraConfigs::new([CameraConfig::new(0), off, CameraConfig::new(1)]).unwrap();
        assert_eq!(configs.enabled_ids(), vec![0, 1]);
        assert_eq!(configs.len(), 3);
    }
}
