use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::config::{CameraConfig, CameraId};

/// Frame metadata, laid out for direct placement in shared memory.
///
/// Every timestamp is nanoseconds on `CLOCK_MONOTONIC`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub camera_id: u64,
    pub frame_number: u64,
    pub width: u64,
    pub height: u64,
    pub color_channels: u64,
    pub initialized_ns: u64,
    pub pre_grab_ns: u64,
    pub post_grab_ns: u64,
    pub pre_retrieve_ns: u64,
    pub post_retrieve_ns: u64,
    pub copied_to_buffer_ns: u64,
    pub copied_from_buffer_ns: u64,
}

impl FrameMetadata {
    pub const SIZE: usize = std::mem::size_of::<FrameMetadata>();

    /// Fresh metadata for the next frame of a camera, geometry taken post-rotation.
    pub fn initialize(config: &CameraConfig, frame_number: u64, now_ns: u64) -> Self {
        let out = config.output_resolution();
        Self {
            camera_id: config.camera_id as u64,
            frame_number,
            width: out.width as u64,
            height: out.height as u64,
            color_channels: config.color_channels as u64,
            initialized_ns: now_ns,
            ..Self::default()
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id as CameraId
    }

    pub fn grab_duration_ns(&self) -> u64 {
        self.post_grab_ns.saturating_sub(self.pre_grab_ns)
    }

    pub fn retrieve_duration_ns(&self) -> u64 {
        self.post_retrieve_ns.saturating_sub(self.pre_retrieve_ns)
    }

    /// Time from the end of retrieval to the router reading the buffer.
    pub fn transport_latency_ns(&self) -> u64 {
        self.copied_from_buffer_ns
            .saturating_sub(self.post_retrieve_ns)
    }

    pub fn image_size_bytes(&self) -> usize {
        (self.width * self.height * self.color_channels) as usize
    }
}

/// A single camera's frame, owned outside shared memory.
#[derive(Debug, Clone)]
pub struct FramePayload {
    /// Immutable image data, shared across sinks without copying
    pub image: Bytes,
    pub metadata: FrameMetadata,
}

impl FramePayload {
    pub fn camera_id(&self) -> CameraId {
        self.metadata.camera_id()
    }
}

/// Pixel formats a device may deliver before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Gray8,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: &str) -> Option<Self> {
        match fourcc {
            "MJPG" => Some(PixelFormat::Mjpeg),
            "YUYV" => Some(PixelFormat::Yuyv4),
            "RGB3" => Some(PixelFormat::Rgb24),
            "BGR3" => Some(PixelFormat::Bgr24),
            "GREY" => Some(PixelFormat::Gray8),
            _ => None,
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Yuyv4 => *b"YUYV",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Gray8 => *b"GREY",
        }
    }
}
