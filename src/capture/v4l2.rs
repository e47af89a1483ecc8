//! V4L2 capture backend with memory-mapped streaming buffers

use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::config::{CameraConfig, CameraId};
use crate::capture::decoder::decode_frame;
use crate::capture::device::CaptureDevice;
use crate::capture::frame::PixelFormat;
use crate::error::DeviceError;

const STREAM_BUFFERS: u32 = 4;

const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const V4L2_EXPOSURE_MANUAL: i64 = 1;

pub struct V4l2Device {
    camera_id: CameraId,
    format: PixelFormat,
    channels: usize,
    stream: MmapStream<'static>,
    device: Device,
    raw: Vec<u8>,
    has_frame: bool,
}

impl V4l2Device {
    pub fn open(path: &str, config: &CameraConfig) -> Result<Self, DeviceError> {
        let camera_id = config.camera_id;
        let open_err = |reason: String| DeviceError::Open { camera_id, reason };
        info!(camera_id, path, "opening V4L2 device");

        let device = Device::with_path(path).map_err(|e| open_err(format!("{path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| open_err(format!("query caps: {e}")))?;
        info!(camera_id, "device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(open_err("device doesn't support video capture".into()));
        }

        let format = config
            .capture_format()
            .filter(|f| matches!(f, PixelFormat::Mjpeg | PixelFormat::Yuyv4))
            .ok_or_else(|| open_err(format!("unsupported capture fourcc {}", config.capture_fourcc)))?;

        let mut fmt = device
            .format()
            .map_err(|e| open_err(format!("read format: {e}")))?;
        fmt.width = config.resolution.width;
        fmt.height = config.resolution.height;
        fmt.fourcc = FourCC::new(&format.fourcc());
        let applied = device
            .set_format(&fmt)
            .map_err(|e| open_err(format!("set format: {e}")))?;
        if applied.width != fmt.width || applied.height != fmt.height {
            return Err(open_err(format!(
                "device negotiated {}x{}, wanted {}x{}",
                applied.width, applied.height, fmt.width, fmt.height
            )));
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| open_err(format!("start stream: {e}")))?;
        info!(camera_id, "capture stream started with {} buffers", STREAM_BUFFERS);

        Ok(Self {
            camera_id,
            format,
            channels: config.color_channels as usize,
            stream,
            device,
            raw: Vec::new(),
            has_frame: false,
        })
    }
}

impl CaptureDevice for V4l2Device {
    #[instrument(skip(self), fields(camera_id = self.camera_id))]
    fn grab(&mut self) -> Result<(), DeviceError> {
        let (buf, _meta) = self.stream.next().map_err(|e| DeviceError::Grab {
            camera_id: self.camera_id,
            reason: e.to_string(),
        })?;
        self.raw.clear();
        self.raw.extend_from_slice(buf);
        self.has_frame = true;
        Ok(())
    }

    fn retrieve(&mut self, out: &mut [u8]) -> Result<(), DeviceError> {
        let camera_id = self.camera_id;
        if !std::mem::take(&mut self.has_frame) {
            return Err(DeviceError::Retrieve {
                camera_id,
                reason: "retrieve without a grabbed frame".into(),
            });
        }
        decode_frame(&self.raw, self.format, self.channels, out).map_err(|e| DeviceError::Retrieve {
            camera_id,
            reason: e.to_string(),
        })
    }

    fn apply_config(&mut self, config: &CameraConfig) -> Result<(), DeviceError> {
        let camera_id = self.camera_id;
        let configure_err = |reason: String| DeviceError::Configure { camera_id, reason };

        let mut params = self
            .device
            .params()
            .map_err(|e| configure_err(e.to_string()))?;
        params.interval = v4l::Fraction::new(1000, (config.framerate * 1000.0).round() as u32);
        self.device
            .set_params(&params)
            .map_err(|e| configure_err(e.to_string()))?;

        let mut exposure = exposure_to_v4l2_units(config.exposure);
        let descriptions = self
            .device
            .query_controls()
            .map_err(|e| configure_err(format!("query controls: {e}")))?;
        if let Some(desc) = descriptions.iter().find(|d| d.id == V4L2_CID_EXPOSURE_ABSOLUTE) {
            exposure = exposure.clamp(desc.minimum, desc.maximum);
        }
        for (id, value, name) in [
            (V4L2_CID_EXPOSURE_AUTO, V4L2_EXPOSURE_MANUAL, "manual exposure"),
            (V4L2_CID_EXPOSURE_ABSOLUTE, exposure, "exposure"),
        ] {
            self.device
                .set_control(Control {
                    id,
                    value: Value::Integer(value),
                })
                .map_err(|e| configure_err(format!("{name}: {e}")))?;
        }
        debug!(camera_id, exposure, "applied exposure");
        Ok(())
    }
}

/// Converts an exposure of `2^exposure` seconds into V4L2's 100 µs units.
fn exposure_to_v4l2_units(exposure: i32) -> i64 {
    let seconds = 2f64.powi(exposure);
    ((seconds * 10_000.0).round() as i64).max(1)
}
