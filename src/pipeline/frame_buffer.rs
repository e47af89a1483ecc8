//! Per-camera image and metadata regions in shared memory

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::{CameraConfig, CameraId, FrameMetadata, FramePayload};
use crate::error::{CaptureError, DeviceError, ShmError};
use crate::ipc::{Access, SharedRegion};
use crate::utils::unique_shm_name;

/// What another process needs to attach to a frame buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameBufferNames {
    pub camera_id: CameraId,
    pub image: String,
    pub metadata: String,
    pub image_len: usize,
}

/// One image slot and one metadata slot.
///
/// There is no locking here. Writes and reads are ordered by the trigger
/// channel: the worker only writes between `retrieve` and `retrieved`, the
/// router only reads between `pull` and clearing `new_frame`.
pub struct FrameBuffer {
    camera_id: CameraId,
    image: SharedRegion,
    metadata: SharedRegion,
}

/// Borrowed view of the current frame, valid until the next write.
#[derive(Debug)]
pub struct FrameView<'a> {
    pub image: &'a [u8],
    pub metadata: FrameMetadata,
}

impl FrameView<'_> {
    /// Copies the frame out of shared memory, stamping when the copy happened.
    pub fn to_payload(&self, copied_from_buffer_ns: u64) -> FramePayload {
        let mut metadata = self.metadata;
        metadata.copied_from_buffer_ns = copied_from_buffer_ns;
        FramePayload {
            image: Bytes::copy_from_slice(self.image),
            metadata,
        }
    }
}

impl FrameBuffer {
    pub fn create(config: &CameraConfig) -> Result<Self, ShmError> {
        let camera_id = config.camera_id;
        let image = SharedRegion::create(
            &unique_shm_name(&format!("cam{camera_id}-image")),
            config.image_size_bytes(),
        )?;
        let metadata = SharedRegion::create(
            &unique_shm_name(&format!("cam{camera_id}-meta")),
            FrameMetadata::SIZE,
        )?;
        Ok(Self {
            camera_id,
            image,
            metadata,
        })
    }

    pub fn open(names: &FrameBufferNames, access: Access) -> Result<Self, ShmError> {
        Ok(Self {
            camera_id: names.camera_id,
            image: SharedRegion::open(&names.image, names.image_len, access)?,
            metadata: SharedRegion::open(&names.metadata, FrameMetadata::SIZE, access)?,
        })
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn image_len(&self) -> usize {
        self.image.len()
    }

    pub fn names(&self) -> FrameBufferNames {
        FrameBufferNames {
            camera_id: self.camera_id,
            image: self.image.name().to_owned(),
            metadata: self.metadata.name().to_owned(),
            image_len: self.image.len(),
        }
    }

    /// Overwrites the buffer with one frame.
    pub fn put(&mut self, image: &[u8], metadata: &FrameMetadata) -> Result<(), CaptureError> {
        if image.len() != self.image.len() {
            return Err(DeviceError::BufferSize {
                camera_id: self.camera_id,
                expected: self.image.len(),
                actual: image.len(),
            }
            .into());
        }
        self.image.as_mut_slice()?.copy_from_slice(image);
        self.metadata
            .as_mut_slice()?
            .copy_from_slice(bytemuck::bytes_of(metadata));
        Ok(())
    }

    pub fn read(&self) -> FrameView<'_> {
        FrameView {
            image: self.image.as_slice(),
            metadata: bytemuck::pod_read_unaligned(self.metadata.as_slice()),
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("camera_id", &self.camera_id)
            .field("image", &self.image.name())
            .field("image_len", &self.image.len())
            .finish()
    }
}
