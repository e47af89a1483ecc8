//! Error taxonomy for the capture group

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::CameraId;

/// Coarse failure classification, stable across process boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Device,
    ProtocolViolation,
    Timeout,
    Reconfiguration,
    Sink,
    /// Shared memory, spawning or configuration problems.
    Resource,
}

impl FailureKind {
    /// Encoding used in the control block fault slots. Zero means "no fault".
    pub fn code(self) -> u8 {
        match self {
            FailureKind::Device => 1,
            FailureKind::ProtocolViolation => 2,
            FailureKind::Timeout => 3,
            FailureKind::Reconfiguration => 4,
            FailureKind::Sink => 5,
            FailureKind::Resource => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FailureKind::Device),
            2 => Some(FailureKind::ProtocolViolation),
            3 => Some(FailureKind::Timeout),
            4 => Some(FailureKind::Reconfiguration),
            5 => Some(FailureKind::Sink),
            6 => Some(FailureKind::Resource),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Device => "device error",
            FailureKind::ProtocolViolation => "protocol violation",
            FailureKind::Timeout => "timeout",
            FailureKind::Reconfiguration => "reconfiguration error",
            FailureKind::Sink => "sink error",
            FailureKind::Resource => "resource error",
        };
        f.write_str(name)
    }
}

/// Failures raised by a capture device backend.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open camera {camera_id}: {reason}")]
    Open { camera_id: CameraId, reason: String },

    #[error("camera {camera_id} failed to grab a frame: {reason}")]
    Grab { camera_id: CameraId, reason: String },

    #[error("camera {camera_id} failed to retrieve a frame: {reason}")]
    Retrieve { camera_id: CameraId, reason: String },

    #[error("camera {camera_id} rejected its configuration: {reason}")]
    Configure { camera_id: CameraId, reason: String },

    #[error("camera {camera_id} image buffer is {actual} bytes, expected {expected}")]
    BufferSize {
        camera_id: CameraId,
        expected: usize,
        actual: usize,
    },
}

/// Shared memory allocation and attachment failures.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("failed to create shared memory `{name}`: {source}")]
    Create {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to open shared memory `{name}`: {source}")]
    Open {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to map shared memory `{name}`: {source}")]
    Map {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("shared memory `{name}` holds {actual} bytes, expected at least {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("shared memory `{name}` has an unexpected layout: {reason}")]
    Layout { name: String, reason: String },

    #[error("shared memory `{name}` is mapped read-only")]
    ReadOnly { name: String },
}

/// Camera configuration and settings validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("camera {camera_id} is configured twice")]
    DuplicateCamera { camera_id: CameraId },

    #[error("camera {camera_id} has an invalid configuration: {reason}")]
    InvalidCamera { camera_id: CameraId, reason: String },

    #[error("no enabled cameras configured")]
    NoEnabledCameras,

    #[error("invalid process spec: {0}")]
    InvalidSpec(String),
}

/// Everything that can go wrong while running a camera group.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("protocol violation{}: {detail}", camera_suffix(*camera_id))]
    ProtocolViolation {
        camera_id: Option<CameraId>,
        detail: String,
    },

    #[error("timed out after {waited:?} waiting for {waiting_for}{}", camera_suffix(*camera_id))]
    Timeout {
        camera_id: Option<CameraId>,
        waiting_for: &'static str,
        waited: Duration,
    },

    #[error("camera {camera_id} could not be reconfigured in place: {reason}")]
    Reconfiguration { camera_id: CameraId, reason: String },

    #[error("recording sink failed: {0}")]
    Sink(String),

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn {unit}: {source}")]
    Spawn {
        unit: String,
        #[source]
        source: io::Error,
    },

    #[error("camera group is {0}")]
    InvalidState(&'static str),

    #[error("camera group failed: {0}")]
    GroupFailed(GroupFailure),
}

fn camera_suffix(camera_id: Option<CameraId>) -> String {
    camera_id
        .map(|id| format!(" (camera {id})"))
        .unwrap_or_default()
}

impl CaptureError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CaptureError::Device(_) => FailureKind::Device,
            CaptureError::ProtocolViolation { .. } => FailureKind::ProtocolViolation,
            CaptureError::Timeout { .. } => FailureKind::Timeout,
            CaptureError::Reconfiguration { .. } => FailureKind::Reconfiguration,
            CaptureError::Sink(_) => FailureKind::Sink,
            CaptureError::GroupFailed(failure) => failure.kind,
            CaptureError::Shm(_)
            | CaptureError::Config(_)
            | CaptureError::Spawn { .. }
            | CaptureError::InvalidState(_) => FailureKind::Resource,
        }
    }

    /// The camera responsible for this error, when there is one.
    pub fn camera_id(&self) -> Option<CameraId> {
        match self {
            CaptureError::Device(err) => Some(match err {
                DeviceError::Open { camera_id, .. }
                | DeviceError::Grab { camera_id, .. }
                | DeviceError::Retrieve { camera_id, .. }
                | DeviceError::Configure { camera_id, .. }
                | DeviceError::BufferSize { camera_id, .. } => *camera_id,
            }),
            CaptureError::ProtocolViolation { camera_id, .. }
            | CaptureError::Timeout { camera_id, .. } => *camera_id,
            CaptureError::Reconfiguration { camera_id, .. } => Some(*camera_id),
            CaptureError::GroupFailed(failure) => failure.camera_id,
            _ => None,
        }
    }
}

/// Terminal failure of a camera group, as surfaced by `GroupManager::close`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFailure {
    pub camera_id: Option<CameraId>,
    pub kind: FailureKind,
    pub message: String,
}

impl GroupFailure {
    pub fn from_error(err: &CaptureError) -> Self {
        Self {
            camera_id: err.camera_id(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for GroupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.camera_id {
            Some(id) => write!(f, "{} on camera {}: {}", self.kind, id, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_are_stable() {
        for kind in [
            FailureKind::Device,
            FailureKind::ProtocolViolation,
            FailureKind::Timeout,
            FailureKind::Reconfiguration,
            FailureKind::Sink,
            FailureKind::Resource,
        ] {
            assert_eq!(FailureKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(FailureKind::from_code(0), None);
    }

    #[test]
    fn timeout_names_camera() {
        let err = CaptureError::Timeout {
            camera_id: Some(3),
            waiting_for: "grabbed",
            waited: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(err.camera_id(), Some(3));
        assert!(err.to_string().contains("camera 3"));
    }
}
