//! Launch descriptions for workers and the router, serialized across process boundaries

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::CameraConfig;
use crate::error::ConfigError;
use crate::pipeline::FrameBufferNames;
use crate::GroupSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTimeouts {
    pub trigger_ms: u64,
    pub idle_ms: u64,
    pub startup_ms: u64,
}

impl ProtocolTimeouts {
    pub fn from_settings(settings: &GroupSettings) -> Self {
        Self {
            trigger_ms: settings.trigger_timeout_ms,
            idle_ms: settings.idle_timeout_ms,
            startup_ms: settings.startup_timeout_ms,
        }
    }

    pub fn trigger(&self) -> Duration {
        Duration::from_millis(self.trigger_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.trigger_ms == 0 || self.idle_ms == 0 || self.startup_ms == 0 {
            return Err(ConfigError::InvalidSpec("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Everything a capture worker needs to attach to its group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub config: CameraConfig,
    pub slot: usize,
    pub slot_count: usize,
    pub control_name: String,
    pub buffer: FrameBufferNames,
    pub timeouts: ProtocolTimeouts,
    #[serde(default)]
    pub pin_core: Option<usize>,
}

impl WorkerSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.validate()?;
        self.timeouts.validate()?;
        if self.slot >= self.slot_count {
            return Err(ConfigError::InvalidSpec(format!(
                "slot {} out of range for {} slots",
                self.slot, self.slot_count
            )));
        }
        if self.buffer.camera_id != self.config.camera_id {
            return Err(ConfigError::InvalidSpec(format!(
                "buffer belongs to camera {}, config to camera {}",
                self.buffer.camera_id, self.config.camera_id
            )));
        }
        if self.buffer.image_len != self.config.image_size_bytes() {
            return Err(ConfigError::InvalidSpec(format!(
                "image buffer holds {} bytes, camera {} produces {}",
                self.buffer.image_len,
                self.config.camera_id,
                self.config.image_size_bytes()
            )));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let spec: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidSpec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterBuffer {
    pub slot: usize,
    pub names: FrameBufferNames,
}

/// Everything the router needs to attach to its group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSpec {
    pub control_name: String,
    pub slot_count: usize,
    pub buffers: Vec<RouterBuffer>,
    /// Record to disk from inside the router. Only used when it runs as a process.
    #[serde(default)]
    pub recording_dir: Option<PathBuf>,
    pub recording_capacity: usize,
}

impl RouterSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for buffer in &self.buffers {
            if buffer.slot >= self.slot_count {
                return Err(ConfigError::InvalidSpec(format!(
                    "router buffer slot {} out of range for {} slots",
                    buffer.slot, self.slot_count
                )));
            }
            if !seen.insert(buffer.slot) {
                return Err(ConfigError::InvalidSpec(format!(
                    "router buffer slot {} listed twice",
                    buffer.slot
                )));
            }
        }
        if self.recording_capacity == 0 {
            return Err(ConfigError::InvalidSpec("recording capacity must be non-zero".into()));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let spec: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidSpec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }
}
