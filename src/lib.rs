pub mod capture;
pub mod error;
pub mod group;
pub mod ipc;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use capture::{CameraConfig, CameraConfigs, CameraId};
pub use error::{CaptureError, ConfigError, FailureKind, GroupFailure};
pub use group::{GroupManager, GroupOutcome, UpdateMode, UpdateReport};
pub use ipc::KillSwitch;
pub use pipeline::{GroupSinks, MultiFramePayload, RecordingMessage};

/// Where workers and the router run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Each unit is a child process re-executing this binary.
    Processes,
    /// Each unit is a thread of the calling process.
    Threads,
}

/// Camera group tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    pub execution_mode: ExecutionMode,
    pub trigger_timeout_ms: u64,
    /// Longest a worker waits for the next grab trigger. Does not elapse while paused.
    pub idle_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub live_view_capacity: usize,
    pub recording_capacity: usize,
    pub recording_dir: Option<PathBuf>,
    /// Binary used for worker and router processes, defaults to the current executable.
    pub worker_program: Option<PathBuf>,
    pub pin_workers: bool,
    /// Stop the group after this many cycles.
    pub max_cycles: Option<u64>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Processes,
            trigger_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            startup_timeout_ms: 30_000,
            join_timeout_ms: 5_000,
            live_view_capacity: 4,
            recording_capacity: 64,
            recording_dir: None,
            worker_program: None,
            pin_workers: false,
            max_cycles: None,
        }
    }
}

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub group: GroupSettings,
    pub cameras: Vec<CameraConfig>,
}

impl Settings {
    /// Loads settings from an optional TOML file, overridden by `CAMSYNC__*` variables
    /// (e.g. `CAMSYNC__GROUP__TRIGGER_TIMEOUT_MS=2000`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("CAMSYNC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn camera_configs(&self) -> Result<CameraConfigs, ConfigError> {
        CameraConfigs::new(self.cameras.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_toml_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[group]
execution_mode = "threads"
trigger_timeout_ms = 1500
max_cycles = 10

[[cameras]]
camera_id = 0
resolution = {{ width = 64, height = 64 }}

[[cameras]]
camera_id = 3
exposure = -5
rotation = "clockwise90"
source = {{ kind = "synthetic", grab_cost_us = 200 }}
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.group.execution_mode, ExecutionMode::Threads);
        assert_eq!(settings.group.trigger_timeout_ms, 1500);
        assert_eq!(settings.group.idle_timeout_ms, 60_000);
        assert_eq!(settings.group.max_cycles, Some(10));

        let configs = settings.camera_configs().unwrap();
        assert_eq!(configs.enabled_ids(), vec![0, 3]);
        let cam3 = configs.get(3).unwrap();
        assert_eq!(cam3.exposure, -5);
        assert_eq!(cam3.resolution.width, 640);
        assert_eq!(
            cam3.source,
            capture::DeviceSource::Synthetic {
                grab_cost_us: 200,
                retrieve_cost_us: 0
            }
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/camsync.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
