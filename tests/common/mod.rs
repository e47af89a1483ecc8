#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use camsync::capture::{CameraConfig, CameraConfigs, CameraId, CaptureDevice, DeviceFactory, SyntheticDevice};
use camsync::error::DeviceError;
use camsync::{ExecutionMode, GroupSettings};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 64;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("camsync=debug")
        .with_test_writer()
        .try_init();
}

/// In-process units with timeouts short enough for tests.
pub fn thread_settings() -> GroupSettings {
    GroupSettings {
        execution_mode: ExecutionMode::Threads,
        trigger_timeout_ms: 2_000,
        idle_timeout_ms: 10_000,
        startup_timeout_ms: 5_000,
        join_timeout_ms: 5_000,
        ..GroupSettings::default()
    }
}

pub fn camera(camera_id: CameraId) -> CameraConfig {
    CameraConfig::new(camera_id).with_resolution(WIDTH, HEIGHT)
}

pub fn cameras(ids: &[CameraId]) -> CameraConfigs {
    CameraConfigs::new(ids.iter().map(|&id| camera(id))).unwrap()
}

/// Synthetic devices that log every config applied to them.
#[derive(Default)]
pub struct TrackingFactory {
    pub opened: AtomicUsize,
    pub applied: Mutex<Vec<CameraConfig>>,
    /// Reject every config after the one applied at startup.
    pub reject_updates: bool,
}

impl TrackingFactory {
    pub fn rejecting_updates() -> Self {
        Self {
            reject_updates: true,
            ..Self::default()
        }
    }

    pub fn applied_for(&self, camera_id: CameraId) -> Vec<CameraConfig> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.camera_id == camera_id)
            .cloned()
            .collect()
    }
}

struct TrackingDevice {
    inner: SyntheticDevice,
    factory: Arc<TrackingFactory>,
    initial_applied: bool,
}

impl CaptureDevice for TrackingDevice {
    fn grab(&mut self) -> Result<(), DeviceError> {
        self.inner.grab()
    }

    fn retrieve(&mut self, out: &mut [u8]) -> Result<(), DeviceError> {
        self.inner.retrieve(out)
    }

    fn apply_config(&mut self, config: &CameraConfig) -> Result<(), DeviceError> {
        // The first call is the worker applying its startup config
        if self.initial_applied && self.factory.reject_updates {
            return Err(DeviceError::Configure {
                camera_id: config.camera_id,
                reason: "updates disabled".into(),
            });
        }
        self.initial_applied = true;
        self.factory.applied.lock().unwrap().push(config.clone());
        self.inner.apply_config(config)
    }
}

/// Wraps an `Arc` so the same factory can be inspected after handing it to a group.
pub struct SharedTracking(pub Arc<TrackingFactory>);

impl DeviceFactory for SharedTracking {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        self.0.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackingDevice {
            inner: SyntheticDevice::open(config)?,
            factory: self.0.clone(),
            initial_applied: false,
        }))
    }
}

/// Fails or stalls one camera's grab at a given frame.
pub struct FaultyFactory {
    pub camera_id: CameraId,
    pub at_frame: u64,
    pub fault: Fault,
}

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    GrabError,
    Hang(Duration),
}

struct FaultyDevice {
    inner: SyntheticDevice,
    grabs: Arc<AtomicU64>,
    at_frame: u64,
    fault: Option<Fault>,
}

impl CaptureDevice for FaultyDevice {
    fn grab(&mut self) -> Result<(), DeviceError> {
        let frame = self.grabs.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Some(Fault::GrabError) if frame == self.at_frame => {
                return Err(DeviceError::Grab {
                    camera_id: self.inner.config().camera_id,
                    reason: "sensor disconnected".into(),
                })
            }
            Some(Fault::Hang(duration)) if frame == self.at_frame => thread::sleep(duration),
            _ => {}
        }
        self.inner.grab()
    }

    fn retrieve(&mut self, out: &mut [u8]) -> Result<(), DeviceError> {
        self.inner.retrieve(out)
    }

    fn apply_config(&mut self, config: &CameraConfig) -> Result<(), DeviceError> {
        self.inner.apply_config(config)
    }
}

impl DeviceFactory for FaultyFactory {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        Ok(Box::new(FaultyDevice {
            inner: SyntheticDevice::open(config)?,
            grabs: Arc::new(AtomicU64::new(0)),
            at_frame: self.at_frame,
            fault: (config.camera_id == self.camera_id).then_some(self.fault),
        }))
    }
}
