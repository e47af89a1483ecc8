//! Recording sink that writes raw frames and timestamps to disk

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use flume::Receiver;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::CameraId;
use crate::pipeline::payload::MultiFramePayload;
use crate::pipeline::sink::RecordingMessage;

pub const TIMESTAMPS_FILE: &str = "timestamps.csv";
pub const SUMMARY_FILE: &str = "recording_summary.json";

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recording i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to write timestamps: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to write summary: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct TimestampRow {
    cycle_number: u64,
    camera_id: CameraId,
    frame_number: u64,
    pre_grab_ns: u64,
    post_grab_ns: u64,
    post_retrieve_ns: u64,
    ns_from_recording_start: u64,
    unix_ns: u64,
    cycle_grab_skew_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSummary {
    pub camera_id: CameraId,
    pub width: u64,
    pub height: u64,
    pub color_channels: u64,
    pub frames: u64,
    pub raw_file: String,
    pub mean_frames_per_second: Option<f64>,
}

/// Written as `recording_summary.json` when a session is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub session: String,
    pub cycles: u64,
    pub first_cycle: Option<u64>,
    pub last_cycle: Option<u64>,
    pub started_unix_ns: u64,
    pub duration_ns: u64,
    pub mean_grab_skew_ns: f64,
    pub max_grab_skew_ns: u64,
    pub cameras: Vec<CameraSummary>,
}

struct CameraStream {
    file: BufWriter<File>,
    raw_file: String,
    geometry: (u64, u64, u64),
    frames: u64,
    first_grab_ns: u64,
    last_grab_ns: u64,
}

struct Session {
    name: String,
    dir: PathBuf,
    streams: BTreeMap<CameraId, CameraStream>,
    timestamps: csv::Writer<File>,
    started_monotonic_ns: Option<u64>,
    started_unix_ns: u64,
    last_grab_ns: u64,
    first_cycle: Option<u64>,
    last_cycle: Option<u64>,
    cycles: u64,
    skew_total_ns: u128,
    max_skew_ns: u64,
}

/// Writes each recording session into its own directory under `root`:
/// one `cam<id>.raw` stream of concatenated images per camera, a
/// `timestamps.csv` row per frame and a JSON summary.
pub struct DiskRecorder {
    root: PathBuf,
    session: Option<Session>,
    sessions_started: usize,
}

impl DiskRecorder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            session: None,
            sessions_started: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Returns the summary when the message closed a session.
    pub fn handle(&mut self, message: RecordingMessage) -> Result<Option<RecordingSummary>, RecorderError> {
        match message {
            RecordingMessage::Payload(payload) => {
                self.write_payload(&payload)?;
                Ok(None)
            }
            RecordingMessage::Finalize => self.finalize(),
        }
    }

    pub fn write_payload(&mut self, payload: &MultiFramePayload) -> Result<(), RecorderError> {
        if self.session.is_none() {
            self.session = Some(self.open_session()?);
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let skew = payload.grab_skew_ns();
        let cycle_start = payload
            .frames
            .values()
            .map(|f| f.metadata.post_grab_ns)
            .min()
            .unwrap_or_default();
        let started = *session.started_monotonic_ns.get_or_insert(cycle_start);

        for (&camera_id, frame) in &payload.frames {
            let meta = &frame.metadata;
            let stream = match session.streams.entry(camera_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let raw_file = format!("cam{camera_id}.raw");
                    let file = BufWriter::new(File::create(session.dir.join(&raw_file))?);
                    entry.insert(CameraStream {
                        file,
                        raw_file,
                        geometry: (meta.width, meta.height, meta.color_channels),
                        frames: 0,
                        first_grab_ns: meta.post_grab_ns,
                        last_grab_ns: meta.post_grab_ns,
                    })
                }
            };
            stream.file.write_all(&frame.image)?;
            stream.frames += 1;
            stream.last_grab_ns = meta.post_grab_ns;

            session.timestamps.serialize(TimestampRow {
                cycle_number: payload.cycle_number,
                camera_id,
                frame_number: meta.frame_number,
                pre_grab_ns: meta.pre_grab_ns,
                post_grab_ns: meta.post_grab_ns,
                post_retrieve_ns: meta.post_retrieve_ns,
                ns_from_recording_start: meta.post_grab_ns.saturating_sub(started),
                unix_ns: payload.timebase.to_unix_ns(meta.post_grab_ns),
                cycle_grab_skew_ns: skew,
            })?;
            session.last_grab_ns = session.last_grab_ns.max(meta.post_grab_ns);
        }

        if session.first_cycle.is_none() {
            session.first_cycle = Some(payload.cycle_number);
            session.started_unix_ns = payload.timebase.to_unix_ns(cycle_start);
        }
        session.last_cycle = Some(payload.cycle_number);
        session.cycles += 1;
        session.skew_total_ns += skew as u128;
        session.max_skew_ns = session.max_skew_ns.max(skew);
        Ok(())
    }

    /// Flushes and closes the current session. A finalize with no open session is a no-op.
    pub fn finalize(&mut self) -> Result<Option<RecordingSummary>, RecorderError> {
        let Some(mut session) = self.session.take() else {
            debug!("finalize without an open recording session");
            return Ok(None);
        };

        session.timestamps.flush()?;
        let mut cameras = Vec::with_capacity(session.streams.len());
        for (&camera_id, stream) in session.streams.iter_mut() {
            stream.file.flush()?;
            let span_ns = stream.last_grab_ns.saturating_sub(stream.first_grab_ns);
            cameras.push(CameraSummary {
                camera_id,
                width: stream.geometry.0,
                height: stream.geometry.1,
                color_channels: stream.geometry.2,
                frames: stream.frames,
                raw_file: stream.raw_file.clone(),
                mean_frames_per_second: (stream.frames > 1 && span_ns > 0)
                    .then(|| (stream.frames - 1) as f64 / (span_ns as f64 / 1e9)),
            });
        }

        let summary = RecordingSummary {
            session: session.name.clone(),
            cycles: session.cycles,
            first_cycle: session.first_cycle,
            last_cycle: session.last_cycle,
            started_unix_ns: session.started_unix_ns,
            duration_ns: session
                .last_grab_ns
                .saturating_sub(session.started_monotonic_ns.unwrap_or(session.last_grab_ns)),
            mean_grab_skew_ns: if session.cycles == 0 {
                0.0
            } else {
                session.skew_total_ns as f64 / session.cycles as f64
            },
            max_grab_skew_ns: session.max_skew_ns,
            cameras,
        };
        let mut file = BufWriter::new(File::create(session.dir.join(SUMMARY_FILE))?);
        serde_json::to_writer_pretty(&mut file, &summary)?;
        file.flush()?;
        info!(
            session = %summary.session,
            cycles = summary.cycles,
            "recording finalized"
        );
        Ok(Some(summary))
    }

    fn open_session(&mut self) -> Result<Session, RecorderError> {
        fs::create_dir_all(&self.root)?;
        // Earlier recorders (previous runs, or routers replaced by a reset) may share the root
        let (name, dir) = loop {
            self.sessions_started += 1;
            let name = format!("session-{:03}", self.sessions_started);
            let dir = self.root.join(&name);
            match fs::create_dir(&dir) {
                Ok(()) => break (name, dir),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        };
        let timestamps = csv::Writer::from_path(dir.join(TIMESTAMPS_FILE))?;
        info!(dir = %dir.display(), "recording session opened");
        Ok(Session {
            name,
            dir,
            streams: BTreeMap::new(),
            timestamps,
            started_monotonic_ns: None,
            started_unix_ns: 0,
            last_grab_ns: 0,
            first_cycle: None,
            last_cycle: None,
            cycles: 0,
            skew_total_ns: 0,
            max_skew_ns: 0,
        })
    }

    /// Consumes messages until every sender is gone, then finalizes any open session.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub fn run(mut self, receiver: Receiver<RecordingMessage>) -> Result<Vec<RecordingSummary>, RecorderError> {
        let mut summaries = Vec::new();
        for message in receiver.iter() {
            match self.handle(message) {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {}
                Err(err) => {
                    error!(%err, "recording failed, dropping session");
                    self.session = None;
                    return Err(err);
                }
            }
        }
        if self.is_recording() {
            warn!("recording queue closed mid-session, finalizing");
        }
        if let Some(summary) = self.finalize()? {
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Runs the recorder on its own thread.
    pub fn spawn(
        self,
        receiver: Receiver<RecordingMessage>,
    ) -> io::Result<JoinHandle<Result<Vec<RecordingSummary>, RecorderError>>> {
        thread::Builder::new()
            .name("camsync-recorder".into())
            .spawn(move || self.run(receiver))
    }
}
