//! Queues that decouple the router from recording and display consumers

use std::sync::Arc;

use flume::{Receiver, Sender};

use crate::pipeline::payload::MultiFramePayload;

#[derive(Debug, Clone)]
pub enum RecordingMessage {
    Payload(Arc<MultiFramePayload>),
    /// The recording session ended; flush and close outputs.
    Finalize,
}

/// Producer ends handed to the router.
#[derive(Debug, Clone, Default)]
pub struct GroupSinks {
    /// Bounded, blocking. The router applies backpressure here.
    pub recording: Option<Sender<RecordingMessage>>,
    /// Bounded, lossy. Full queues drop the payload.
    pub live_view: Option<Sender<Arc<MultiFramePayload>>>,
}

/// Consumer ends matching [`GroupSinks::bounded`].
#[derive(Debug)]
pub struct SinkReceivers {
    pub recording: Receiver<RecordingMessage>,
    pub live_view: Receiver<Arc<MultiFramePayload>>,
}

impl GroupSinks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bounded(recording_capacity: usize, live_view_capacity: usize) -> (Self, SinkReceivers) {
        let (rec_tx, rec_rx) = flume::bounded(recording_capacity);
        let (live_tx, live_rx) = flume::bounded(live_view_capacity);
        (
            Self {
                recording: Some(rec_tx),
                live_view: Some(live_tx),
            },
            SinkReceivers {
                recording: rec_rx,
                live_view: live_rx,
            },
        )
    }
}
