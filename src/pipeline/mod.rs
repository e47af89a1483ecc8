pub mod frame_buffer;
pub mod payload;
pub mod recorder;
pub mod router;
pub mod sink;

pub use frame_buffer::{FrameBuffer, FrameBufferNames, FrameView};
pub use payload::MultiFramePayload;
pub use recorder::{DiskRecorder, RecorderError, RecordingSummary};
pub use router::{run_router, FrameRouter};
pub use sink::{GroupSinks, RecordingMessage, SinkReceivers};
