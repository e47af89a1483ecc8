//! Cross-process plumbing: shared memory regions, the control block, polling waits

pub mod control;
pub mod shm;
pub mod wait;

pub use control::{ControlBlock, GroupFlag, KillSwitch, Signal, TriggerChannel, TriggerSnapshot};
pub use shm::{Access, SharedRegion};
pub use wait::{wait_until, WaitError, Waiter};
