use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::time::{clock_gettime, ClockId};
use serde::{Deserialize, Serialize};

/// Nanoseconds on `CLOCK_MONOTONIC`, comparable across processes on the same host.
pub fn monotonic_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        // CLOCK_MONOTONIC is always available on Linux
        Err(_) => 0,
    }
}

pub fn unix_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// One-time pairing of wall-clock and monotonic time, captured at session start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimebaseMapping {
    pub unix_ns: u64,
    pub monotonic_ns: u64,
}

impl TimebaseMapping {
    pub fn capture() -> Self {
        // Bracket the wall-clock read to halve the sampling error
        let before = monotonic_ns();
        let unix_ns = unix_ns();
        let after = monotonic_ns();
        Self {
            unix_ns,
            monotonic_ns: before + (after - before) / 2,
        }
    }

    /// Converts a monotonic timestamp to unix nanoseconds.
    pub fn to_unix_ns(&self, monotonic_ns: u64) -> u64 {
        if monotonic_ns >= self.monotonic_ns {
            self.unix_ns + (monotonic_ns - self.monotonic_ns)
        } else {
            self.unix_ns.saturating_sub(self.monotonic_ns - monotonic_ns)
        }
    }

    pub fn elapsed_since_start(&self, monotonic_ns: u64) -> Duration {
        Duration::from_nanos(monotonic_ns.saturating_sub(self.monotonic_ns))
    }
}

static SHM_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique POSIX shared memory name for this process, e.g. `/camsync-4242-3-1a2b-cam0-image`.
pub fn unique_shm_name(tag: &str) -> String {
    let seq = SHM_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let salt = unix_ns() & 0xff_ffff;
    format!("/camsync-{}-{}-{:x}-{}", std::process::id(), seq, salt, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        std::thread::sleep(Duration::from_millis(2));
        let b = monotonic_ns();
        assert!(b > a);
    }

    #[test]
    fn timebase_converts_both_directions() {
        let mapping = TimebaseMapping {
            unix_ns: 1_000_000,
            monotonic_ns: 500,
        };
        assert_eq!(mapping.to_unix_ns(1_500), 1_001_000);
        assert_eq!(mapping.to_unix_ns(0), 999_500);
        assert_eq!(mapping.elapsed_since_start(100), Duration::ZERO);
    }

    #[test]
    fn captured_timebase_is_close_to_now() {
        let mapping = TimebaseMapping::capture();
        let now = mapping.to_unix_ns(monotonic_ns());
        assert!(now.abs_diff(unix_ns()) < 50_000_000);
    }

    #[test]
    fn shm_names_are_unique_and_short() {
        let a = unique_shm_name("cam0-image");
        let b = unique_shm_name("cam0-image");
        assert_ne!(a, b);
        assert!(a.starts_with("/camsync-"));
        assert!(a.len() < 255);
    }
}
