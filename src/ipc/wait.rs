//! Adaptive polling for flags in shared memory

use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use thiserror::Error;

/// Sleep ceiling while a wait is expected to finish soon.
const BUSY_CEILING: Duration = Duration::from_micros(100);
/// After this long a wait is treated as idle and sleeps longer.
const IDLE_AFTER: Duration = Duration::from_millis(250);
const IDLE_CEILING: Duration = Duration::from_millis(5);
const FIRST_SLEEP: Duration = Duration::from_micros(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("kill flag raised while waiting")]
    Killed,
    #[error("timed out after {waited:?}")]
    TimedOut { waited: Duration },
}

/// Spin, then yield, then sleep with a growing interval.
pub struct Waiter {
    started: Instant,
    backoff: Backoff,
    sleep: Duration,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            backoff: Backoff::new(),
            sleep: FIRST_SLEEP,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Restarts the timeout clock without resetting the sleep interval.
    pub fn restart_clock(&mut self) {
        self.started = Instant::now();
    }

    pub fn snooze(&mut self) {
        if !self.backoff.is_completed() {
            self.backoff.snooze();
            return;
        }
        thread::sleep(self.sleep);
        let ceiling = if self.elapsed() < IDLE_AFTER {
            BUSY_CEILING
        } else {
            IDLE_CEILING
        };
        self.sleep = (self.sleep * 2).min(ceiling);
    }

    pub fn check_deadline(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        match timeout {
            Some(limit) if self.elapsed() >= limit => Err(WaitError::TimedOut {
                waited: self.elapsed(),
            }),
            _ => Ok(()),
        }
    }
}

/// Polls `ready` until it returns true, `killed` returns true, or `timeout` passes.
pub fn wait_until<F, K>(mut ready: F, killed: K, timeout: Option<Duration>) -> Result<(), WaitError>
where
    F: FnMut() -> bool,
    K: Fn() -> bool,
{
    let mut waiter = Waiter::new();
    loop {
        if ready() {
            return Ok(());
        }
        if killed() {
            return Err(WaitError::Killed);
        }
        waiter.check_deadline(timeout)?;
        waiter.snooze();
    }
}
