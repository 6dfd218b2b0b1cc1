//! Bounded discovery poll
//!
//! Re-enumerates at a fixed interval until an allow-listed device shows up,
//! the timeout elapses or the caller cancels.

use crate::backend::UsbBackend;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::registry::{Enumeration, Registry};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default pause between scans
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest single sleep, so cancellation is noticed promptly
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Pause between scans
    pub interval: Duration,
    /// Give up after this long; zero waits forever
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// At least one device is attached
    Found(Enumeration),
    TimedOut,
    Cancelled,
}

/// Poll the registry until a device is attached
///
/// Enumeration errors are returned immediately.
pub fn wait_for_devices<B: UsbBackend>(
    registry: &Registry<B>,
    options: PollOptions,
    cancel: &CancelToken,
) -> Result<PollOutcome> {
    let started = Instant::now();
    let deadline = (!options.timeout.is_zero()).then(|| started + options.timeout);

    loop {
        if cancel.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }

        let snapshot = registry.enumerate()?;
        if !snapshot.is_empty() {
            debug!(
                "Found {} device(s) after {:?}",
                snapshot.count(),
                started.elapsed()
            );
            return Ok(PollOutcome::Found(snapshot));
        }

        let wake = Instant::now() + options.interval;
        if deadline.is_some_and(|deadline| wake > deadline) {
            return Ok(PollOutcome::TimedOut);
        }

        while Instant::now() < wake {
            if cancel.is_cancelled() {
                return Ok(PollOutcome::Cancelled);
            }
            let remaining = wake.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}
