//! Elapsed-time accumulator.
//!
//! A [`Timer`] sums wall-clock time over any number of start/stop cycles.
//! Only completed cycles count: while the timer is running, the time since
//! the last `start()` is not yet visible through [`Timer::elapsed`].

use std::time::{Duration, Instant};

/// Monotonic elapsed-time accumulator with an IDLE/RUNNING state.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    /// Accumulated time over completed cycles.
    total: Duration,
    /// Start of the current cycle, `Some` while running.
    started: Option<Instant>,
}

impl Timer {
    /// Creates an idle timer with zero accumulated time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new cycle.
    ///
    /// Calling this while the timer is already running restarts the current
    /// cycle; callers are expected to pair every `start()` with a `stop()`.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Ends the current cycle and adds its duration to the total.
    ///
    /// Returns the duration of the cycle just ended, or zero if the timer
    /// was idle.
    pub fn stop(&mut self) -> Duration {
        match self.started.take() {
            Some(start) => {
                let delta = start.elapsed();
                self.total += delta;
                delta
            }
            None => Duration::ZERO,
        }
    }

    /// Resets the total to zero and forces the timer idle.
    pub fn clear(&mut self) {
        self.total = Duration::ZERO;
        self.started = None;
    }

    /// Adds an externally measured duration to the total.
    pub fn add(&mut self, delta: Duration) {
        self.total += delta;
    }

    /// Returns `true` between `start()` and `stop()`.
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Total time over completed cycles.
    pub fn elapsed(&self) -> Duration {
        self.total
    }

    /// Total time over completed cycles, in seconds.
    pub fn elapsed_secs(&self) -> f64 {
        self.total.as_secs_f64()
    }
}
