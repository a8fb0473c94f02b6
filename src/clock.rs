//! Wall-clock time sources.
//!
//! Staleness windows and rate limits are measured in wall time, which keeps
//! advancing while the audio session is suspended (the audio clock does not).

use std::time::Instant;

/// A monotonic source of seconds.
pub trait Clock {
    fn now(&self) -> f64;
}

/// Real elapsed time since construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}
