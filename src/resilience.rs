//! Resilience utilities: retry backoff and the divergence window.
//!
//! Two protections keep a struggling system from thrashing:
//!
//! - [`RetryConfig`]: exponential backoff for catch-up requests, so a
//!   junior that cannot reach the senior does not hammer the network.
//! - [`DivergenceWindow`]: counts checksum divergences inside a sliding
//!   window. A single divergence is recoverable (full resync); repeated
//!   divergences in a short window mean the system itself is unstable and
//!   the peer should stop rather than resync forever.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Configuration for retry backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts. `usize::MAX` for never-give-up.
    pub max_attempts: usize,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff used for catch-up requests: quick first retry, capped at a
    /// few seconds (a fresh beacon retriggers anyway).
    pub fn catchup() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Sliding-window counter for checksum divergences.
///
/// [`record`](Self::record) returns true when the number of divergences
/// within `window` reaches `max_events` — the unstable-system signal.
#[derive(Debug)]
pub struct DivergenceWindow {
    max_events: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl DivergenceWindow {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            events: VecDeque::new(),
        }
    }

    /// Default policy: 3 divergences within 10 seconds.
    pub fn standard() -> Self {
        Self::new(3, Duration::from_secs(10))
    }

    /// Record a divergence at `now`. Returns true when the window is full
    /// and the system should be declared unstable.
    pub fn record(&mut self, now: Instant) -> bool {
        self.events.push_back(now);
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len() >= self.max_events
    }

    /// Divergences currently inside the window.
    pub fn count(&self) -> usize {
        self.events.len()
    }
}
