//! Chart recompute throttle
//!
//! Trailing-edge debounce with a maximum wait: a burst of requests fires once,
//! `wait` after the last request, but never later than `max_wait` after the
//! first request of the burst.

use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Debounce {
    wait: Duration,
    max_wait: Duration,
    first_request: Option<Instant>,
    last_request: Option<Instant>,
}

impl Debounce {
    pub fn new(wait: Duration, max_wait: Duration) -> Self {
        Self {
            wait,
            max_wait: max_wait.max(wait),
            first_request: None,
            last_request: None,
        }
    }

    /// Note a recompute request
    pub fn request(&mut self, now: Instant) {
        self.first_request.get_or_insert(now);
        self.last_request = Some(now);
    }

    /// When the pending burst is due, if any
    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first_request?;
        let last = self.last_request?;
        Some((last + self.wait).min(first + self.max_wait))
    }

    /// Consume the pending burst if its deadline has passed
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.first_request = None;
                self.last_request = None;
                true
            }
            _ => false,
        }
    }
}
