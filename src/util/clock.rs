use tokio::time::Instant;

/// Source of the timestamps exchanged in ping / pong messages, in seconds
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn current_time(&self) -> f64;
}

/// Seconds since the clock was created
pub struct MonotonicClock {
    start: Instant,
}
impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            start: Instant::now(),
        }
    }
}
impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
impl Clock for MonotonicClock {
    fn current_time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
