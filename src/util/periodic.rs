use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// A recurring piece of work that is driven by the tick loop rather than by a timer of its own:
///  [PeriodicTask::poll] returns `true` at most once per interval.
///
/// Cancelling is final. Work that was already triggered by a previous `poll` is unaffected.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    next_due: Instant,
    cancelled: bool,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration) -> PeriodicTask {
        PeriodicTask {
            name,
            interval,
            next_due: Instant::now() + interval,
            cancelled: false,
        }
    }

    pub fn poll(&mut self) -> bool {
        if self.cancelled {
            return false;
        }

        let now = Instant::now();
        if now < self.next_due {
            return false;
        }
        self.next_due = now + self.interval;
        true
    }

    pub fn cancel(&mut self) {
        if !self.cancelled {
            debug!("cancelling periodic task {}", self.name);
        }
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_poll_once_per_interval() {
        let mut task = PeriodicTask::new("test", Duration::from_secs(1));
        assert!(!task.poll());

        advance(Duration::from_millis(999)).await;
        assert!(!task.poll());

        advance(Duration::from_millis(1)).await;
        assert!(task.poll());
        assert!(!task.poll());

        advance(Duration::from_secs(5)).await;
        assert!(task.poll());
        assert!(!task.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let mut task = PeriodicTask::new("test", Duration::from_secs(1));
        task.cancel();
        assert!(task.is_cancelled());

        advance(Duration::from_secs(2)).await;
        assert!(!task.poll());
    }
}
