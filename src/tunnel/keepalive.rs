//! Idle timeout and keepalive bookkeeping for a piping session
//!
//! In per-chunk mode every chunk pushes the deadline forward. Once the
//! session is moving sustained bulk data (several full-buffer reads in a
//! row) the deadline is left alone and only the activity time is recorded;
//! a timer that fires early just re-arms from the last activity. A gap
//! between chunks drops back to per-chunk mode.

use std::time::Duration;
use tokio::time::Instant;

/// Full-buffer reads in a row that switch to the fast path
const FAST_PATH_READS: u32 = 8;

/// Gap between chunks that ends the fast path
const FAST_PATH_GAP: Duration = Duration::from_millis(200);

/// Idle deadline tracker
#[derive(Debug, Clone)]
pub struct IdleTimer {
    idle: Duration,
    keepalive: Option<Duration>,
    probe_sent: bool,
    last_activity: Instant,
    deadline: Instant,
    full_reads: u32,
    fast: bool,
}

impl IdleTimer {
    pub fn new(idle: Duration) -> Self {
        let now = Instant::now();
        Self {
            idle,
            keepalive: None,
            probe_sent: false,
            last_activity: now,
            deadline: now + idle,
            full_reads: 0,
            fast: false,
        }
    }

    /// Allow a single keepalive probe after `interval` of silence
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        if !interval.is_zero() && interval < self.idle {
            self.keepalive = Some(interval);
        }
        self
    }

    /// Record a chunk of `len` bytes read into a buffer of `capacity`
    pub fn record(&mut self, len: usize, capacity: usize) {
        let now = Instant::now();
        if now.duration_since(self.last_activity) > FAST_PATH_GAP {
            self.full_reads = 0;
            self.fast = false;
        }
        if len >= capacity {
            self.full_reads = self.full_reads.saturating_add(1);
            if self.full_reads >= FAST_PATH_READS {
                self.fast = true;
            }
        } else {
            self.full_reads = 0;
        }

        self.last_activity = now;
        if !self.fast {
            self.deadline = now + self.idle;
        }
    }

    pub fn is_fast(&self) -> bool {
        self.fast
    }

    /// Next instant the session must wake up
    pub fn wake_at(&self) -> Instant {
        match self.probe_due_at() {
            Some(probe) => probe.min(self.deadline),
            None => self.deadline,
        }
    }

    fn probe_due_at(&self) -> Option<Instant> {
        match self.keepalive {
            Some(interval) if !self.probe_sent => Some(self.last_activity + interval),
            _ => None,
        }
    }

    /// Whether the keepalive probe should go out now; marks it sent
    pub fn take_probe(&mut self) -> bool {
        match self.probe_due_at() {
            Some(due) if Instant::now() >= due => {
                self.probe_sent = true;
                true
            }
            _ => false,
        }
    }

    /// Called when the wake time passes; `true` means the session is idle
    pub fn expired(&mut self) -> bool {
        let now = Instant::now();
        let real_deadline = self.last_activity + self.idle;
        if real_deadline > now {
            self.deadline = real_deadline;
            return false;
        }
        now >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_per_chunk_rearm() {
        let mut timer = IdleTimer::new(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(6)).await;
        timer.record(100, 1024);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!timer.expired());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(timer.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_path_and_fallback() {
        let mut timer = IdleTimer::new(Duration::from_secs(10));
        let before = timer.wake_at();
        for _ in 0..FAST_PATH_READS {
            timer.record(1024, 1024);
        }
        assert!(timer.is_fast());

        // Deadline no longer moves per chunk, but the activity still counts
        for _ in 0..50 {
            tokio::time::advance(Duration::from_millis(150)).await;
            timer.record(1024, 1024);
        }
        assert!(timer.is_fast());
        assert_eq!(timer.wake_at(), before);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!timer.expired());
        assert!(timer.wake_at() > before);

        tokio::time::advance(Duration::from_millis(300)).await;
        timer.record(1024, 1024);
        assert!(!timer.is_fast());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_keepalive_probe() {
        let mut timer = IdleTimer::new(Duration::from_secs(60)).with_keepalive(Duration::from_secs(20));
        assert!(!timer.take_probe());
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(timer.take_probe());
        assert!(!timer.take_probe());
        assert!(!timer.expired());
    }

    #[test]
    fn test_keepalive_longer_than_idle_ignored() {
        let timer = IdleTimer::new(Duration::from_secs(10)).with_keepalive(Duration::from_secs(30));
        assert!(timer.keepalive.is_none());
    }
}
