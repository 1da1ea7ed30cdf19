//! Frame pacer
//!
//! Caps the capture-to-output relay rate by enforcing a minimum interval
//! between consecutive handoffs.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Time source used by the relay loop
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Suspend the calling thread
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant`] and [`std::thread::sleep`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Pacer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacerStats {
    /// Handoffs that went through the pacer
    pub frames_paced: u64,
    /// Handoffs that had to wait
    pub suspensions: u64,
}

/// Minimum inter-frame interval enforcement
pub struct FramePacer {
    interval: Option<Duration>,
    last_release: Option<Instant>,
    clock: Arc<dyn Clock>,
    stats: PacerStats,
}

impl FramePacer {
    /// `interval` of `None` disables pacing entirely.
    pub fn new(interval: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            last_release: None,
            clock,
            stats: PacerStats::default(),
        }
    }

    pub fn is_paced(&self) -> bool {
        self.interval.is_some()
    }

    /// Wait until the next frame may be released.
    ///
    /// The anchor for the next interval is re-read from the clock after the
    /// sleep, so oversleeping is not carried forward.
    pub fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        self.stats.frames_paced += 1;

        if let Some(last) = self.last_release {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < interval {
                let delay = interval - elapsed;
                trace!("Pacing: sleeping {:?}", delay);
                self.stats.suspensions += 1;
                self.clock.sleep(delay);
            }
        }
        self.last_release = Some(self.clock.now());
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::mock::ManualClock;

    #[test]
    fn test_unpaced_never_sleeps() {
        let clock = Arc::new(ManualClock::new());
        let mut pacer = FramePacer::new(None, clock.clone());
        for _ in 0..50 {
            pacer.pace();
        }
        assert!(!pacer.is_paced());
        assert!(clock.sleeps().is_empty());
        assert_eq!(pacer.stats(), PacerStats::default());
    }

    #[test]
    fn test_first_frame_is_not_delayed() {
        let clock = Arc::new(ManualClock::new());
        let mut pacer = FramePacer::new(Some(Duration::from_millis(40)), clock.clone());
        pacer.pace();
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_sleeps_for_remaining_interval() {
        let clock = Arc::new(ManualClock::new());
        let mut pacer = FramePacer::new(Some(Duration::from_millis(40)), clock.clone());
        pacer.pace();
        clock.advance(Duration::from_millis(15));
        pacer.pace();
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(25)]);
        assert_eq!(pacer.stats().suspensions, 1);
    }

    #[test]
    fn test_late_frame_is_not_delayed() {
        let clock = Arc::new(ManualClock::new());
        let mut pacer = FramePacer::new(Some(Duration::from_millis(40)), clock.clone());
        pacer.pace();
        clock.advance(Duration::from_millis(55));
        pacer.pace();
        assert!(clock.sleeps().is_empty());
        assert_eq!(pacer.stats().frames_paced, 2);
    }

    #[test]
    fn test_rate_converges_with_real_clock() {
        let mut pacer = FramePacer::new(Some(Duration::from_millis(10)), Arc::new(SystemClock));
        let start = Instant::now();
        for _ in 0..21 {
            pacer.pace();
        }
        // 20 intervals after the first release
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
    }
}
