//! Timestamp of the most recent filesystem activity in the watched folder.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared, monotonically non-decreasing activity timestamp.
///
/// Cloning yields another handle to the same record, so the watch adapter,
/// the stability sampler and the poller all observe one value.
#[derive(Debug, Clone, Default)]
pub struct ActivityClock {
    last_activity_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity observed at `observed_at`. Older timestamps never move
    /// the clock backwards. Returns the value stored after the update.
    pub fn record_activity(&self, observed_at: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self
            .last_activity_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = match *last {
            Some(current) if current >= observed_at => current,
            _ => observed_at,
        };
        *last = Some(next);
        next
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_activity_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Time elapsed since the last activity, or `None` when nothing has been
    /// recorded yet (treated as infinitely stale).
    pub fn since_last_activity(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_activity_at()
            .map(|last| (now - last).to_std().unwrap_or(Duration::ZERO))
    }

    /// True when the last activity happened less than `threshold` before `now`.
    pub fn is_active(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.since_last_activity(now)
            .is_some_and(|elapsed| elapsed < threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_never_recorded_is_infinitely_stale() {
        let clock = ActivityClock::new();
        assert_eq!(clock.last_activity_at(), None);
        assert_eq!(clock.since_last_activity(Utc::now()), None);
        assert!(!clock.is_active(Utc::now(), Duration::from_secs(3600)));
    }

    #[test]
    fn test_record_and_measure() {
        let clock = ActivityClock::new();
        let t0 = Utc::now();
        clock.record_activity(t0);
        let elapsed = clock
            .since_last_activity(t0 + TimeDelta::milliseconds(250))
            .unwrap();
        assert_eq!(elapsed, Duration::from_millis(250));
    }

    #[test]
    fn test_never_decreases() {
        let clock = ActivityClock::new();
        let base = Utc::now();
        let offsets = [5, 1, 9, 3, 9, 0, 12, 7];
        let mut high_water = None;
        for offset in offsets {
            let stored = clock.record_activity(base + TimeDelta::seconds(offset));
            if let Some(prev) = high_water {
                assert!(stored >= prev, "clock moved backwards");
            }
            high_water = Some(stored);
        }
        assert_eq!(
            clock.last_activity_at(),
            Some(base + TimeDelta::seconds(12))
        );
    }

    #[test]
    fn test_now_before_last_activity_reads_zero() {
        let clock = ActivityClock::new();
        let t0 = Utc::now();
        clock.record_activity(t0 + TimeDelta::seconds(10));
        assert_eq!(clock.since_last_activity(t0), Some(Duration::ZERO));
    }

    #[test]
    fn test_is_active_threshold_is_exclusive() {
        let clock = ActivityClock::new();
        let t0 = Utc::now();
        clock.record_activity(t0);
        let threshold = Duration::from_millis(1000);
        assert!(clock.is_active(t0 + TimeDelta::milliseconds(999), threshold));
        assert!(!clock.is_active(t0 + TimeDelta::milliseconds(1000), threshold));
    }

    #[test]
    fn test_clones_share_state() {
        let clock = ActivityClock::new();
        let other = clock.clone();
        let t0 = Utc::now();
        other.record_activity(t0);
        assert_eq!(clock.last_activity_at(), Some(t0));
    }

    #[test]
    fn test_concurrent_writers_keep_maximum() {
        let clock = ActivityClock::new();
        let base = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let clock = clock.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        clock.record_activity(base + TimeDelta::milliseconds(i * 100 + j));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            clock.last_activity_at(),
            Some(base + TimeDelta::milliseconds(799))
        );
    }
}
