use std::time::{Duration, Instant};

/// Time source for mute windows and rate limits.
///
/// Notification muting spans a whole day, so tests swap in `TestClock`
/// instead of waiting.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Time since `earlier`, zero if `earlier` lies in the future.
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Wall-time monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub const fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_clock {
    use std::sync::{Arc, Mutex, PoisonError};

    use super::{Clock, Duration, Instant};

    /// Clock that only moves when told to. Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct TestClock {
        origin: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        pub fn advance(&self, d: Duration) {
            let mut off = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
            *off = off.saturating_add(d);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn clones_advance_together() {
            let clock = TestClock::new();
            let view = clock.clone();
            let t0 = view.now();
            clock.advance(Duration::from_secs(24 * 3600));
            assert_eq!(view.elapsed_since(t0), Duration::from_secs(24 * 3600));
            // An instant ahead of the clock reads as no time passed.
            assert_eq!(view.elapsed_since(t0 + Duration::from_secs(1_000_000)), Duration::ZERO);
        }
    }
}
