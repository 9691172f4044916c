use std::cell::RefCell;
use std::time::{Duration, Instant};

/// Ticks per second of the performance counter. Ticks are nanoseconds.
pub(crate) const PERFORMANCE_FREQUENCY: u64 = 1_000_000_000;

thread_local! {
    // The fast clock is not shareable between threads, so each thread keeps its own.
    static LOW_PRECISION_CLOCK: RefCell<fast_time::Clock> = RefCell::new(fast_time::Clock::new());
}

/// A monotonic clock that counts from the moment it was created.
///
/// The performance counter has full precision. Millisecond timestamps come from
/// [`fast_time::Clock`], which is cheap to query at high frequency but may lag by a few
/// milliseconds.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since the clock was created.
    pub(crate) fn performance_counter(&self) -> u64 {
        saturating_u64(self.epoch.elapsed().as_nanos())
    }

    /// Milliseconds since the clock was created.
    pub(crate) fn timestamp_ms(&self) -> u64 {
        saturating_u64(self.low_precision_elapsed().as_millis())
    }

    fn low_precision_elapsed(&self) -> Duration {
        let now: Instant = LOW_PRECISION_CLOCK
            .with_borrow_mut(|clock| clock.now())
            .into();

        now.saturating_duration_since(self.epoch)
    }
}

fn saturating_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn counters_move_forward() {
        let clock = Clock::new();

        let counter_before = clock.performance_counter();
        let timestamp_before = clock.timestamp_ms();

        thread::sleep(Duration::from_millis(50));

        assert!(clock.performance_counter() > counter_before);
        assert!(clock.timestamp_ms() > timestamp_before);
    }

    #[test]
    fn timestamp_is_close_to_precise_counter() {
        let clock = Clock::new();

        thread::sleep(Duration::from_millis(20));

        let timestamp_ms = clock.timestamp_ms();
        let counter_ms = clock.performance_counter() / 1_000_000;

        assert!(timestamp_ms.abs_diff(counter_ms) < 100);
    }

    #[test]
    fn timestamps_on_other_threads_share_the_epoch() {
        let clock = Clock::new();

        thread::sleep(Duration::from_millis(20));

        let elsewhere = thread::spawn(move || clock.timestamp_ms()).join().unwrap();

        assert!(elsewhere >= 10);
        assert!(elsewhere.abs_diff(clock.performance_counter() / 1_000_000) < 100);
    }

    #[test]
    fn saturates() {
        assert_eq!(saturating_u64(u128::MAX), u64::MAX);
        assert_eq!(saturating_u64(42), 42);
    }
}
