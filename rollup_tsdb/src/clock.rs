//! Sources of 'now'
//!
//! The engine needs the current time in two places: as the default timestamp
//! of a write and as the reference point for choosing a rollup. Both go
//! through [`Clock`] so that tests and replays can pin time.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// The `Clock` used by the engine, reporting unix seconds.
pub trait Clock: Send + Sync {
    /// The current time in seconds since the unix epoch.
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
/// A clock that operates with respect to real-clock time.
pub struct RealClock;

impl Clock for RealClock {
    /// Return the system time in unix seconds.
    ///
    /// A system clock set before the unix epoch reads as zero.
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a new [`ManualClock`] reading `now`.
    #[must_use]
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Set the clock to `now`. Time may move backward.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Relaxed);
    }

    /// Advance the clock by `seconds`, saturating at `u64::MAX`.
    pub fn advance(&self, seconds: u64) {
        // fetch_update with a closure that always returns Some cannot fail
        let _ = self
            .now
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |now| {
                Some(now.saturating_add(seconds))
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

impl<C> Clock for &C
where
    C: Clock,
{
    fn now(&self) -> u64 {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(60);
        assert_eq!(clock.now(), 1_060);
        clock.set(10);
        assert_eq!(clock.now(), 10);
        clock.set(u64::MAX - 1);
        clock.advance(10);
        assert_eq!(clock.now(), u64::MAX);
    }

    #[test]
    fn real_clock_is_past_2020() {
        // 2020-01-01T00:00:00Z
        assert!(RealClock.now() > 1_577_836_800);
    }
}
