//! Rollup resolutions and the bucket arithmetic built on them
//!
//! A rollup is a bucket width in seconds paired with a retention, expressed as
//! the number of buckets -- 'samples' -- kept at that width. Every timestamp
//! `t` belongs to exactly one bucket per rollup, identified by its epoch:
//!
//! ```text
//! epoch(t, width) = floor(t / width) * width
//! ```
//!
//! Epochs are fixed points of this function, so callers may hand an epoch
//! back in wherever a timestamp is expected.
//!
//! Nothing here holds state. [`Rollups`] is the validated, ascending set of
//! configured rollups and every query planning decision is a pure function of
//! it, the requested range and 'now'.

use std::{
    collections::BTreeMap,
    num::{NonZeroU32, NonZeroU64},
};

use serde::{Deserialize, Serialize};

/// Errors produced by [`Rollups`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No rollups were configured.
    #[error("At least one rollup must be configured")]
    NoRollups,
    /// The same width appears more than once.
    #[error("Rollup width {width}s configured more than once")]
    DuplicateRollup {
        /// The repeated width, in seconds
        width: u64,
    },
    /// A duration retention of zero seconds.
    #[error("Retention for rollup width {width}s must not be zero seconds")]
    ZeroRetention {
        /// The width whose retention is zero, in seconds
        width: u64,
    },
    /// An explicitly requested rollup is not configured.
    #[error("Rollup width {width}s is not configured")]
    UnknownRollup {
        /// The requested width, in seconds
        width: u64,
    },
}

/// How much history a rollup keeps.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Retention {
    /// Keep this many buckets.
    Samples(NonZeroU32),
    /// Keep enough buckets to span this many seconds.
    Seconds(u64),
}

impl Retention {
    /// Number of buckets this retention amounts to at `width`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroRetention`] for a zero-second retention.
    pub fn samples(self, width: NonZeroU64) -> Result<NonZeroU32, Error> {
        match self {
            Retention::Samples(samples) => Ok(samples),
            Retention::Seconds(seconds) => {
                let samples = seconds.div_ceil(width.get());
                let samples = u32::try_from(samples).unwrap_or(u32::MAX);
                NonZeroU32::new(samples).ok_or(Error::ZeroRetention { width: width.get() })
            }
        }
    }
}

/// A single configured resolution.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Rollup {
    width: NonZeroU64,
    samples: NonZeroU32,
}

impl Rollup {
    /// Create a new [`Rollup`] of `width` seconds keeping `samples` buckets.
    #[must_use]
    pub fn new(width: NonZeroU64, samples: NonZeroU32) -> Self {
        Self { width, samples }
    }

    /// Create a new [`Rollup`] from a [`Retention`] policy.
    ///
    /// # Errors
    ///
    /// See [`Retention::samples`].
    pub fn with_retention(width: NonZeroU64, retention: Retention) -> Result<Self, Error> {
        Ok(Self::new(width, retention.samples(width)?))
    }

    /// Bucket width in seconds.
    #[must_use]
    pub fn width(&self) -> u64 {
        self.width.get()
    }

    /// Number of buckets retained.
    #[must_use]
    pub fn samples(&self) -> u32 {
        self.samples.get()
    }

    /// Seconds of history covered by the retained buckets.
    #[must_use]
    pub fn lifespan(&self) -> u64 {
        self.width().saturating_mul(u64::from(self.samples()))
    }

    /// The epoch of the bucket containing `timestamp`.
    #[must_use]
    pub fn normalize(&self, timestamp: u64) -> u64 {
        normalize_to_rollup(timestamp, self.width)
    }

    /// The epoch of the oldest bucket retained as of `timestamp`.
    #[must_use]
    pub fn earliest_timestamp(&self, timestamp: u64) -> u64 {
        let history = self
            .width()
            .saturating_mul(u64::from(self.samples()).saturating_sub(1));
        self.normalize(timestamp.saturating_sub(history))
    }

    /// Every epoch of this rollup covering `[start, end]`, ascending.
    #[must_use]
    pub fn series(&self, start: u64, end: u64) -> Vec<u64> {
        series(start, end, self.width)
    }
}

/// Normalize `timestamp` to the start of its bucket at `width`.
///
/// Idempotent: normalizing an epoch at the same width returns it unchanged.
#[inline]
#[must_use]
pub fn normalize_to_rollup(timestamp: u64, width: NonZeroU64) -> u64 {
    (timestamp / width.get()) * width.get()
}

/// Every bucket epoch at `width` covering `[start, end]`, ascending.
///
/// Both boundary buckets are included. An inverted range is empty.
#[must_use]
pub fn series(start: u64, end: u64, width: NonZeroU64) -> Vec<u64> {
    if start > end {
        return Vec::new();
    }
    let first = normalize_to_rollup(start, width);
    let last = normalize_to_rollup(end, width);

    let mut epochs = Vec::new();
    let mut epoch = first;
    loop {
        epochs.push(epoch);
        if epoch >= last {
            break;
        }
        match epoch.checked_add(width.get()) {
            Some(next) => epoch = next,
            None => break,
        }
    }
    epochs
}

/// The validated set of configured rollups, ascending by width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollups {
    inner: Vec<Rollup>,
}

impl Rollups {
    /// Create a new [`Rollups`], sorting by width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRollups`] if `rollups` is empty and
    /// [`Error::DuplicateRollup`] if two rollups share a width.
    pub fn new<I>(rollups: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Rollup>,
    {
        let mut inner: Vec<Rollup> = rollups.into_iter().collect();
        if inner.is_empty() {
            return Err(Error::NoRollups);
        }
        inner.sort_by_key(Rollup::width);
        if let Some(pair) = inner.windows(2).find(|pair| pair[0].width == pair[1].width) {
            return Err(Error::DuplicateRollup {
                width: pair[0].width(),
            });
        }
        Ok(Self { inner })
    }

    /// Iterate the rollups from finest to coarsest.
    pub fn iter(&self) -> std::slice::Iter<'_, Rollup> {
        self.inner.iter()
    }

    /// Number of configured rollups. Never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Always false, a [`Rollups`] cannot be constructed empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Look up the rollup configured at `width`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRollup`] if no rollup has that width.
    pub fn get(&self, width: u64) -> Result<&Rollup, Error> {
        self.inner
            .iter()
            .find(|rollup| rollup.width() == width)
            .ok_or(Error::UnknownRollup { width })
    }

    /// The coarsest configured rollup.
    #[must_use]
    pub fn coarsest(&self) -> &Rollup {
        // construction guarantees at least one element
        &self.inner[self.inner.len() - 1]
    }

    /// The finest rollup whose retention reaches back to `start` from `now`.
    ///
    /// Falls back to the coarsest rollup when none does.
    #[must_use]
    pub fn optimal_rollup(&self, start: u64, now: u64) -> &Rollup {
        let elapsed = now.saturating_sub(start);
        self.inner
            .iter()
            .find(|rollup| rollup.lifespan() >= elapsed)
            .unwrap_or_else(|| self.coarsest())
    }

    /// The `(width, epoch)` of the bucket holding `timestamp` in every rollup.
    /// A write lands in all of them.
    #[must_use]
    pub fn placements(&self, timestamp: u64) -> Vec<(u64, u64)> {
        self.inner
            .iter()
            .map(|rollup| (rollup.width(), rollup.normalize(timestamp)))
            .collect()
    }

    /// Resolve the rollup and bucket epochs a query over `[start, end]` reads.
    ///
    /// An explicit `rollup` is used as given, otherwise see
    /// [`Rollups::optimal_rollup`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRollup`] if `rollup` is not configured.
    pub fn optimal_series(
        &self,
        start: u64,
        end: u64,
        rollup: Option<u64>,
        now: u64,
    ) -> Result<(u64, Vec<u64>), Error> {
        let rollup = match rollup {
            Some(width) => self.get(width)?,
            None => self.optimal_rollup(start, now),
        };
        Ok((rollup.width(), rollup.series(start, end)))
    }

    /// Bucket epochs for every rollup at once, keyed by width.
    ///
    /// * `start` and `end` given: that range.
    /// * only `timestamp` given: the single instant `timestamp`.
    /// * `start` without `end`: `[start, now]`.
    /// * nothing given: each rollup's retention window ending `now`.
    #[must_use]
    pub fn active_series(
        &self,
        start: Option<u64>,
        end: Option<u64>,
        timestamp: Option<u64>,
        now: u64,
    ) -> BTreeMap<u64, Vec<u64>> {
        self.inner
            .iter()
            .map(|rollup| {
                let (start, end) = match (start, end, timestamp) {
                    (None, None, Some(timestamp)) => (timestamp, timestamp),
                    (Some(start), end, _) => (start, end.unwrap_or(now)),
                    (None, end, _) => {
                        let end = end.unwrap_or(now);
                        (rollup.earliest_timestamp(end), end)
                    }
                };
                (rollup.width(), rollup.series(start, end))
            })
            .collect()
    }

    /// Each rollup's full retention window ending at `timestamp`, keyed by
    /// width.
    #[must_use]
    pub fn retained_series(&self, timestamp: u64) -> BTreeMap<u64, Vec<u64>> {
        self.inner
            .iter()
            .map(|rollup| {
                (
                    rollup.width(),
                    rollup.series(rollup.earliest_timestamp(timestamp), timestamp),
                )
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a Rollups {
    type Item = &'a Rollup;
    type IntoIter = std::slice::Iter<'a, Rollup>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rollup(width: u64, samples: u32) -> Rollup {
        Rollup::new(
            NonZeroU64::new(width).expect("non-zero width"),
            NonZeroU32::new(samples).expect("non-zero samples"),
        )
    }

    // 10s for an hour, 1h for a day, 1d for thirty days
    fn standard() -> Rollups {
        Rollups::new([rollup(3600, 24), rollup(10, 360), rollup(86_400, 30)])
            .expect("valid rollups")
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(timestamp in any::<u64>(), width in 1u64..1_000_000) {
            let width = NonZeroU64::new(width).expect("non-zero");
            let once = normalize_to_rollup(timestamp, width);
            prop_assert_eq!(normalize_to_rollup(once, width), once);
            prop_assert!(once <= timestamp);
            prop_assert!(timestamp - once < width.get());
        }

        #[test]
        fn series_covers_range_without_gaps(
            start in 0u64..10_000_000,
            span in 0u64..100_000,
            width in 1u64..10_000,
        ) {
            let width = NonZeroU64::new(width).expect("non-zero");
            let end = start + span;
            let epochs = series(start, end, width);

            prop_assert_eq!(epochs.first().copied(), Some(normalize_to_rollup(start, width)));
            prop_assert_eq!(epochs.last().copied(), Some(normalize_to_rollup(end, width)));
            for pair in epochs.windows(2) {
                prop_assert_eq!(pair[1] - pair[0], width.get());
            }
            for epoch in &epochs {
                prop_assert_eq!(normalize_to_rollup(*epoch, width), *epoch);
            }
        }

        #[test]
        fn optimal_rollup_is_finest_covering(start in 0u64..2_000_000, now in 0u64..2_000_000) {
            let rollups = standard();
            let chosen = rollups.optimal_rollup(start, now);
            let elapsed = now.saturating_sub(start);
            if chosen.lifespan() >= elapsed {
                for finer in rollups.iter().take_while(|r| r.width() < chosen.width()) {
                    prop_assert!(finer.lifespan() < elapsed);
                }
            } else {
                prop_assert_eq!(chosen, rollups.coarsest());
            }
        }
    }

    #[test]
    fn series_includes_both_boundaries() {
        let width = NonZeroU64::new(60).expect("non-zero");
        assert_eq!(series(59, 61, width), vec![0, 60]);
        assert_eq!(series(60, 60, width), vec![60]);
        assert_eq!(series(1_000, 1_200, width), vec![960, 1020, 1080, 1140, 1200]);
    }

    #[test]
    fn inverted_range_is_empty() {
        let width = NonZeroU64::new(60).expect("non-zero");
        assert!(series(120, 60, width).is_empty());
    }

    #[test]
    fn series_stops_at_u64_max() {
        let width = NonZeroU64::new(10).expect("non-zero");
        let epochs = series(u64::MAX - 25, u64::MAX, width);
        assert_eq!(epochs.last().copied(), Some(normalize_to_rollup(u64::MAX, width)));
        assert_eq!(epochs.len(), 3);
    }

    #[test]
    fn rollups_are_sorted() {
        let widths: Vec<u64> = standard().iter().map(Rollup::width).collect();
        assert_eq!(widths, vec![10, 3600, 86_400]);
    }

    #[test]
    fn empty_rollups_rejected() {
        assert_eq!(Rollups::new(Vec::<Rollup>::new()), Err(Error::NoRollups));
    }

    #[test]
    fn duplicate_rollups_rejected() {
        assert_eq!(
            Rollups::new([rollup(60, 10), rollup(3600, 1), rollup(60, 5)]),
            Err(Error::DuplicateRollup { width: 60 })
        );
    }

    #[test]
    fn unknown_explicit_rollup_rejected() {
        assert_eq!(
            standard().optimal_series(0, 100, Some(60), 100),
            Err(Error::UnknownRollup { width: 60 })
        );
    }

    #[test]
    fn retention_seconds_rounds_up() {
        let width = NonZeroU64::new(3600).expect("non-zero");
        assert_eq!(Retention::Seconds(3600).samples(width).map(NonZeroU32::get), Ok(1));
        assert_eq!(Retention::Seconds(3601).samples(width).map(NonZeroU32::get), Ok(2));
        assert_eq!(
            Retention::Seconds(0).samples(width),
            Err(Error::ZeroRetention { width: 3600 })
        );
    }

    #[test]
    fn optimal_rollup_selection() {
        let rollups = standard();
        let now = 1_000_000;
        // within the hour of 10s buckets
        assert_eq!(rollups.optimal_rollup(now - 3600, now).width(), 10);
        // within a day of hourly buckets
        assert_eq!(rollups.optimal_rollup(now - 3601, now).width(), 3600);
        assert_eq!(rollups.optimal_rollup(now - 86_400, now).width(), 3600);
        // past every retention: coarsest
        assert_eq!(rollups.optimal_rollup(0, now * 10).width(), 86_400);
        // start in the future counts as no elapsed time
        assert_eq!(rollups.optimal_rollup(now + 50, now).width(), 10);
    }

    #[test]
    fn optimal_series_with_explicit_rollup() {
        let (width, epochs) = standard()
            .optimal_series(3599, 7201, Some(3600), 0)
            .expect("configured rollup");
        assert_eq!(width, 3600);
        assert_eq!(epochs, vec![0, 3600, 7200]);
    }

    #[test]
    fn earliest_timestamp_spans_samples() {
        let r = rollup(10, 360);
        // 359 full buckets before the bucket holding 'now'
        assert_eq!(r.earliest_timestamp(10_005), 10_000 - 3590);
        assert_eq!(r.series(r.earliest_timestamp(10_005), 10_005).len(), 360);
        assert_eq!(r.earliest_timestamp(5), 0);
    }

    #[test]
    fn placements_cover_every_rollup() {
        assert_eq!(
            standard().placements(90_061),
            vec![(10, 90_060), (3600, 90_000), (86_400, 86_400)]
        );
    }

    #[test]
    fn active_series_variants() {
        let rollups = Rollups::new([rollup(10, 3), rollup(60, 2)]).expect("valid rollups");
        let now = 600;

        let instant = rollups.active_series(None, None, Some(125), now);
        assert_eq!(instant[&10], vec![120]);
        assert_eq!(instant[&60], vec![120]);

        let range = rollups.active_series(Some(100), Some(130), None, now);
        assert_eq!(range[&10], vec![100, 110, 120, 130]);
        assert_eq!(range[&60], vec![60, 120]);

        let open = rollups.active_series(Some(580), None, None, now);
        assert_eq!(open[&10], vec![580, 590, 600]);

        let retained = rollups.active_series(None, None, None, now);
        assert_eq!(retained[&10], vec![580, 590, 600]);
        assert_eq!(retained[&60], vec![540, 600]);
        assert_eq!(retained, rollups.retained_series(now));
    }
}
