//! Counter series
//!
//! The simplest aggregate: a non-negative integer per bucket. Increments are
//! associative and commutative, which is what lets concurrent writers and
//! merges fold into a bucket in any order. Sums saturate at `u64::MAX` rather
//! than wrap.

use std::{collections::BTreeMap, num::NonZeroUsize};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{
    environment::{self, EnvironmentId},
    store::{Aggregate, BucketStore, Ident, Slice},
};

impl Aggregate for u64 {
    fn merge(&mut self, other: Self) {
        *self = self.saturating_add(other);
    }
}

/// Counters for every series of every model.
#[derive(Debug)]
pub struct CounterSeries<M, K> {
    store: BucketStore<M, K, u64>,
}

impl<M, K> CounterSeries<M, K>
where
    M: Ident,
    K: Ident,
{
    /// Create a new, empty [`CounterSeries`].
    #[must_use]
    pub fn new(shards: NonZeroUsize) -> Self {
        Self {
            store: BucketStore::new(shards),
        }
    }

    /// Add `count` to the buckets at each `(rollup, epoch)` of `placements`,
    /// in both the `environment` slice and the global slice.
    pub fn incr(
        &self,
        model: &M,
        key: &K,
        environment: Option<EnvironmentId>,
        placements: &[(u64, u64)],
        count: u64,
    ) {
        for target in environment::write_targets(environment) {
            let slice = Slice::new(model.clone(), key.clone(), target);
            for (rollup, epoch) in placements {
                self.store
                    .update(slice.clone().bucket(*rollup, *epoch), |value| value.merge(count));
            }
        }
        trace!(?model, ?key, ?environment, count, "counter incremented");
    }

    /// Counts of each key at every epoch of `epochs`, ascending. Missing
    /// buckets count zero.
    #[must_use]
    pub fn range(
        &self,
        model: &M,
        keys: &[K],
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
    ) -> FxHashMap<K, Vec<(u64, u64)>> {
        keys.iter()
            .map(|key| {
                let mut bucket = Slice::new(model.clone(), key.clone(), environment).bucket(rollup, 0);
                let points = epochs
                    .iter()
                    .map(|epoch| {
                        bucket.epoch = *epoch;
                        (*epoch, self.store.read(&bucket, |v| v.copied().unwrap_or(0)))
                    })
                    .collect();
                (key.clone(), points)
            })
            .collect()
    }

    /// Sum of each key's counts across `epochs`.
    #[must_use]
    pub fn sums(
        &self,
        model: &M,
        keys: &[K],
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
    ) -> FxHashMap<K, u64> {
        self.range(model, keys, environment, rollup, epochs)
            .into_iter()
            .map(|(key, points)| {
                let total = points
                    .into_iter()
                    .fold(0_u64, |acc, (_, count)| acc.saturating_add(count));
                (key, total)
            })
            .collect()
    }

    /// Remove the buckets of each model and key in `series`. Returns the
    /// number of buckets removed.
    #[must_use]
    pub fn delete(
        &self,
        models: &[M],
        keys: &[K],
        environments: &[Option<EnvironmentId>],
        series: &BTreeMap<u64, Vec<u64>>,
    ) -> usize {
        let mut removed = 0;
        for model in models {
            for key in keys {
                removed += self.store.delete_series(model, key, environments, series);
            }
        }
        removed
    }

    /// Sum the buckets of `sources` into `destination`, emptying the
    /// sources. Returns the number of buckets moved.
    #[must_use]
    pub fn merge(
        &self,
        model: &M,
        destination: &K,
        sources: &[K],
        environments: &[Option<EnvironmentId>],
    ) -> usize {
        self.store
            .merge_series(model, destination, sources, environments)
    }

    /// Drop every counter.
    pub fn clear(&self) {
        self.store.clear();
    }
}
