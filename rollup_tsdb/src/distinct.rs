//! Distinct-value sets
//!
//! Each bucket holds the exact set of members recorded into it. Queries only
//! ever report cardinalities, in three shapes:
//!
//! * series: the size of each bucket on its own. A member recorded into two
//!   buckets counts once in each.
//! * totals: the size of the union of a key's buckets.
//! * union: the size of the union across every requested key and bucket.
//!
//! It follows that `union(keys) >= max(totals(key))` for any keys, with
//! equality for a single key.

use std::{collections::BTreeMap, num::NonZeroUsize};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::{
    environment::{self, EnvironmentId},
    store::{Aggregate, BucketStore, Ident, Slice},
};

impl<V> Aggregate for FxHashSet<V>
where
    V: Ident,
{
    fn merge(&mut self, other: Self) {
        if self.is_empty() {
            *self = other;
        } else {
            self.extend(other);
        }
    }
}

/// Distinct sets for every series of every model.
#[derive(Debug)]
pub struct DistinctSet<M, K, V> {
    store: BucketStore<M, K, FxHashSet<V>>,
}

impl<M, K, V> DistinctSet<M, K, V>
where
    M: Ident,
    K: Ident,
    V: Ident,
{
    /// Create a new, empty [`DistinctSet`].
    #[must_use]
    pub fn new(shards: NonZeroUsize) -> Self {
        Self {
            store: BucketStore::new(shards),
        }
    }

    /// Add `values` to the buckets at each `(rollup, epoch)` of `placements`,
    /// in both the `environment` slice and the global slice.
    pub fn record(
        &self,
        model: &M,
        key: &K,
        environment: Option<EnvironmentId>,
        placements: &[(u64, u64)],
        values: &[V],
    ) {
        for target in environment::write_targets(environment) {
            let slice = Slice::new(model.clone(), key.clone(), target);
            for (rollup, epoch) in placements {
                self.store.update(slice.clone().bucket(*rollup, *epoch), |set| {
                    set.extend(values.iter().cloned());
                });
            }
        }
        trace!(?model, ?key, ?environment, members = values.len(), "distinct members recorded");
    }

    /// Cardinality of each key's bucket at every epoch of `epochs`,
    /// ascending.
    #[must_use]
    pub fn series(
        &self,
        model: &M,
        keys: &[K],
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
    ) -> FxHashMap<K, Vec<(u64, usize)>> {
        keys.iter()
            .map(|key| {
                let mut bucket = Slice::new(model.clone(), key.clone(), environment).bucket(rollup, 0);
                let points = epochs
                    .iter()
                    .map(|epoch| {
                        bucket.epoch = *epoch;
                        (*epoch, self.store.read(&bucket, |set| set.map_or(0, FxHashSet::len)))
                    })
                    .collect();
                (key.clone(), points)
            })
            .collect()
    }

    /// Cardinality of the union of each key's buckets across `epochs`.
    #[must_use]
    pub fn totals(
        &self,
        model: &M,
        keys: &[K],
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
    ) -> FxHashMap<K, usize> {
        keys.iter()
            .map(|key| {
                let mut members = FxHashSet::default();
                self.collect(&mut members, model, key, environment, rollup, epochs);
                (key.clone(), members.len())
            })
            .collect()
    }

    /// Cardinality of the union across every key of `keys` and every bucket
    /// of `epochs`.
    #[must_use]
    pub fn union(
        &self,
        model: &M,
        keys: &[K],
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
    ) -> usize {
        let mut members = FxHashSet::default();
        for key in keys {
            self.collect(&mut members, model, key, environment, rollup, epochs);
        }
        members.len()
    }

    fn collect(
        &self,
        members: &mut FxHashSet<V>,
        model: &M,
        key: &K,
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
    ) {
        let mut bucket = Slice::new(model.clone(), key.clone(), environment).bucket(rollup, 0);
        for epoch in epochs {
            bucket.epoch = *epoch;
            self.store.read(&bucket, |set| {
                if let Some(set) = set {
                    members.extend(set.iter().cloned());
                }
            });
        }
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

    /// Union the buckets of `sources` into `destination`, emptying the
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

    /// Drop every set.
    pub fn clear(&self) {
        self.store.clear();
    }
}
