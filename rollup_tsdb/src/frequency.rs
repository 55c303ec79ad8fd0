//! Frequency tables
//!
//! Each bucket maps members to a score. Recording adds to a member's score,
//! as does merging two tables, so the algebra is a per-member sum.
//!
//! # Ordering
//!
//! Top-N queries rank members by descending score. Members with equal scores
//! are ranked by ascending member order, which makes the answer a pure
//! function of the stored scores: repeating a query over unchanged data
//! returns the same list.

use std::{cmp::Ordering, collections::BTreeMap, num::NonZeroUsize};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{
    environment::{self, EnvironmentId},
    store::{Aggregate, BucketStore, Ident, Slice},
};

/// Scores of the members of one frequency table.
pub type Scores<V> = FxHashMap<V, f64>;

/// Members and scores, highest score first.
pub type Ranked<V> = Vec<(V, f64)>;

impl<V> Aggregate for Scores<V>
where
    V: Ident,
{
    fn merge(&mut self, other: Self) {
        for (member, score) in other {
            *self.entry(member).or_insert(0.0) += score;
        }
    }
}

/// Rank `scores` by descending score, ties by ascending member, and keep the
/// first `limit`. `None` keeps every member.
#[must_use]
pub fn most_common<V, I>(scores: I, limit: Option<usize>) -> Ranked<V>
where
    V: Ord,
    I: IntoIterator<Item = (V, f64)>,
{
    let mut ranked: Ranked<V> = scores.into_iter().collect();
    ranked.sort_by(|(left, left_score), (right, right_score)| {
        match right_score.total_cmp(left_score) {
            Ordering::Equal => left.cmp(right),
            ordering => ordering,
        }
    });
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }
    ranked
}

/// Frequency tables for every series of every model.
#[derive(Debug)]
pub struct FrequencyTable<M, K, V> {
    store: BucketStore<M, K, Scores<V>>,
}

impl<M, K, V> FrequencyTable<M, K, V>
where
    M: Ident,
    K: Ident,
    V: Ident + Ord,
{
    /// Create a new, empty [`FrequencyTable`].
    #[must_use]
    pub fn new(shards: NonZeroUsize) -> Self {
        Self {
            store: BucketStore::new(shards),
        }
    }

    /// Add `scores` to the buckets at each `(rollup, epoch)` of `placements`,
    /// in both the `environment` slice and the global slice.
    pub fn record(
        &self,
        model: &M,
        key: &K,
        environment: Option<EnvironmentId>,
        placements: &[(u64, u64)],
        scores: &Scores<V>,
    ) {
        for target in environment::write_targets(environment) {
            let slice = Slice::new(model.clone(), key.clone(), target);
            for (rollup, epoch) in placements {
                self.store.update(slice.clone().bucket(*rollup, *epoch), |table| {
                    for (member, score) in scores {
                        *table.entry(member.clone()).or_insert(0.0) += *score;
                    }
                });
            }
        }
        trace!(?model, ?key, ?environment, members = scores.len(), "frequencies recorded");
    }

    /// Visit each bucket of `key` at every epoch of `epochs`, in order.
    fn visit<F>(
        &self,
        model: &M,
        key: &K,
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
        mut f: F,
    ) where
        F: FnMut(u64, Option<&Scores<V>>),
    {
        let mut bucket = Slice::new(model.clone(), key.clone(), environment).bucket(rollup, 0);
        for epoch in epochs {
            bucket.epoch = *epoch;
            self.store.read(&bucket, |table| f(*epoch, table));
        }
    }

    /// The `limit` highest scoring members of each key, summed across
    /// `epochs`.
    #[must_use]
    pub fn most_frequent(
        &self,
        model: &M,
        keys: &[K],
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
        limit: Option<usize>,
    ) -> FxHashMap<K, Ranked<V>> {
        keys.iter()
            .map(|key| {
                let mut total: Scores<V> = Scores::default();
                self.visit(model, key, environment, rollup, epochs, |_, table| {
                    if let Some(table) = table {
                        total.merge(table.clone());
                    }
                });
                (key.clone(), most_common(total, limit))
            })
            .collect()
    }

    /// The `limit` highest scoring members of each key in each bucket of
    /// `epochs`, not accumulated across buckets.
    #[must_use]
    pub fn most_frequent_series(
        &self,
        model: &M,
        keys: &[K],
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
        limit: Option<usize>,
    ) -> FxHashMap<K, Vec<(u64, Ranked<V>)>> {
        keys.iter()
            .map(|key| {
                let mut points = Vec::with_capacity(epochs.len());
                self.visit(model, key, environment, rollup, epochs, |epoch, table| {
                    let ranked = table.map_or_else(Vec::new, |table| {
                        most_common(table.iter().map(|(m, s)| (m.clone(), *s)), limit)
                    });
                    points.push((epoch, ranked));
                });
                (key.clone(), points)
            })
            .collect()
    }

    /// Scores of the requested members of each key in each bucket of
    /// `epochs`. Members never recorded score zero.
    #[must_use]
    pub fn frequency_series(
        &self,
        model: &M,
        items: &FxHashMap<K, Vec<V>>,
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
    ) -> FxHashMap<K, Vec<(u64, Scores<V>)>> {
        items
            .iter()
            .map(|(key, members)| {
                let mut points = Vec::with_capacity(epochs.len());
                self.visit(model, key, environment, rollup, epochs, |epoch, table| {
                    let scores = members
                        .iter()
                        .map(|member| {
                            let score = table.and_then(|t| t.get(member)).copied().unwrap_or(0.0);
                            (member.clone(), score)
                        })
                        .collect();
                    points.push((epoch, scores));
                });
                (key.clone(), points)
            })
            .collect()
    }

    /// Scores of the requested members of each key, summed across `epochs`.
    #[must_use]
    pub fn frequency_totals(
        &self,
        model: &M,
        items: &FxHashMap<K, Vec<V>>,
        environment: Option<EnvironmentId>,
        rollup: u64,
        epochs: &[u64],
    ) -> FxHashMap<K, Scores<V>> {
        self.frequency_series(model, items, environment, rollup, epochs)
            .into_iter()
            .map(|(key, points)| {
                let mut total: Scores<V> = Scores::default();
                for (_, scores) in points {
                    total.merge(scores);
                }
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

    /// Add the buckets of `sources` into `destination` member by member,
    /// emptying the sources. Returns the number of buckets moved.
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

    /// Drop every table.
    pub fn clear(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type Table = FrequencyTable<&'static str, u64, &'static str>;

    fn table() -> Table {
        FrequencyTable::new(NonZeroUsize::new(4).expect("non-zero"))
    }

    fn scores(pairs: &[(&'static str, f64)]) -> Scores<&'static str> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn ties_rank_by_member() {
        let ranked = most_common(scores(&[("c", 3.0), ("a", 5.0), ("b", 3.0)]), Some(2));
        assert_eq!(ranked, vec![("a", 5.0), ("b", 3.0)]);
        let ranked = most_common(scores(&[("c", 3.0), ("a", 5.0), ("b", 3.0)]), None);
        assert_eq!(ranked, vec![("a", 5.0), ("b", 3.0), ("c", 3.0)]);
        assert!(most_common(scores(&[("a", 1.0)]), Some(0)).is_empty());
    }

    #[test]
    fn most_frequent_sums_buckets() {
        let t = table();
        t.record(&"releases", &1, None, &[(60, 0)], &scores(&[("a", 1.0), ("b", 4.0)]));
        t.record(&"releases", &1, None, &[(60, 60)], &scores(&[("a", 5.0)]));

        let top = t.most_frequent(&"releases", &[1], None, 60, &[0, 60], Some(1));
        assert_eq!(top[&1], vec![("a", 6.0)]);

        let series = t.most_frequent_series(&"releases", &[1], None, 60, &[0, 60, 120], Some(1));
        assert_eq!(
            series[&1],
            vec![(0, vec![("b", 4.0)]), (60, vec![("a", 5.0)]), (120, vec![])]
        );
    }

    #[test]
    fn frequency_series_reports_requested_members() {
        let t = table();
        t.record(&"releases", &1, Some(2), &[(60, 0)], &scores(&[("a", 1.5), ("b", 2.0)]));
        t.record(&"releases", &1, Some(2), &[(60, 60)], &scores(&[("a", 1.0)]));
        let items: FxHashMap<_, _> = [(1, vec!["a", "z"])].into_iter().collect();

        let series = t.frequency_series(&"releases", &items, Some(2), 60, &[0, 60]);
        assert_eq!(
            series[&1],
            vec![
                (0, scores(&[("a", 1.5), ("z", 0.0)])),
                (60, scores(&[("a", 1.0), ("z", 0.0)])),
            ]
        );

        let totals = t.frequency_totals(&"releases", &items, None, 60, &[0, 60]);
        assert_eq!(totals[&1], scores(&[("a", 2.5), ("z", 0.0)]));
    }

    #[test]
    fn merge_adds_member_scores() {
        let t = table();
        t.record(&"releases", &1, None, &[(60, 0)], &scores(&[("a", 1.0)]));
        t.record(&"releases", &2, None, &[(60, 0)], &scores(&[("a", 2.0), ("b", 1.0)]));

        assert_eq!(t.merge(&"releases", &1, &[2], &[None]), 1);
        let top = t.most_frequent(&"releases", &[1, 2], None, 60, &[0], None);
        assert_eq!(top[&1], vec![("a", 3.0), ("b", 1.0)]);
        assert!(top[&2].is_empty());
    }

    proptest! {
        #[test]
        fn most_common_is_deterministic(
            pairs in prop::collection::vec((0u8..16, 0u8..4), 0..32),
            limit in prop::option::of(0usize..20),
        ) {
            let table: Scores<u8> = pairs
                .iter()
                .map(|(member, score)| (*member, f64::from(*score)))
                .collect();
            let forward = most_common(table.clone(), limit);
            let mut reversed: Vec<(u8, f64)> = table.iter().map(|(m, s)| (*m, *s)).collect();
            reversed.reverse();
            let backward = most_common(reversed, limit);
            prop_assert_eq!(&forward, &backward);
            for pair in forward.windows(2) {
                let order = pair[1].1.total_cmp(&pair[0].1).then(pair[0].0.cmp(&pair[1].0));
                prop_assert_eq!(order, Ordering::Less);
            }
        }
    }
}
