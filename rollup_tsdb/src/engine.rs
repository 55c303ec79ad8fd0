//! The in-memory time-series engine
//!
//! [`TimeSeriesEngine`] owns the rollup set, a clock and one store per
//! aggregate kind. It resolves optional timestamps against its clock, turns
//! each write into one placement per rollup and each read into a rollup and
//! epoch list, and hands the rest to [`CounterSeries`], [`DistinctSet`] and
//! [`FrequencyTable`].
//!
//! ## Metrics
//!
//! `tsdb_writes_total`: Write operations applied, labeled by `aggregate`
//! `tsdb_buckets_deleted_total`: Buckets removed by deletes, labeled by `aggregate`
//! `tsdb_buckets_merged_total`: Source buckets folded by merges, labeled by `aggregate`

use std::{collections::BTreeMap, num::NonZeroUsize};

use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{
    backend::{Backend, Error, FrequencyRequest, Query},
    clock::{Clock, RealClock},
    config::Config,
    counter::CounterSeries,
    distinct::DistinctSet,
    environment::{self, EnvironmentId},
    frequency::{FrequencyTable, Ranked, Scores},
    rollup::{Rollup, Rollups},
    store::Ident,
};

const COUNTER: &str = "counter";
const DISTINCT: &str = "distinct";
const FREQUENCY: &str = "frequency";

fn wrote(aggregate: &'static str) {
    counter!("tsdb_writes_total", "aggregate" => aggregate).increment(1);
}

fn deleted(aggregate: &'static str, buckets: usize) {
    counter!("tsdb_buckets_deleted_total", "aggregate" => aggregate).increment(buckets as u64);
    debug!(aggregate, buckets, "deleted buckets");
}

fn merged(aggregate: &'static str, buckets: usize) {
    counter!("tsdb_buckets_merged_total", "aggregate" => aggregate).increment(buckets as u64);
    debug!(aggregate, buckets, "merged buckets");
}

/// An in-memory [`Backend`] over models `M`, keys `K` and members `V`.
///
/// All methods take `&self`; the engine is safe to share between threads.
#[derive(Debug)]
pub struct TimeSeriesEngine<M, K, V, C = RealClock> {
    rollups: Rollups,
    clock: C,
    counters: CounterSeries<M, K>,
    sets: DistinctSet<M, K, V>,
    frequencies: FrequencyTable<M, K, V>,
}

impl<M, K, V> TimeSeriesEngine<M, K, V, RealClock>
where
    M: Ident,
    K: Ident,
    V: Ident + Ord,
{
    /// Create a new [`TimeSeriesEngine`] reading the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rollup`] if `config` describes an invalid rollup set.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::with_clock(config, RealClock)
    }
}

impl<M, K, V, C> TimeSeriesEngine<M, K, V, C>
where
    M: Ident,
    K: Ident,
    V: Ident + Ord,
    C: Clock,
{
    /// Create a new [`TimeSeriesEngine`] reading `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rollup`] if `config` describes an invalid rollup set.
    pub fn with_clock(config: &Config, clock: C) -> Result<Self, Error> {
        Ok(Self::from_rollups(config.rollups()?, config.shards, clock))
    }

    /// Create a new [`TimeSeriesEngine`] over an already validated rollup
    /// set.
    #[must_use]
    pub fn from_rollups(rollups: Rollups, shards: NonZeroUsize, clock: C) -> Self {
        Self {
            rollups,
            clock,
            counters: CounterSeries::new(shards),
            sets: DistinctSet::new(shards),
            frequencies: FrequencyTable::new(shards),
        }
    }

    /// The configured rollups, finest first.
    #[must_use]
    pub fn get_rollups(&self) -> &Rollups {
        &self.rollups
    }

    /// The clock this engine reads 'now' from.
    #[must_use]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Normalize `timestamp` to its bucket epoch at the configured rollup
    /// `width`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rollup`] if `width` is not configured.
    pub fn normalize_to_rollup(&self, timestamp: u64, width: u64) -> Result<u64, Error> {
        Ok(self.rollups.get(width)?.normalize(timestamp))
    }

    /// The oldest epoch retained at rollup `width` as of `timestamp`,
    /// default now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rollup`] if `width` is not configured.
    pub fn get_earliest_timestamp(&self, width: u64, timestamp: Option<u64>) -> Result<u64, Error> {
        let timestamp = self.resolve(timestamp);
        Ok(self.rollups.get(width)?.earliest_timestamp(timestamp))
    }

    /// The rollup and epochs a read over `[start, end]` uses. `end` defaults
    /// to now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rollup`] if `rollup` is given and not configured.
    pub fn get_optimal_rollup_series(
        &self,
        start: u64,
        end: Option<u64>,
        rollup: Option<u64>,
    ) -> Result<(u64, Vec<u64>), Error> {
        let now = self.clock.now();
        Ok(self
            .rollups
            .optimal_series(start, end.unwrap_or(now), rollup, now)?)
    }

    /// Epochs of every rollup selected by `start`, `end` and `timestamp`, as
    /// deletes use them. See [`Rollups::active_series`].
    #[must_use]
    pub fn get_active_series(
        &self,
        start: Option<u64>,
        end: Option<u64>,
        timestamp: Option<u64>,
    ) -> BTreeMap<u64, Vec<u64>> {
        self.rollups
            .active_series(start, end, timestamp, self.clock.now())
    }

    /// Every rollup's retention window ending at `timestamp`, default now.
    #[must_use]
    pub fn get_retained_series(&self, timestamp: Option<u64>) -> BTreeMap<u64, Vec<u64>> {
        self.rollups.retained_series(self.resolve(timestamp))
    }

    /// The finest rollup covering `start` as of now.
    #[must_use]
    pub fn get_optimal_rollup(&self, start: u64) -> &Rollup {
        self.rollups.optimal_rollup(start, self.clock.now())
    }

    fn resolve(&self, timestamp: Option<u64>) -> u64 {
        timestamp.unwrap_or_else(|| self.clock.now())
    }

    fn placements(&self, timestamp: Option<u64>) -> Vec<(u64, u64)> {
        self.rollups.placements(self.resolve(timestamp))
    }

    fn plan(&self, query: &Query) -> Result<(u64, Vec<u64>), Error> {
        self.get_optimal_rollup_series(query.start, query.end, query.rollup)
    }
}

impl<M, K, V, C> Backend<M, K, V> for TimeSeriesEngine<M, K, V, C>
where
    M: Ident,
    K: Ident,
    V: Ident + Ord,
    C: Clock,
{
    fn incr(
        &self,
        model: &M,
        key: &K,
        timestamp: Option<u64>,
        count: u64,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error> {
        let placements = self.placements(timestamp);
        self.counters
            .incr(model, key, environment, &placements, count);
        wrote(COUNTER);
        Ok(())
    }

    fn incr_multi(
        &self,
        items: &[(M, K)],
        timestamp: Option<u64>,
        count: u64,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error> {
        let placements = self.placements(timestamp);
        for (model, key) in items {
            self.counters
                .incr(model, key, environment, &placements, count);
        }
        wrote(COUNTER);
        Ok(())
    }

    fn merge(
        &self,
        model: &M,
        destination: &K,
        sources: &[K],
        _timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error> {
        let targets = environment::clear_targets(environments);
        let moved = self.counters.merge(model, destination, sources, &targets);
        merged(COUNTER, moved);
        Ok(())
    }

    fn delete(
        &self,
        models: &[M],
        keys: &[K],
        start: Option<u64>,
        end: Option<u64>,
        timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error> {
        let series = self.get_active_series(start, end, timestamp);
        let targets = environment::clear_targets(environments);
        let removed = self.counters.delete(models, keys, &targets, &series);
        deleted(COUNTER, removed);
        Ok(())
    }

    fn get_range(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
    ) -> Result<FxHashMap<K, Vec<(u64, u64)>>, Error> {
        let (rollup, epochs) = self.plan(query)?;
        Ok(self
            .counters
            .range(model, keys, query.environment, rollup, &epochs))
    }

    fn get_sums(&self, model: &M, keys: &[K], query: &Query) -> Result<FxHashMap<K, u64>, Error> {
        let (rollup, epochs) = self.plan(query)?;
        Ok(self
            .counters
            .sums(model, keys, query.environment, rollup, &epochs))
    }

    fn record(
        &self,
        model: &M,
        key: &K,
        values: &[V],
        timestamp: Option<u64>,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error> {
        let placements = self.placements(timestamp);
        self.sets
            .record(model, key, environment, &placements, values);
        wrote(DISTINCT);
        Ok(())
    }

    fn record_multi(
        &self,
        items: &[(M, K, Vec<V>)],
        timestamp: Option<u64>,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error> {
        let placements = self.placements(timestamp);
        for (model, key, values) in items {
            self.sets
                .record(model, key, environment, &placements, values);
        }
        wrote(DISTINCT);
        Ok(())
    }

    fn get_distinct_counts_series(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
    ) -> Result<FxHashMap<K, Vec<(u64, usize)>>, Error> {
        let (rollup, epochs) = self.plan(query)?;
        Ok(self
            .sets
            .series(model, keys, query.environment, rollup, &epochs))
    }

    fn get_distinct_counts_totals(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
    ) -> Result<FxHashMap<K, usize>, Error> {
        let (rollup, epochs) = self.plan(query)?;
        Ok(self
            .sets
            .totals(model, keys, query.environment, rollup, &epochs))
    }

    fn get_distinct_counts_union(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
    ) -> Result<usize, Error> {
        let (rollup, epochs) = self.plan(query)?;
        Ok(self
            .sets
            .union(model, keys, query.environment, rollup, &epochs))
    }

    fn merge_distinct_counts(
        &self,
        model: &M,
        destination: &K,
        sources: &[K],
        _timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error> {
        let targets = environment::clear_targets(environments);
        let moved = self.sets.merge(model, destination, sources, &targets);
        merged(DISTINCT, moved);
        Ok(())
    }

    fn delete_distinct_counts(
        &self,
        models: &[M],
        keys: &[K],
        start: Option<u64>,
        end: Option<u64>,
        timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error> {
        let series = self.get_active_series(start, end, timestamp);
        let targets = environment::clear_targets(environments);
        let removed = self.sets.delete(models, keys, &targets, &series);
        deleted(DISTINCT, removed);
        Ok(())
    }

    fn record_frequency_multi(
        &self,
        requests: &[FrequencyRequest<M, K, V>],
        timestamp: Option<u64>,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error> {
        let placements = self.placements(timestamp);
        for (model, items) in requests {
            for (key, scores) in items {
                self.frequencies
                    .record(model, key, environment, &placements, scores);
            }
        }
        wrote(FREQUENCY);
        Ok(())
    }

    fn get_most_frequent(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
        limit: Option<usize>,
    ) -> Result<FxHashMap<K, Ranked<V>>, Error> {
        let (rollup, epochs) = self.plan(query)?;
        Ok(self
            .frequencies
            .most_frequent(model, keys, query.environment, rollup, &epochs, limit))
    }

    fn get_most_frequent_series(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
        limit: Option<usize>,
    ) -> Result<FxHashMap<K, Vec<(u64, Ranked<V>)>>, Error> {
        let (rollup, epochs) = self.plan(query)?;
        Ok(self.frequencies.most_frequent_series(
            model,
            keys,
            query.environment,
            rollup,
            &epochs,
            limit,
        ))
    }

    fn get_frequency_series(
        &self,
        model: &M,
        items: &FxHashMap<K, Vec<V>>,
        query: &Query,
    ) -> Result<FxHashMap<K, Vec<(u64, Scores<V>)>>, Error> {
        let (rollup, epochs) = self.plan(query)?;
        Ok(self
            .frequencies
            .frequency_series(model, items, query.environment, rollup, &epochs))
    }

    fn get_frequency_totals(
        &self,
        model: &M,
        items: &FxHashMap<K, Vec<V>>,
        query: &Query,
    ) -> Result<FxHashMap<K, Scores<V>>, Error> {
        let (rollup, epochs) = self.plan(query)?;
        Ok(self
            .frequencies
            .frequency_totals(model, items, query.environment, rollup, &epochs))
    }

    fn merge_frequencies(
        &self,
        model: &M,
        destination: &K,
        sources: &[K],
        _timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error> {
        let targets = environment::clear_targets(environments);
        let moved = self.frequencies.merge(model, destination, sources, &targets);
        merged(FREQUENCY, moved);
        Ok(())
    }

    fn delete_frequencies(
        &self,
        models: &[M],
        keys: &[K],
        start: Option<u64>,
        end: Option<u64>,
        timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error> {
        let series = self.get_active_series(start, end, timestamp);
        let targets = environment::clear_targets(environments);
        let removed = self.frequencies.delete(models, keys, &targets, &series);
        deleted(FREQUENCY, removed);
        Ok(())
    }

    fn flush(&self) -> Result<(), Error> {
        self.counters.clear();
        self.sets.clear();
        self.frequencies.clear();
        debug!("flushed all aggregates");
        Ok(())
    }
}
