//! The contract every time-series backend fulfils
//!
//! [`Backend`] is the complete set of operations callers use. The in-memory
//! [`crate::TimeSeriesEngine`] is one implementation; a networked backend
//! would wrap the same calls in RPC and keep their request and response
//! shapes.
//!
//! Timestamps are unix seconds. Where a timestamp is optional the backend's
//! notion of 'now' is used. Every write scoped to an environment also lands in
//! the global, environment-less slice of its key; every delete and merge
//! always covers the global slice in addition to the environments named.

use rustc_hash::FxHashMap;

use crate::{
    environment::EnvironmentId,
    frequency::{Ranked, Scores},
    rollup,
};

/// Errors produced by a [`Backend`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid rollup configuration or an unknown explicit rollup.
    #[error(transparent)]
    Rollup(#[from] rollup::Error),
    /// The backend cannot perform this operation correctly. Nothing was
    /// applied.
    #[error("Operation {operation} is not supported by this backend")]
    Unsupported {
        /// Name of the refused operation
        operation: &'static str,
    },
    /// A transient failure talking to the backend's storage.
    #[error("Upstream failure: {reason}")]
    Upstream {
        /// Description of the failure
        reason: String,
    },
}

impl Error {
    /// Whether the caller may retry the failed operation as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Upstream { .. })
    }
}

/// Time range, resolution and environment of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    /// Start of the range, inclusive
    pub start: u64,
    /// End of the range, inclusive. Defaults to now.
    pub end: Option<u64>,
    /// Explicit rollup width. Defaults to the finest rollup whose retention
    /// covers `start`.
    pub rollup: Option<u64>,
    /// Environment slice to read. Defaults to the global slice.
    pub environment: Option<EnvironmentId>,
}

impl Query {
    /// A query from `start` to now, at the optimal rollup, over the global
    /// slice.
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            start,
            end: None,
            rollup: None,
            environment: None,
        }
    }

    /// A query over `[start, end]`.
    #[must_use]
    pub fn between(start: u64, end: u64) -> Self {
        Self::new(start).with_end(end)
    }

    /// Set the end of the range.
    #[must_use]
    pub fn with_end(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }

    /// Read at an explicit rollup width.
    #[must_use]
    pub fn with_rollup(mut self, rollup: u64) -> Self {
        self.rollup = Some(rollup);
        self
    }

    /// Read the slice of `environment`.
    #[must_use]
    pub fn with_environment(mut self, environment: EnvironmentId) -> Self {
        self.environment = Some(environment);
        self
    }
}

/// Per-model frequency writes: key to member scores.
pub type FrequencyRequest<M, K, V> = (M, FxHashMap<K, Scores<V>>);

/// Time-series operations over models `M`, keys `K` and members `V`.
///
/// # Errors
///
/// Reads of missing data never fail, they read as zero. Operations that take
/// an explicit rollup return [`Error::Rollup`] if it is not configured,
/// before touching any bucket. A backend unable to perform an operation
/// correctly returns [`Error::Unsupported`] without applying any part of it.
pub trait Backend<M, K, V> {
    /// Add `count` to `key` at `timestamp` in every rollup.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn incr(
        &self,
        model: &M,
        key: &K,
        timestamp: Option<u64>,
        count: u64,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error>;

    /// Add `count` to every `(model, key)` of `items` at `timestamp`.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn incr_multi(
        &self,
        items: &[(M, K)],
        timestamp: Option<u64>,
        count: u64,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error>;

    /// Fold the counters of `sources` into `destination`, emptying the
    /// sources.
    ///
    /// Every bucket a source holds is moved, in every rollup, including
    /// buckets older than retention or newer than `timestamp`. Backends that
    /// expire data may use `timestamp` to bound the work.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn merge(
        &self,
        model: &M,
        destination: &K,
        sources: &[K],
        timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error>;

    /// Remove the counters of every model and key over the active series of
    /// `start`, `end` and `timestamp`, in every rollup.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn delete(
        &self,
        models: &[M],
        keys: &[K],
        start: Option<u64>,
        end: Option<u64>,
        timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error>;

    /// Counts of each key at every bucket of the query, ascending.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn get_range(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
    ) -> Result<FxHashMap<K, Vec<(u64, u64)>>, Error>;

    /// Sum of each key's counts over the query.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn get_sums(&self, model: &M, keys: &[K], query: &Query) -> Result<FxHashMap<K, u64>, Error>;

    /// Add `values` to the distinct set of `key` at `timestamp`.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn record(
        &self,
        model: &M,
        key: &K,
        values: &[V],
        timestamp: Option<u64>,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error>;

    /// Add each `(model, key, values)` of `items` at `timestamp`.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn record_multi(
        &self,
        items: &[(M, K, Vec<V>)],
        timestamp: Option<u64>,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error>;

    /// Distinct count of each key in every bucket of the query, each bucket
    /// on its own.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn get_distinct_counts_series(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
    ) -> Result<FxHashMap<K, Vec<(u64, usize)>>, Error>;

    /// Distinct count of each key across the whole query.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn get_distinct_counts_totals(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
    ) -> Result<FxHashMap<K, usize>, Error>;

    /// Distinct count across every key and the whole query.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn get_distinct_counts_union(&self, model: &M, keys: &[K], query: &Query)
    -> Result<usize, Error>;

    /// Union the distinct sets of `sources` into `destination`, emptying the
    /// sources.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn merge_distinct_counts(
        &self,
        model: &M,
        destination: &K,
        sources: &[K],
        timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error>;

    /// Remove distinct sets, as [`Backend::delete`] does counters.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn delete_distinct_counts(
        &self,
        models: &[M],
        keys: &[K],
        start: Option<u64>,
        end: Option<u64>,
        timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error>;

    /// Add member scores for every model and key of `requests` at
    /// `timestamp`.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn record_frequency_multi(
        &self,
        requests: &[FrequencyRequest<M, K, V>],
        timestamp: Option<u64>,
        environment: Option<EnvironmentId>,
    ) -> Result<(), Error>;

    /// The `limit` highest scoring members of each key over the query,
    /// descending by score, ties ascending by member.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn get_most_frequent(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
        limit: Option<usize>,
    ) -> Result<FxHashMap<K, Ranked<V>>, Error>;

    /// As [`Backend::get_most_frequent`] but for each bucket on its own.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn get_most_frequent_series(
        &self,
        model: &M,
        keys: &[K],
        query: &Query,
        limit: Option<usize>,
    ) -> Result<FxHashMap<K, Vec<(u64, Ranked<V>)>>, Error>;

    /// Scores of the requested members of each key in every bucket of the
    /// query. Unrecorded members score zero.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn get_frequency_series(
        &self,
        model: &M,
        items: &FxHashMap<K, Vec<V>>,
        query: &Query,
    ) -> Result<FxHashMap<K, Vec<(u64, Scores<V>)>>, Error>;

    /// Scores of the requested members of each key summed over the query.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn get_frequency_totals(
        &self,
        model: &M,
        items: &FxHashMap<K, Vec<V>>,
        query: &Query,
    ) -> Result<FxHashMap<K, Scores<V>>, Error>;

    /// Add the frequency tables of `sources` into `destination`, emptying
    /// the sources.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn merge_frequencies(
        &self,
        model: &M,
        destination: &K,
        sources: &[K],
        timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error>;

    /// Remove frequency tables, as [`Backend::delete`] does counters.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn delete_frequencies(
        &self,
        models: &[M],
        keys: &[K],
        start: Option<u64>,
        end: Option<u64>,
        timestamp: Option<u64>,
        environments: Option<&[EnvironmentId]>,
    ) -> Result<(), Error>;

    /// Drop all state.
    ///
    /// # Errors
    ///
    /// See trait documentation.
    fn flush(&self) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_upstream_failures_are_retryable() {
        assert!(
            Error::Upstream {
                reason: "connection reset".to_string()
            }
            .is_retryable()
        );
        assert!(!Error::Unsupported { operation: "merge" }.is_retryable());
        assert!(!Error::from(rollup::Error::UnknownRollup { width: 7 }).is_retryable());
    }

    #[test]
    fn query_builder() {
        let query = Query::between(10, 20).with_rollup(60).with_environment(3);
        assert_eq!(
            query,
            Query {
                start: 10,
                end: Some(20),
                rollup: Some(60),
                environment: Some(3),
            }
        );
        assert_eq!(Query::new(5).end, None);
    }
}
