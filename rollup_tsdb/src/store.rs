//! Bucket storage shared by every aggregate
//!
//! [`BucketStore`] maps a fully-qualified [`Bucket`] coordinate -- model, key,
//! environment, rollup width and epoch -- to an aggregate value. It is generic
//! over that value, see [`Aggregate`], and the three algebras of this crate
//! each own one instance.
//!
//! # Concurrency
//!
//! The map is split into shards, each behind its own [`Mutex`], and a bucket
//! lives in the shard selected by the hash of its coordinate. Every
//! single-bucket operation holds exactly one shard lock for its whole
//! read-modify-write, so concurrent writers to the same bucket are serialized
//! and no update is lost. Operations spanning many buckets take the locks one
//! at a time: they are atomic per bucket, never across buckets.
//!
//! Missing buckets are not an error. Readers see `None` and treat it as the
//! aggregate's zero value, writers create the bucket from [`Default`].

use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
};

use rustc_hash::{FxHashMap, FxHasher};

use crate::environment::EnvironmentId;

/// Default number of lock shards.
pub const DEFAULT_SHARDS: usize = 16;

/// [`DEFAULT_SHARDS`] as a shard count.
#[must_use]
pub fn default_shards() -> NonZeroUsize {
    // SAFETY: DEFAULT_SHARDS is a non-zero constant.
    unsafe { NonZeroUsize::new_unchecked(DEFAULT_SHARDS) }
}

/// Bound shared by models, keys and members.
pub trait Ident: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> Ident for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// A value stored per bucket.
///
/// `merge` must be associative and commutative: the store makes no promise
/// about the order in which merges to one bucket are applied.
pub trait Aggregate: Default + Send {
    /// Fold `other` into `self`.
    fn merge(&mut self, other: Self);
}

/// A series: one key of one model, in one environment slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slice<M, K> {
    /// The metric stream
    pub model: M,
    /// The key within the model
    pub key: K,
    /// The environment, `None` for the global slice
    pub environment: Option<EnvironmentId>,
}

impl<M, K> Slice<M, K> {
    /// Create a new [`Slice`].
    #[must_use]
    pub fn new(model: M, key: K, environment: Option<EnvironmentId>) -> Self {
        Self {
            model,
            key,
            environment,
        }
    }

    /// The bucket of this slice at `rollup` width and `epoch`.
    #[must_use]
    pub fn bucket(self, rollup: u64, epoch: u64) -> Bucket<M, K> {
        Bucket {
            slice: self,
            rollup,
            epoch,
        }
    }
}

/// Coordinate of a single bucket.
///
/// The rollup width is part of the coordinate: two rollups whose epochs
/// coincide never share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bucket<M, K> {
    /// The series this bucket belongs to
    pub slice: Slice<M, K>,
    /// Rollup width in seconds
    pub rollup: u64,
    /// Normalized epoch of the bucket
    pub epoch: u64,
}

type Shard<M, K, A> = Mutex<FxHashMap<Bucket<M, K>, A>>;

/// Sharded map of [`Bucket`] to aggregate value.
pub struct BucketStore<M, K, A> {
    shards: Box<[Shard<M, K, A>]>,
}

impl<M, K, A> fmt::Debug for BucketStore<M, K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketStore")
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl<M, K, A> Default for BucketStore<M, K, A> {
    fn default() -> Self {
        Self::new(default_shards())
    }
}

impl<M, K, A> BucketStore<M, K, A> {
    /// Create a new, empty [`BucketStore`] with `shards` lock shards.
    #[must_use]
    pub fn new(shards: NonZeroUsize) -> Self {
        let shards = (0..shards.get())
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        Self { shards }
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        for shard in &self.shards {
            lock(shard).clear();
        }
    }

    /// Total number of buckets held. Takes every shard lock in turn, so the
    /// answer may be stale under concurrent writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    /// Whether no bucket is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| lock(shard).is_empty())
    }
}

impl<M, K, A> BucketStore<M, K, A>
where
    M: Ident,
    K: Ident,
    A: Aggregate,
{
    fn shard(&self, bucket: &Bucket<M, K>) -> MutexGuard<'_, FxHashMap<Bucket<M, K>, A>> {
        let mut hasher = FxHasher::default();
        bucket.hash(&mut hasher);
        // usize is at most 64 bits wide on supported targets
        #[allow(clippy::cast_possible_truncation)]
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        lock(&self.shards[idx])
    }

    /// Apply `f` to the value of `bucket`, creating it from [`Default`] first
    /// if absent. Atomic with respect to every other operation on `bucket`.
    pub fn update<F>(&self, bucket: Bucket<M, K>, f: F)
    where
        F: FnOnce(&mut A),
    {
        let mut shard = self.shard(&bucket);
        f(shard.entry(bucket).or_default());
    }

    /// Fold `value` into `bucket`.
    pub fn merge(&self, bucket: Bucket<M, K>, value: A) {
        self.update(bucket, |current| current.merge(value));
    }

    /// Read `bucket`, `None` if it was never written.
    #[allow(clippy::must_use_candidate)]
    pub fn read<R, F>(&self, bucket: &Bucket<M, K>, f: F) -> R
    where
        F: FnOnce(Option<&A>) -> R,
    {
        let shard = self.shard(bucket);
        f(shard.get(bucket))
    }

    /// Replace the value of `bucket`, returning the previous value.
    #[must_use]
    pub fn insert(&self, bucket: Bucket<M, K>, value: A) -> Option<A> {
        let mut shard = self.shard(&bucket);
        shard.insert(bucket, value)
    }

    /// Remove `bucket`, returning its value. Absent buckets are a no-op.
    #[must_use]
    pub fn remove(&self, bucket: &Bucket<M, K>) -> Option<A> {
        let mut shard = self.shard(bucket);
        shard.remove(bucket)
    }

    /// Remove the buckets of `model`/`key` in each of `environments` at every
    /// `(rollup, epochs)` pair of `series`. Returns the number of buckets
    /// actually removed.
    #[must_use]
    pub fn delete_series(
        &self,
        model: &M,
        key: &K,
        environments: &[Option<EnvironmentId>],
        series: &BTreeMap<u64, Vec<u64>>,
    ) -> usize {
        let mut removed = 0;
        for environment in environments {
            for (rollup, epochs) in series {
                let mut bucket = Slice::new(model.clone(), key.clone(), *environment).bucket(*rollup, 0);
                for epoch in epochs {
                    bucket.epoch = *epoch;
                    if self.remove(&bucket).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// Move every bucket of each `sources` key into the matching bucket of
    /// `destination`, over each of `environments`. Every rollup and epoch the
    /// source holds is moved, whatever its age, and sources are left empty. A
    /// source equal to `destination` is skipped. Returns the number of buckets
    /// moved.
    #[must_use]
    pub fn merge_series(
        &self,
        model: &M,
        destination: &K,
        sources: &[K],
        environments: &[Option<EnvironmentId>],
    ) -> usize {
        let consumed = |slice: &Slice<M, K>| {
            slice.model == *model
                && slice.key != *destination
                && sources.contains(&slice.key)
                && environments.contains(&slice.environment)
        };

        // Drain each shard under its own lock, then fold. Never hold two
        // shard locks at once.
        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut shard = lock(shard);
            let coordinates: Vec<Bucket<M, K>> = shard
                .keys()
                .filter(|bucket| consumed(&bucket.slice))
                .cloned()
                .collect();
            drained.extend(
                coordinates
                    .into_iter()
                    .filter_map(|bucket| shard.remove_entry(&bucket)),
            );
        }

        let moved = drained.len();
        for (from, value) in drained {
            let to = Slice::new(model.clone(), destination.clone(), from.slice.environment)
                .bucket(from.rollup, from.epoch);
            self.merge(to, value);
        }
        moved
    }
}

// A panic while a shard is held leaves at most one bucket mid-update; the map
// itself stays sound so the poison flag is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
