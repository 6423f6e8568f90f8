//! Write-back cache in front of a [`DigestStore`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use sluice_statsd::{Metrics, metric};

use crate::clock::Clock;
use crate::digest::{AgentDigest, Centroid};
use crate::granularity::Granularity;
use crate::key::HistogramKey;
use crate::statsd::{HistogramCounters, HistogramTimers};
use crate::store::{DigestStore, StoreError};

/// Number of independently locked partitions of the key space.
const SHARD_COUNT: usize = 16;

/// Parameters for an [`Accumulator`].
#[derive(Clone, Debug)]
pub struct AccumulatorConfig {
    /// The granularity of all keys in this accumulator, used to tag metrics.
    pub granularity: Granularity,
    /// Buffer merges in memory until the next [`flush`](Accumulator::flush).
    ///
    /// If disabled, every merge is applied to the store directly.
    pub memory_cache: bool,
    /// Maximum number of keys buffered in memory across all shards.
    ///
    /// Merges for new keys beyond this bound are written through to the store.
    pub cache_bound: usize,
}

/// One lock-protected partition of the accumulator.
#[derive(Debug, Default)]
struct Shard {
    /// Merges not yet applied to the store.
    cache: HashMap<HistogramKey, AgentDigest>,
    /// Dispatch time of every key in this shard, whether cached, stored, or both.
    index: HashMap<HistogramKey, i64>,
}

/// Accumulates digests per key and tracks when they become ripe.
///
/// Every key belongs to exactly one shard. All access to a key, in the local cache and in the
/// store, happens under the lock of its shard. This makes [`compute`](Self::compute) atomic with
/// respect to concurrent merges into the same key: a merge either lands before the computation
/// and is observed by it, or after and creates a new entry.
///
/// The store is the source of truth. The cache only holds merges that have not been written back
/// yet, which [`flush`](Self::flush) merges into the stored value.
pub struct Accumulator {
    granularity: Granularity,
    store: Arc<DigestStore>,
    shards: Box<[Mutex<Shard>]>,
    hasher: ahash::RandomState,
    memory_cache: bool,
    shard_cache_bound: usize,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl Accumulator {
    /// Creates an accumulator over `store` and indexes the entries already in it.
    pub fn new(
        store: Arc<DigestStore>,
        config: AccumulatorConfig,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        let shards: Box<[Mutex<Shard>]> = (0..SHARD_COUNT).map(|_| Mutex::default()).collect();
        let accumulator = Self {
            granularity: config.granularity,
            store,
            shards,
            hasher: ahash::RandomState::new(),
            memory_cache: config.memory_cache,
            shard_cache_bound: (config.cache_bound / SHARD_COUNT).max(1),
            clock,
            metrics,
        };

        for (key, dispatch_time) in accumulator.store.dispatch_times() {
            accumulator.shard(&key).index.insert(key, dispatch_time);
        }

        accumulator
    }

    /// The granularity this accumulator was created for.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// The store behind this accumulator.
    pub fn store(&self) -> &Arc<DigestStore> {
        &self.store
    }

    fn shard(&self, key: &HistogramKey) -> MutexGuard<'_, Shard> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        self.shards[index].lock()
    }

    /// Merges `digest` into the entry for `key`.
    ///
    /// If there is no entry, `digest` becomes the entry including its dispatch time.
    pub fn put_digest(&self, key: HistogramKey, digest: AgentDigest) -> Result<(), StoreError> {
        self.merge(key, |current| match current {
            Some(mut current) => {
                current.merge(&digest);
                current
            }
            None => digest,
        })
    }

    /// Merges a single sample into the entry for `key`.
    ///
    /// If there is no entry, one is created with the given compression that becomes ripe `ttl`
    /// from now.
    pub fn put_value(
        &self,
        key: HistogramKey,
        value: f64,
        compression: u16,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let dispatch_time = self.dispatch_time(ttl);
        self.merge(key, |current| {
            let mut digest =
                current.unwrap_or_else(|| AgentDigest::new(compression, dispatch_time));
            digest.merge_value(value);
            digest
        })
    }

    /// Merges a pre-aggregated distribution into the entry for `key`.
    ///
    /// Creates the entry like [`put_value`](Self::put_value) if there is none.
    pub fn put_distribution(
        &self,
        key: HistogramKey,
        centroids: &[Centroid],
        compression: u16,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let dispatch_time = self.dispatch_time(ttl);
        self.merge(key, |current| {
            let mut digest =
                current.unwrap_or_else(|| AgentDigest::new(compression, dispatch_time));
            digest.merge_distribution(centroids);
            digest
        })
    }

    fn dispatch_time(&self, ttl: Duration) -> i64 {
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_add(ttl)
    }

    /// Applies `f` to the cached merges of `key`, or to the stored entry if the cache is
    /// bypassed.
    fn merge<F>(&self, key: HistogramKey, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(Option<AgentDigest>) -> AgentDigest,
    {
        let mut guard = self.shard(&key);
        let shard = &mut *guard;

        let counter = match shard.index.contains_key(&key) {
            true => HistogramCounters::BinsMerged,
            false => HistogramCounters::BinsCreated,
        };
        metric!(
            self.metrics,
            counter(counter) += 1,
            granularity = self.granularity.name()
        );

        let dispatch_time = if self.memory_cache
            && (shard.cache.contains_key(&key) || shard.cache.len() < self.shard_cache_bound)
        {
            let digest = f(shard.cache.remove(&key));
            let dispatch_time = digest.dispatch_time();
            shard.cache.insert(key.clone(), digest);
            dispatch_time
        } else {
            if self.memory_cache {
                metric!(
                    self.metrics,
                    counter(HistogramCounters::StoreWriteThrough) += 1,
                    granularity = self.granularity.name()
                );
            }

            let digest = f(self.store.get(&key));
            let dispatch_time = digest.dispatch_time();
            self.store.insert(key.clone(), digest)?;
            dispatch_time
        };

        shard
            .index
            .entry(key)
            .and_modify(|time| *time = (*time).min(dispatch_time))
            .or_insert(dispatch_time);

        Ok(())
    }

    /// Atomically computes a new value for `key` from its current value.
    ///
    /// `f` receives the current digest, combining stored and cached merges, or `None` if the key
    /// has no entry. If `f` returns `None`, the entry is removed. Otherwise the returned digest
    /// replaces the entry and is returned.
    ///
    /// No merge into the same key can happen while `f` runs.
    pub fn compute<F>(&self, key: &HistogramKey, f: F) -> Result<Option<AgentDigest>, StoreError>
    where
        F: FnOnce(&HistogramKey, Option<AgentDigest>) -> Option<AgentDigest>,
    {
        let mut guard = self.shard(key);
        let shard = &mut *guard;

        let stored = self.store.get(key);
        let had_stored = stored.is_some();
        // The cached part of a stored entry goes back into the cache if the store rejects a write.
        let (current, cached) = match (stored, shard.cache.remove(key)) {
            (Some(mut stored), Some(cached)) => {
                stored.merge(&cached);
                (Some(stored), Some(cached))
            }
            (stored, cached) => (stored.or(cached), None),
        };

        match f(key, current) {
            Some(digest) => {
                shard.index.insert(key.clone(), digest.dispatch_time());
                if let Err(error) = self.store.insert(key.clone(), digest.clone()) {
                    // Keep the result around for the next flush rather than losing it.
                    if had_stored {
                        self.store.remove(key)?;
                    }
                    shard.cache.insert(key.clone(), digest);
                    return Err(error);
                }
                Ok(Some(digest))
            }
            None => {
                if had_stored {
                    if let Err(error) = self.store.remove(key) {
                        if let Some(cached) = cached {
                            shard.cache.insert(key.clone(), cached);
                        }
                        return Err(error);
                    }
                }
                shard.index.remove(key);
                Ok(None)
            }
        }
    }

    /// Returns the keys whose dispatch time is at or before `now`.
    ///
    /// Shards are scanned lazily while iterating, so keys that become ripe or are added during
    /// the iteration may or may not be returned.
    pub fn ripe_keys(&self, now: i64) -> RipeKeys<'_> {
        RipeKeys {
            accumulator: self,
            now,
            next_shard: 0,
            pending: Vec::new().into_iter(),
        }
    }

    /// The number of entries in the store.
    ///
    /// Keys that have only been cached since the last flush are not counted.
    pub fn size(&self) -> usize {
        self.store.len()
    }

    /// The number of keys with pending merges in the local cache.
    pub fn cache_len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().cache.len()).sum()
    }

    /// Writes all cached merges back to the store and syncs it.
    ///
    /// Cached merges are merged into the stored value rather than replacing it. Merges that
    /// cannot be written remain cached for the next flush, and the first error is returned.
    pub fn flush(&self) -> Result<(), StoreError> {
        metric!(
            self.metrics,
            timer(HistogramTimers::Resolve),
            granularity = self.granularity.name(),
            {
                let mut result = Ok(());

                for shard in self.shards.iter() {
                    let mut shard = shard.lock();
                    let pending: Vec<_> = shard.cache.drain().collect();

                    for (key, cached) in pending {
                        let merged = match self.store.get(&key) {
                            Some(mut stored) => {
                                stored.merge(&cached);
                                stored
                            }
                            None => cached.clone(),
                        };

                        if let Err(error) = self.store.insert(key.clone(), merged) {
                            shard.cache.insert(key, cached);
                            if result.is_ok() {
                                result = Err(error);
                            }
                        }
                    }
                }

                result.and(self.store.sync())
            }
        )
    }

    /// Drops the index entry of `key` unless the key still has a digest.
    fn release(&self, key: &HistogramKey) -> bool {
        let mut shard = self.shard(key);
        if shard.cache.contains_key(key) || self.store.contains_key(key) {
            return false;
        }
        shard.index.remove(key).is_some()
    }
}

impl fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accumulator")
            .field("granularity", &self.granularity)
            .field("store", &self.store)
            .field("memory_cache", &self.memory_cache)
            .field("shard_cache_bound", &self.shard_cache_bound)
            .finish_non_exhaustive()
    }
}

/// Iterator over ripe keys, returned by [`Accumulator::ripe_keys`].
///
/// Yielding a key does not lock it. Consumers claim a key with
/// [`Accumulator::compute`] and then [`remove`](Self::remove) it from the iteration.
pub struct RipeKeys<'a> {
    accumulator: &'a Accumulator,
    now: i64,
    next_shard: usize,
    pending: std::vec::IntoIter<HistogramKey>,
}

impl RipeKeys<'_> {
    /// Marks `key` as claimed.
    ///
    /// If the key no longer has a digest, it is dropped from the ripeness index. Returns `true`
    /// if an index entry was dropped. A key that received new merges since it was computed keeps
    /// its entry.
    pub fn remove(&mut self, key: &HistogramKey) -> bool {
        self.accumulator.release(key)
    }
}

impl Iterator for RipeKeys<'_> {
    type Item = HistogramKey;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.pending.next() {
                return Some(key);
            }

            let shard = self.accumulator.shards.get(self.next_shard)?;
            self.next_shard += 1;

            let now = self.now;
            let ripe: Vec<_> = shard
                .lock()
                .index
                .iter()
                .filter(|(_, dispatch_time)| **dispatch_time <= now)
                .map(|(key, _)| key.clone())
                .collect();
            self.pending = ripe.into_iter();
        }
    }
}

impl fmt::Debug for RipeKeys<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RipeKeys")
            .field("now", &self.now)
            .field("next_shard", &self.next_shard)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{StoreSettings, open_store};

    const TTL: Duration = Duration::from_secs(70);

    fn key(timestamp_ms: i64) -> HistogramKey {
        HistogramKey::new(
            Granularity::Minute,
            timestamp_ms,
            "request.latency",
            "host",
            BTreeMap::new(),
        )
    }

    fn accumulator(memory_cache: bool, cache_bound: usize) -> (Accumulator, ManualClock) {
        let clock = ManualClock::new(0);
        let accumulator = Accumulator::new(
            Arc::new(DigestStore::in_memory(1000)),
            AccumulatorConfig {
                granularity: Granularity::Minute,
                memory_cache,
                cache_bound,
            },
            Arc::new(clock.clone()),
            Metrics::noop(),
        );
        (accumulator, clock)
    }

    fn ripe(accumulator: &Accumulator, now: i64) -> Vec<HistogramKey> {
        let mut keys: Vec<_> = accumulator.ripe_keys(now).collect();
        keys.sort();
        keys
    }

    fn take(accumulator: &Accumulator, key: &HistogramKey) -> Option<AgentDigest> {
        let mut taken = None;
        accumulator
            .compute(key, |_, digest| {
                taken = digest;
                None
            })
            .unwrap();
        taken
    }

    #[test]
    fn test_minute_scenario() {
        for memory_cache in [true, false] {
            let (accumulator, clock) = accumulator(memory_cache, 100);

            accumulator.put_value(key(0), 10.0, 32, TTL).unwrap();
            clock.set(1_000);
            accumulator.put_value(key(1_000), 20.0, 32, TTL).unwrap();
            // The sender's clock runs a few seconds ahead of ours.
            clock.set(61_000);
            accumulator.put_value(key(65_000), 30.0, 32, TTL).unwrap();

            assert!(ripe(&accumulator, 69_999).is_empty());
            assert_eq!(ripe(&accumulator, 71_000), vec![key(0)]);

            let first = take(&accumulator, &key(0)).unwrap();
            assert_eq!(first.count(), 2);
            assert_eq!(first.min(), Some(10.0));
            assert_eq!(first.max(), Some(20.0));

            assert!(ripe(&accumulator, 71_000).is_empty());
            assert_eq!(ripe(&accumulator, 131_000), vec![key(60_000)]);

            let second = take(&accumulator, &key(60_000)).unwrap();
            assert_eq!(second.count(), 1);
            assert_eq!(second.quantile(0.5), Some(30.0));
            assert!(ripe(&accumulator, i64::MAX).is_empty());
        }
    }

    #[test]
    fn test_ripeness_monotonic() {
        let (accumulator, clock) = accumulator(true, 100);
        clock.set(5_000);
        accumulator.put_value(key(0), 1.0, 32, TTL).unwrap();

        // Later merges do not move the dispatch time.
        clock.set(50_000);
        accumulator.put_value(key(0), 2.0, 32, TTL).unwrap();

        for now in [5_000, 50_000, 74_999] {
            assert!(ripe(&accumulator, now).is_empty());
        }
        for now in [75_000, 75_001, 200_000] {
            assert_eq!(ripe(&accumulator, now), vec![key(0)]);
        }
    }

    #[test]
    fn test_flush_merges_into_store() {
        let (accumulator, _clock) = accumulator(true, 100);

        accumulator.put_value(key(0), 1.0, 32, TTL).unwrap();
        assert_eq!(accumulator.size(), 0);
        assert_eq!(accumulator.cache_len(), 1);

        accumulator.flush().unwrap();
        assert_eq!(accumulator.size(), 1);
        assert_eq!(accumulator.cache_len(), 0);

        accumulator.put_value(key(0), 2.0, 32, TTL).unwrap();
        accumulator.flush().unwrap();

        let stored = accumulator.store().get(&key(0)).unwrap();
        assert_eq!(stored.count(), 2);
        assert_eq!(stored.dispatch_time(), 70_000);
    }

    #[test]
    fn test_compute_sees_cached_and_stored() {
        let (accumulator, _clock) = accumulator(true, 100);

        accumulator.put_value(key(0), 1.0, 32, TTL).unwrap();
        accumulator.flush().unwrap();
        accumulator.put_value(key(0), 2.0, 32, TTL).unwrap();

        let digest = take(&accumulator, &key(0)).unwrap();
        assert_eq!(digest.count(), 2);
        assert!(accumulator.store().is_empty());
        assert_eq!(accumulator.cache_len(), 0);
    }

    #[test]
    fn test_compute_replaces_entry() {
        let (accumulator, _clock) = accumulator(false, 100);
        accumulator.put_value(key(0), 1.0, 32, TTL).unwrap();

        let result = accumulator
            .compute(&key(0), |_, digest| {
                let mut digest = digest?;
                digest.set_dispatch_time_forward(500_000);
                Some(digest)
            })
            .unwrap();

        assert_eq!(result.map(|d| d.dispatch_time()), Some(500_000));
        assert!(ripe(&accumulator, 499_999).is_empty());
        assert_eq!(ripe(&accumulator, 500_000), vec![key(0)]);
    }

    #[test]
    fn test_compute_keeps_entry_when_store_fails() {
        let (accumulator, _clock) = accumulator(true, 100);

        accumulator.put_value(key(0), 1.0, 32, TTL).unwrap();
        accumulator.flush().unwrap();
        accumulator.put_value(key(0), 2.0, 32, TTL).unwrap();
        accumulator.store().close().unwrap();

        let result = accumulator.compute(&key(0), |_, digest| {
            assert_eq!(digest.map(|d| d.count()), Some(2));
            None
        });
        assert!(matches!(result, Err(StoreError::Closed)));

        assert_eq!(ripe(&accumulator, 70_000), vec![key(0)]);
        assert_eq!(accumulator.cache_len(), 1);
        assert_eq!(accumulator.store().get(&key(0)).map(|d| d.count()), Some(1));
    }

    #[test]
    fn test_compute_missing_key() {
        let (accumulator, _clock) = accumulator(true, 100);
        let result = accumulator.compute(&key(0), |_, digest| {
            assert!(digest.is_none());
            None
        });
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_put_digest_keeps_earlier_dispatch() {
        let (accumulator, _clock) = accumulator(true, 100);

        let mut late = AgentDigest::new(32, 90_000);
        late.merge_value(1.0);
        let mut early = AgentDigest::new(32, 30_000);
        early.merge_value(2.0);

        accumulator.put_digest(key(0), late).unwrap();
        accumulator.put_digest(key(0), early).unwrap();

        assert_eq!(ripe(&accumulator, 30_000), vec![key(0)]);
        assert_eq!(take(&accumulator, &key(0)).map(|d| d.count()), Some(2));
    }

    #[test]
    fn test_put_distribution() {
        let (accumulator, _clock) = accumulator(true, 100);
        let centroids = [Centroid::new(1.0, 3), Centroid::new(2.0, 0), Centroid::new(5.0, 2)];

        accumulator
            .put_distribution(key(0), &centroids, 32, TTL)
            .unwrap();

        let digest = take(&accumulator, &key(0)).unwrap();
        assert_eq!(digest.count(), 5);
        assert_eq!(digest.dispatch_time(), 70_000);
    }

    #[test]
    fn test_overflow_writes_through() {
        let (metrics, capture) = Metrics::capturing();
        let clock = ManualClock::new(0);
        let accumulator = Accumulator::new(
            Arc::new(DigestStore::in_memory(1000)),
            AccumulatorConfig {
                granularity: Granularity::Minute,
                memory_cache: true,
                cache_bound: 0,
            },
            Arc::new(clock),
            metrics,
        );

        // Every shard buffers at least one key.
        let keys: Vec<_> = (0..200).map(|i| key(i * 60_000)).collect();
        for key in &keys {
            accumulator.put_value(key.clone(), 1.0, 32, TTL).unwrap();
        }

        assert!(accumulator.cache_len() <= SHARD_COUNT);
        assert_eq!(accumulator.cache_len() + accumulator.size(), keys.len());
        assert!(
            capture
                .drain()
                .iter()
                .any(|m| m.starts_with("histogram.store.write_through:1|c"))
        );

        accumulator.flush().unwrap();
        assert_eq!(accumulator.size(), keys.len());
        let total: u64 = keys
            .iter()
            .map(|k| accumulator.store().get(k).map_or(0, |d| d.count()))
            .sum();
        assert_eq!(total, keys.len() as u64);
    }

    #[test]
    fn test_no_lost_update() {
        const WRITERS: usize = 4;
        const SAMPLES: usize = 2_000;

        for memory_cache in [true, false] {
            let (accumulator, _clock) = accumulator(memory_cache, 100);
            let accumulator = Arc::new(accumulator);

            let writers: Vec<_> = (0..WRITERS)
                .map(|_| {
                    let accumulator = Arc::clone(&accumulator);
                    thread::spawn(move || {
                        for i in 0..SAMPLES {
                            accumulator.put_value(key(0), i as f64, 32, TTL).unwrap();
                        }
                    })
                })
                .collect();

            let dispatcher = {
                let accumulator = Arc::clone(&accumulator);
                thread::spawn(move || {
                    let mut dispatched = 0;
                    for _ in 0..SAMPLES {
                        dispatched += take(&accumulator, &key(0)).map_or(0, |d| d.count());
                        if accumulator.cache_len() > 0 {
                            accumulator.flush().unwrap();
                        }
                    }
                    dispatched
                })
            };

            for writer in writers {
                writer.join().unwrap();
            }
            let dispatched = dispatcher.join().unwrap();
            let remaining = take(&accumulator, &key(0)).map_or(0, |d| d.count());

            assert_eq!(dispatched + remaining, (WRITERS * SAMPLES) as u64);
        }
    }

    #[test]
    fn test_ripe_keys_remove() {
        let (accumulator, _clock) = accumulator(true, 100);
        accumulator.put_value(key(0), 1.0, 32, TTL).unwrap();
        accumulator.put_value(key(60_000), 1.0, 32, TTL).unwrap();

        let mut ripe = accumulator.ripe_keys(i64::MAX);
        let mut seen = 0;
        while let Some(key) = ripe.next() {
            // A key that still holds a digest stays indexed.
            assert!(!ripe.remove(&key));
            take(&accumulator, &key);
            assert!(!ripe.remove(&key));
            seen += 1;
        }

        assert_eq!(seen, 2);
        assert_eq!(accumulator.ripe_keys(i64::MAX).count(), 0);
    }

    #[test]
    fn test_index_restored_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("histogram.minute.0");
        let settings = StoreSettings::new(100, 150, 256);
        let config = AccumulatorConfig {
            granularity: Granularity::Minute,
            memory_cache: true,
            cache_bound: 100,
        };

        let (store, _) = open_store(&path, &settings, true).unwrap();
        let accumulator = Accumulator::new(
            Arc::new(store),
            config.clone(),
            Arc::new(ManualClock::new(0)),
            Metrics::noop(),
        );
        accumulator.put_value(key(0), 1.0, 32, TTL).unwrap();
        accumulator.flush().unwrap();
        accumulator.store().close().unwrap();
        drop(accumulator);

        let (store, _) = open_store(&path, &settings, true).unwrap();
        let accumulator = Accumulator::new(
            Arc::new(store),
            config,
            Arc::new(ManualClock::new(0)),
            Metrics::noop(),
        );

        assert_eq!(ripe(&accumulator, 70_000), vec![key(0)]);
        assert_eq!(take(&accumulator, &key(0)).map(|d| d.count()), Some(1));
    }
}
