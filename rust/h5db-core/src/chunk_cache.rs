// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Shared cache of decoded chunk payloads.
//!
//! The cache is keyed by (dataset, chunk coordinate) and bounded by the deep
//! size of its values. A miss registers an in-flight slot under the state
//! lock, releases the lock, runs the loader and then publishes the outcome to
//! every thread that queued up on the same key in the meantime. The state lock
//! is never held across a load.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use deepsize::DeepSizeOf;
use snafu::location;

use crate::grid::{ChunkCoordinate, DatasetId};
use crate::{Error, Result};

/// Key of one cached chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub dataset: DatasetId,
    pub coordinate: ChunkCoordinate,
}

impl ChunkKey {
    pub fn new(dataset: DatasetId, coordinate: ChunkCoordinate) -> Self {
        Self {
            dataset,
            coordinate,
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dataset, self.coordinate)
    }
}

/// Point-in-time counters of a [`ChunkCache`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that found a load in flight and waited for it.
    pub waits: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    /// Loaded values that could not be made resident.
    pub rejected: u64,
    pub entries: usize,
    pub used_bytes: usize,
}

struct Resident<V> {
    value: Arc<V>,
    size: usize,
    tick: u64,
}

struct InFlight<V> {
    result: Mutex<Option<Result<Arc<V>>>>,
    ready: Condvar,
}

impl<V> InFlight<V> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<Arc<V>> {
        let mut result = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            result = self
                .ready
                .wait(result)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn publish(&self, value: Result<Arc<V>>) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        self.ready.notify_all();
    }
}

struct CacheState<V> {
    entries: HashMap<ChunkKey, Resident<V>>,
    /// Recency order, oldest first.
    lru: BTreeMap<u64, ChunkKey>,
    in_flight: HashMap<ChunkKey, Arc<InFlight<V>>>,
    leases: HashMap<DatasetId, usize>,
    used_bytes: usize,
    tick: u64,
    stats: CacheStats,
}

impl<V> CacheState<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &ChunkKey) -> Option<Arc<V>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.lru.remove(&entry.tick);
        entry.tick = tick;
        self.lru.insert(tick, key.clone());
        Some(entry.value.clone())
    }

    fn remove(&mut self, key: &ChunkKey) -> Option<Resident<V>> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.tick);
        self.used_bytes -= entry.size;
        Some(entry)
    }
}

/// A bounded, thread-safe cache of decoded chunks.
///
/// Values are handed out as `Arc<V>`. An entry whose `Arc` is still held by
/// a reader is pinned and is never chosen for eviction; the reader's copy
/// stays valid after the entry leaves the cache either way.
pub struct ChunkCache<V> {
    state: Mutex<CacheState<V>>,
    capacity: usize,
}

impl<V> fmt::Debug for ChunkCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCache")
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<V: DeepSizeOf + Send + Sync + 'static> ChunkCache<V> {
    /// Create a cache holding at most `capacity` bytes of decoded values.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                lru: BTreeMap::new(),
                in_flight: HashMap::new(),
                leases: HashMap::new(),
                used_bytes: 0,
                tick: 0,
                stats: CacheStats::default(),
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        // Bookkeeping is updated atomically under the lock, so a poisoned
        // state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a resident value without loading it.
    pub fn get(&self, key: &ChunkKey) -> Option<Arc<V>> {
        let mut state = self.lock();
        let value = state.touch(key);
        if value.is_some() {
            state.stats.hits += 1;
        }
        value
    }

    /// Return the value for `key`, invoking `loader` if it is not resident.
    ///
    /// Concurrent callers for the same key share one invocation of `loader`.
    /// A failed load is delivered to every waiter and is not remembered, so
    /// the next request loads again.
    pub fn get_or_load<F>(&self, key: &ChunkKey, loader: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let slot = {
            let mut state = self.lock();
            if let Some(value) = state.touch(key) {
                state.stats.hits += 1;
                return Ok(value);
            }
            if let Some(slot) = state.in_flight.get(key).cloned() {
                state.stats.waits += 1;
                drop(state);
                log::trace!("Waiting for in-flight load of chunk {}", key);
                return slot.wait();
            }
            state.stats.misses += 1;
            let slot = Arc::new(InFlight::new());
            state.in_flight.insert(key.clone(), slot.clone());
            slot
        };

        let mut guard = LoadGuard {
            cache: self,
            key,
            slot: &slot,
            armed: true,
        };
        let result = loader().map(Arc::new);
        guard.armed = false;

        {
            let mut state = self.lock();
            state.in_flight.remove(key);
            match &result {
                Ok(value) => {
                    state.stats.loads += 1;
                    self.insert_locked(&mut state, key, value.clone());
                }
                Err(err) => {
                    state.stats.load_failures += 1;
                    log::debug!("Load of chunk {} failed: {}", key, err);
                }
            }
        }
        slot.publish(result.clone());
        result
    }

    fn insert_locked(&self, state: &mut CacheState<V>, key: &ChunkKey, value: Arc<V>) {
        let size = value.deep_size_of();
        if let Some(previous) = state.remove(key) {
            drop(previous);
        }

        if state.used_bytes + size > self.capacity {
            let mut freed = 0;
            let mut victims = Vec::new();
            for victim in state.lru.values() {
                if state.used_bytes - freed + size <= self.capacity {
                    break;
                }
                let Some(entry) = state.entries.get(victim) else {
                    continue;
                };
                // Pinned by a reader
                if Arc::strong_count(&entry.value) > 1 {
                    continue;
                }
                freed += entry.size;
                victims.push(victim.clone());
            }
            if state.used_bytes - freed + size > self.capacity {
                state.stats.rejected += 1;
                log::debug!(
                    "Chunk {} ({} bytes) does not fit in the chunk cache ({} of {} bytes in use)",
                    key,
                    size,
                    state.used_bytes,
                    self.capacity
                );
                return;
            }
            for victim in victims {
                state.remove(&victim);
                state.stats.evictions += 1;
            }
        }

        let tick = state.next_tick();
        state.lru.insert(tick, key.clone());
        state.entries.insert(key.clone(), Resident { value, size, tick });
        state.used_bytes += size;
    }

    /// Drop every resident entry of `dataset`.
    ///
    /// Readers holding values of the dataset keep them alive.
    pub fn invalidate_dataset(&self, dataset: &DatasetId) -> usize {
        let mut state = self.lock();
        let keys = state
            .entries
            .keys()
            .filter(|key| &key.dataset == dataset)
            .cloned()
            .collect::<Vec<_>>();
        for key in &keys {
            state.remove(key);
        }
        if !keys.is_empty() {
            log::debug!("Invalidated {} cached chunks of {}", keys.len(), dataset);
        }
        keys.len()
    }

    /// Register an open handle on `dataset`.
    ///
    /// The dataset's entries are invalidated once the last lease is dropped.
    pub fn lease(self: &Arc<Self>, dataset: DatasetId) -> DatasetLease<V> {
        *self.lock().leases.entry(dataset.clone()).or_insert(0) += 1;
        DatasetLease {
            cache: self.clone(),
            dataset,
        }
    }

    fn release(&self, dataset: &DatasetId) {
        let last = {
            let mut state = self.lock();
            match state.leases.get_mut(dataset) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    state.leases.remove(dataset);
                    true
                }
                None => false,
            }
        };
        if last {
            self.invalidate_dataset(dataset);
        }
    }

    pub fn open_leases(&self, dataset: &DatasetId) -> usize {
        self.lock().leases.get(dataset).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            used_bytes: state.used_bytes,
            ..state.stats.clone()
        }
    }
}

/// Clears the in-flight slot if the loader unwinds, so waiters are released
/// with an error instead of blocking forever.
struct LoadGuard<'a, V: DeepSizeOf + Send + Sync + 'static> {
    cache: &'a ChunkCache<V>,
    key: &'a ChunkKey,
    slot: &'a Arc<InFlight<V>>,
    armed: bool,
}

impl<V: DeepSizeOf + Send + Sync + 'static> Drop for LoadGuard<'_, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.cache.lock();
            state.in_flight.remove(self.key);
            state.stats.load_failures += 1;
        }
        self.slot.publish(Err(Error::internal(
            format!("loader for chunk {} panicked", self.key),
            location!(),
        )));
    }
}

/// Keeps a dataset's cached chunks alive while a handle on it is open.
pub struct DatasetLease<V: DeepSizeOf + Send + Sync + 'static> {
    cache: Arc<ChunkCache<V>>,
    dataset: DatasetId,
}

impl<V: DeepSizeOf + Send + Sync + 'static> DatasetLease<V> {
    pub fn dataset(&self) -> &DatasetId {
        &self.dataset
    }

    pub fn cache(&self) -> &Arc<ChunkCache<V>> {
        &self.cache
    }
}

impl<V: DeepSizeOf + Send + Sync + 'static> fmt::Debug for DatasetLease<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetLease")
            .field("dataset", &self.dataset)
            .finish()
    }
}

impl<V: DeepSizeOf + Send + Sync + 'static> Drop for DatasetLease<V> {
    fn drop(&mut self) {
        self.cache.release(&self.dataset);
    }
}
