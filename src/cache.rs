// src/cache.rs

use crate::cache_store::{CacheStore, PersistedEntry};
use crate::metrics;
use crate::types::PoolRecord;
use ethers::types::Address;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const CACHE_NAME: &str = "pool_metadata";
const SCORE_EPSILON: f64 = 1e-12;

pub const DEFAULT_MAX_POOLS: usize = 10_000;
pub const DEFAULT_TOP_N: usize = 5;

/// How the cache bounds its resident set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityMode {
    /// Maximum number of entries.
    Count(usize),
    /// Maximum total approximate size in bytes.
    Bytes(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub max_pools: usize,
    /// Byte budget. Takes precedence over `max_pools` when set.
    pub max_size_bytes: Option<usize>,
    pub recency_weight: f64,
    pub frequency_weight: f64,
    /// Number of most-accessed keys reported by `stats()`.
    pub top_n: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_pools: DEFAULT_MAX_POOLS,
            max_size_bytes: None,
            recency_weight: 0.5,
            frequency_weight: 0.5,
            top_n: DEFAULT_TOP_N,
        }
    }
}

impl CacheConfig {
    pub fn with_max_pools(max_pools: usize) -> Self {
        Self {
            max_pools,
            ..Self::default()
        }
    }

    pub fn with_max_size_mb(max_size_mb: f64) -> Self {
        Self {
            max_size_bytes: Some((max_size_mb.max(0.0) * 1024.0 * 1024.0) as usize),
            ..Self::default()
        }
    }

    pub fn capacity(&self) -> CapacityMode {
        match self.max_size_bytes {
            Some(bytes) => CapacityMode::Bytes(bytes),
            None => CapacityMode::Count(self.max_pools),
        }
    }
}

/// Millisecond time source for access bookkeeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: PoolRecord,
    last_access_ms: u64,
    access_count: u64,
    approx_size: usize,
    inserted_seq: u64,
}

/// Eviction bookkeeping. Only ever touched with the cache mutex held.
#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<Address, CacheEntry>,
    total_bytes: usize,
    next_seq: u64,
    /// Latest timestamp handed out; keeps access times monotonic if the wall clock steps back.
    last_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheIndex {
    fn tick(&mut self, clock: &dyn Clock) -> u64 {
        self.last_tick = clock.now_ms().max(self.last_tick);
        self.last_tick
    }

    /// Insert or overwrite. Overwrites keep their insertion order and bump the count.
    fn upsert(&mut self, address: Address, record: PoolRecord, access_count: u64, now: u64) {
        let approx_size = record.approx_size();
        match self.entries.get_mut(&address) {
            Some(entry) => {
                self.total_bytes = self.total_bytes - entry.approx_size + approx_size;
                entry.record = record;
                entry.approx_size = approx_size;
                entry.access_count = entry.access_count.saturating_add(access_count);
                entry.last_access_ms = now;
            }
            None => {
                let inserted_seq = self.next_seq;
                self.next_seq += 1;
                self.total_bytes += approx_size;
                self.entries.insert(
                    address,
                    CacheEntry {
                        record,
                        last_access_ms: now,
                        access_count: access_count.max(1),
                        approx_size,
                        inserted_seq,
                    },
                );
            }
        }
    }

    fn remove(&mut self, address: &Address) -> Option<CacheEntry> {
        let entry = self.entries.remove(address)?;
        self.total_bytes -= entry.approx_size;
        Some(entry)
    }

    fn over_capacity(&self, capacity: CapacityMode) -> bool {
        match capacity {
            CapacityMode::Count(max) => self.entries.len() > max,
            CapacityMode::Bytes(max) => self.total_bytes > max,
        }
    }

    /// Entry with the highest eviction priority, skipping `protect`.
    ///
    /// priority = w_r * staleness + w_f * rarity, both normalized over resident entries:
    /// staleness is 1 for the least recently used entry and 0 for the most recent,
    /// rarity is 1 for the least frequently used entry and 0 for the most frequent.
    /// Ties go to the oldest insertion.
    fn select_victim(&self, config: &CacheConfig, protect: Option<Address>) -> Option<Address> {
        let (mut oldest, mut newest) = (u64::MAX, 0u64);
        let (mut rarest, mut commonest) = (u64::MAX, 0u64);
        for entry in self.entries.values() {
            oldest = oldest.min(entry.last_access_ms);
            newest = newest.max(entry.last_access_ms);
            rarest = rarest.min(entry.access_count);
            commonest = commonest.max(entry.access_count);
        }
        let age_span = newest.saturating_sub(oldest) as f64;
        let count_span = commonest.saturating_sub(rarest) as f64;

        let mut victim: Option<(Address, f64, u64)> = None;
        for (address, entry) in &self.entries {
            if Some(*address) == protect {
                continue;
            }
            let staleness = if age_span > 0.0 {
                (newest - entry.last_access_ms) as f64 / age_span
            } else {
                0.0
            };
            let rarity = if count_span > 0.0 {
                1.0 - (entry.access_count - rarest) as f64 / count_span
            } else {
                0.0
            };
            let priority = config.recency_weight * staleness + config.frequency_weight * rarity;

            let replace = match victim {
                None => true,
                Some((_, best, seq)) => {
                    priority > best + SCORE_EPSILON
                        || ((priority - best).abs() <= SCORE_EPSILON && entry.inserted_seq < seq)
                }
            };
            if replace {
                victim = Some((*address, priority, entry.inserted_seq));
            }
        }
        victim.map(|(address, _, _)| address)
    }

    /// Evict until within capacity. `protect` (the key just written) goes last.
    fn enforce_capacity(&mut self, config: &CacheConfig, protect: Option<Address>) -> usize {
        let capacity = config.capacity();
        let mut evicted = 0;
        while self.over_capacity(capacity) {
            let victim = self
                .select_victim(config, protect)
                .or_else(|| protect.filter(|p| self.entries.contains_key(p)));
            let Some(address) = victim else { break };
            if let Some(entry) = self.remove(&address) {
                debug!(
                    "Evicted pool {:#x} (accesses={}, last_access_ms={})",
                    address, entry.access_count, entry.last_access_ms
                );
                evicted += 1;
            }
        }
        self.evictions += evicted as u64;
        evicted
    }
}

/// Most frequently accessed key, as reported by `stats()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopEntry {
    pub address: Address,
    pub access_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub approx_bytes: usize,
    pub capacity: CapacityMode,
    pub usage_percent: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub avg_access_count: f64,
    pub persistent: bool,
    pub location: Option<String>,
    pub top_accessed: Vec<TopEntry>,
}

/// Bounded pool metadata cache with hybrid LRU/LFU eviction.
///
/// ## Features
///
/// - **Hybrid eviction**: recency and frequency, each normalized over resident entries
/// - **Count or byte bound**: the byte bound wins when both are configured
/// - **Atomic capacity**: insert and eviction run under one lock, readers never see
///   the cache above capacity
/// - **Optional persistence**: loaded once from a [`CacheStore`], written back only on
///   [`flush`](Self::flush) / [`close`](Self::close)
pub struct EvictionCache {
    config: CacheConfig,
    index: Mutex<CacheIndex>,
    store: Mutex<Option<Box<dyn CacheStore>>>,
    clock: Arc<dyn Clock>,
}

impl EvictionCache {
    /// Memory-only cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            index: Mutex::new(CacheIndex::default()),
            store: Mutex::new(None),
            clock: Arc::new(SystemClock),
        }
    }

    /// Cache backed by `store`. Persisted entries are loaded now. A corrupt or
    /// other-version snapshot is logged and ignored, with the store kept so it gets
    /// overwritten. Any other load error leaves the cache memory-only.
    pub fn with_store(config: CacheConfig, store: Box<dyn CacheStore>) -> Self {
        let cache = Self::new(config);
        match store.load() {
            Ok(entries) => {
                let loaded = entries.len();
                {
                    let mut index = cache.index();
                    for entry in entries {
                        index.last_tick = index.last_tick.max(entry.last_access_ms);
                        index.upsert(entry.address, entry.record, entry.access_count, entry.last_access_ms);
                    }
                    index.enforce_capacity(&cache.config, None);
                }
                info!("Loaded {} pools from persistent cache at {}", loaded, store.location());
                *cache.store_slot() = Some(store);
            }
            Err(e) if e.is_unreadable_snapshot() => {
                // Starts empty; the next flush or clear replaces the bad file
                error!("Discarding unreadable cache snapshot: {}", e);
                *cache.store_slot() = Some(store);
            }
            Err(e) => {
                error!("Persistent cache unavailable, continuing memory-only: {}", e);
            }
        }
        cache.record_size();
        cache
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_slot(&self) -> MutexGuard<'_, Option<Box<dyn CacheStore>>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_size(&self) {
        metrics::set_cache_size(CACHE_NAME, self.len() as f64);
    }

    /// Look up one pool. A hit bumps its access count and recency.
    pub fn get(&self, address: &Address) -> Option<PoolRecord> {
        let mut index = self.index();
        let now = index.tick(self.clock.as_ref());
        let found = index.entries.get_mut(address).map(|entry| {
            entry.access_count = entry.access_count.saturating_add(1);
            entry.last_access_ms = now;
            entry.record.clone()
        });
        if found.is_some() {
            index.hits += 1;
            metrics::increment_cache_hit(CACHE_NAME, 1);
        } else {
            index.misses += 1;
            metrics::increment_cache_miss(CACHE_NAME, 1);
        }
        found
    }

    /// Look up many pools under a single lock. Only hits appear in the result.
    pub fn get_many(&self, addresses: &[Address]) -> HashMap<Address, PoolRecord> {
        let mut index = self.index();
        let now = index.tick(self.clock.as_ref());
        let mut found = HashMap::with_capacity(addresses.len());
        let (mut hits, mut misses) = (0u64, 0u64);

        for address in addresses {
            match index.entries.get_mut(address) {
                Some(entry) => {
                    entry.access_count = entry.access_count.saturating_add(1);
                    entry.last_access_ms = now;
                    found.insert(*address, entry.record.clone());
                    hits += 1;
                }
                None => misses += 1,
            }
        }

        index.hits += hits;
        index.misses += misses;
        metrics::increment_cache_hit(CACHE_NAME, hits);
        metrics::increment_cache_miss(CACHE_NAME, misses);
        found
    }

    /// Insert or overwrite one pool, then evict down to capacity.
    pub fn put(&self, address: Address, record: PoolRecord) {
        self.put_many(std::iter::once((address, record)));
    }

    /// Insert or overwrite many pools under a single lock. Capacity is enforced after
    /// every insert.
    pub fn put_many<I>(&self, records: I)
    where
        I: IntoIterator<Item = (Address, PoolRecord)>,
    {
        let evicted = {
            let mut index = self.index();
            let now = index.tick(self.clock.as_ref());
            let mut evicted = 0;
            for (address, record) in records {
                index.upsert(address, record, 1, now);
                evicted += index.enforce_capacity(&self.config, Some(address));
            }
            evicted
        };

        if evicted > 0 {
            debug!("Evicted {} pools from cache", evicted);
            metrics::increment_cache_evictions(CACHE_NAME, evicted as u64);
        }
        self.record_size();
    }

    /// Presence check without touching access bookkeeping or hit/miss counters.
    pub fn contains(&self, address: &Address) -> bool {
        self.index().entries.contains_key(address)
    }

    /// Current access count of a resident pool.
    pub fn access_count(&self, address: &Address) -> Option<u64> {
        self.index().entries.get(address).map(|e| e.access_count)
    }

    pub fn len(&self) -> usize {
        self.index().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn approx_bytes(&self) -> usize {
        self.index().total_bytes
    }

    pub fn is_persistent(&self) -> bool {
        self.store_slot().is_some()
    }

    /// Drop every entry, reset statistics and clear the persisted copy.
    pub fn clear(&self) {
        {
            let mut index = self.index();
            let (next_seq, last_tick) = (index.next_seq, index.last_tick);
            *index = CacheIndex {
                next_seq,
                last_tick,
                ..CacheIndex::default()
            };
        }

        let mut slot = self.store_slot();
        if let Some(store) = slot.as_ref() {
            if let Err(e) = store.clear() {
                error!("Failed to clear persistent cache, continuing memory-only: {}", e);
                *slot = None;
            }
        }
        drop(slot);

        info!("Cache cleared");
        self.record_size();
    }

    pub fn stats(&self) -> CacheStats {
        let location = self.store_slot().as_ref().map(|s| s.location());
        let index = self.index();
        let capacity = self.config.capacity();

        let entries = index.entries.len();
        let used = match capacity {
            CapacityMode::Count(_) => entries,
            CapacityMode::Bytes(_) => index.total_bytes,
        };
        let limit = match capacity {
            CapacityMode::Count(max) | CapacityMode::Bytes(max) => max,
        };
        let lookups = index.hits + index.misses;
        let total_accesses: u64 = index.entries.values().map(|e| e.access_count).sum();

        let mut ranked: Vec<(&Address, &CacheEntry)> = index.entries.iter().collect();
        ranked.sort_by(|a, b| {
            b.1.access_count
                .cmp(&a.1.access_count)
                .then(a.1.inserted_seq.cmp(&b.1.inserted_seq))
        });
        let top_accessed = ranked
            .into_iter()
            .take(self.config.top_n)
            .map(|(address, entry)| TopEntry {
                address: *address,
                access_count: entry.access_count,
            })
            .collect();

        CacheStats {
            entries,
            approx_bytes: index.total_bytes,
            capacity,
            usage_percent: used as f64 / limit.max(1) as f64 * 100.0,
            hits: index.hits,
            misses: index.misses,
            hit_rate: if lookups > 0 {
                index.hits as f64 / lookups as f64
            } else {
                0.0
            },
            evictions: index.evictions,
            avg_access_count: total_accesses as f64 / entries.max(1) as f64,
            persistent: location.is_some(),
            location,
            top_accessed,
        }
    }

    /// Entries in insertion order, as they would be persisted.
    fn snapshot(&self) -> Vec<PersistedEntry> {
        let index = self.index();
        let mut entries: Vec<(&Address, &CacheEntry)> = index.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.inserted_seq);
        entries
            .into_iter()
            .map(|(address, entry)| PersistedEntry {
                address: *address,
                record: entry.record.clone(),
                access_count: entry.access_count,
                last_access_ms: entry.last_access_ms,
            })
            .collect()
    }

    /// Write the full entry set to the store. Returns the number of entries written
    /// (0 when memory-only). A store failure is logged and detaches the store.
    pub fn flush(&self) -> usize {
        let mut slot = self.store_slot();
        let Some(store) = slot.as_ref() else {
            return 0;
        };

        let snapshot = self.snapshot();
        match store.save(&snapshot) {
            Ok(()) => {
                debug!("Flushed {} pools to {}", snapshot.len(), store.location());
                snapshot.len()
            }
            Err(e) => {
                error!("Failed to flush persistent cache, continuing memory-only: {}", e);
                *slot = None;
                0
            }
        }
    }

    /// Final flush at shutdown.
    pub fn close(self) -> usize {
        let written = self.flush();
        info!("Cache closed with {} entries ({} persisted)", self.len(), written);
        written
    }
}
