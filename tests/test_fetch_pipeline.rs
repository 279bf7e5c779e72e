//! Integration tests for the fetch pipeline
//!
//! Tests cover:
//! - Input order preservation across batch completion order, duplicates and cache hits
//! - Concurrency bound on in-flight transport calls
//! - Retry of transient errors, partial failure and all-failed reporting
//! - Deadline handling
//! - Cache reuse across fetches, eviction under a small capacity and persistence
//!
//! The transport is an in-memory fake chain: the encoder concatenates raw addresses and
//! the fake answers with ABI-encoded records, exactly like the metadata helper would.

use async_trait::async_trait;
use dexmeta_sdk::cache::{CacheConfig, EvictionCache};
use dexmeta_sdk::cache_store::FileCacheStore;
use dexmeta_sdk::decoder::encode_records;
use dexmeta_sdk::dispatcher::{BatchDispatcher, BatchFailure, RetryPolicy};
use dexmeta_sdk::transport::{CallEncoder, Transport, TransportError};
use dexmeta_sdk::types::ZERO_ADDRESS;
use dexmeta_sdk::{FetchError, FetchOptions, PoolMetadataFetcher, PoolRecord, TokenMetadata};
use ethers::types::{Address, Bytes};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sends the batch as raw 20-byte addresses.
struct RawEncoder;

impl CallEncoder for RawEncoder {
    fn encode(&self, pools: &[Address]) -> Bytes {
        Bytes::from(pools.iter().flat_map(|a| a.as_bytes().to_vec()).collect::<Vec<u8>>())
    }
}

/// In-memory stand-in for the endpoint plus the metadata helper.
#[derive(Default)]
struct FakeChain {
    pools: HashMap<Address, PoolRecord>,
    /// Latency per batch, keyed by the batch's first address.
    delays: HashMap<Address, Duration>,
    default_delay: Duration,
    /// Batches containing any of these are rejected.
    rejected: HashSet<Address>,
    /// The first N calls fail with a rate limit error.
    rate_limited_calls: usize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeChain {
    fn with_pools(records: &[PoolRecord]) -> Self {
        Self {
            pools: records.iter().map(|r| (r.pool_address, r.clone())).collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeChain {
    async fn call(&self, payload: Bytes) -> Result<Bytes, TransportError> {
        let call_no = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let requested: Vec<Address> = payload.chunks(20).map(Address::from_slice).collect();
        let delay = requested
            .first()
            .and_then(|a| self.delays.get(a))
            .copied()
            .unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;

        if call_no < self.rate_limited_calls {
            return Err(TransportError::RateLimited("429 Too Many Requests".into()));
        }
        if requested.iter().any(|a| self.rejected.contains(a)) {
            return Err(TransportError::Rejected("execution reverted".into()));
        }

        let records: Vec<PoolRecord> = requested
            .iter()
            .map(|a| match self.pools.get(a) {
                Some(record) => record.clone(),
                // The helper reports pools it cannot read with a zero pool address
                None => PoolRecord::unresolved(ZERO_ADDRESS),
            })
            .collect();
        Ok(Bytes::from(encode_records(&records)))
    }
}

fn pool(n: u64) -> PoolRecord {
    PoolRecord::new(
        Address::from_low_u64_be(0x1000 + n),
        TokenMetadata::new(Address::from_low_u64_be(0x2000 + n), format!("Token {}", n), format!("T{}", n), 18),
        TokenMetadata::new(Address::from_low_u64_be(0x3000), "USD Coin", "USDC", 6),
    )
}

fn input(record: &PoolRecord) -> String {
    format!("{:#x}", record.pool_address)
}

fn fast_retry(max_retries: usize) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

fn fetcher(chain: Arc<FakeChain>, batch_size: usize, max_concurrent: usize) -> PoolMetadataFetcher {
    let dispatcher = BatchDispatcher::new(chain, Arc::new(RawEncoder))
        .with_max_concurrent_batches(max_concurrent)
        .with_retry_policy(fast_retry(2));
    PoolMetadataFetcher::new(dispatcher).with_batch_size(batch_size)
}

/// Records come back in input order even when later batches finish first
#[tokio::test]
async fn test_output_preserves_input_order() {
    let records: Vec<PoolRecord> = (1..=7).map(pool).collect();
    let mut chain = FakeChain::with_pools(&records);
    // Earlier batches are slower
    for (i, r) in records.iter().enumerate() {
        chain
            .delays
            .insert(r.pool_address, Duration::from_millis(40 - 5 * i as u64));
    }
    let chain = Arc::new(chain);
    let fetcher = fetcher(chain.clone(), 2, 4);

    let mut inputs: Vec<String> = records.iter().map(input).collect();
    inputs.insert(3, "garbage".to_string());
    inputs.push(input(&records[0]).to_uppercase().replace("0X", "0x"));

    let report = fetcher.fetch(&inputs, &FetchOptions::without_cache()).await.unwrap();

    let mut expected: Vec<Option<PoolRecord>> = records.iter().cloned().map(Some).collect();
    expected.push(Some(records[0].clone()));
    assert_eq!(report.records, expected, "records should follow input order");
    assert_eq!(report.invalid, vec!["garbage".to_string()]);
    assert_eq!(report.fetched, 8, "the duplicate fills both of its slots");
    assert_eq!(chain.calls(), 4, "7 unique pools in batches of 2");
}

/// Cached and fetched records interleave correctly
#[tokio::test]
async fn test_hit_miss_mix_keeps_positions() {
    let records: Vec<PoolRecord> = (1..=4).map(pool).collect();
    let chain = Arc::new(FakeChain::with_pools(&records));
    let cache = Arc::new(EvictionCache::new(CacheConfig::default()));
    let fetcher = fetcher(chain.clone(), 10, 2).with_cache(cache.clone());

    cache.put(records[1].pool_address, records[1].clone());
    cache.put(records[3].pool_address, records[3].clone());

    let inputs: Vec<String> = records.iter().map(input).collect();
    let report = fetcher.fetch(&inputs, &FetchOptions::default()).await.unwrap();

    assert_eq!(report.records, records.iter().cloned().map(Some).collect::<Vec<_>>());
    assert_eq!((report.cache_hits, report.fetched), (2, 2));
    assert_eq!(chain.calls(), 1);
}

/// Two fetches of the same pool cost one transport call
#[tokio::test]
async fn test_second_fetch_is_served_from_cache() {
    let record = pool(1);
    let chain = Arc::new(FakeChain::with_pools(&[record.clone()]));
    let cache = Arc::new(EvictionCache::new(CacheConfig::default()));
    let fetcher = fetcher(chain.clone(), 30, 3).with_cache(cache.clone());

    let first = fetcher.fetch(&[input(&record)], &FetchOptions::default()).await.unwrap();
    assert_eq!(cache.access_count(&record.pool_address), Some(1));

    let second = fetcher.fetch(&[input(&record)], &FetchOptions::default()).await.unwrap();

    assert_eq!(chain.calls(), 1, "second fetch must not reach the transport");
    assert_eq!(first.records, second.records);
    assert_eq!(second.cache_hits, 1);
    assert_eq!(cache.access_count(&record.pool_address), Some(2));
}

/// The transport never sees more than max_concurrent_batches calls at once
#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let records: Vec<PoolRecord> = (1..=20).map(pool).collect();
    let mut chain = FakeChain::with_pools(&records);
    chain.default_delay = Duration::from_millis(10);
    let chain = Arc::new(chain);
    let fetcher = fetcher(chain.clone(), 1, 3);

    let inputs: Vec<String> = records.iter().map(input).collect();
    let report = fetcher.fetch(&inputs, &FetchOptions::without_cache()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(chain.calls(), 20);
    assert!(
        chain.max_in_flight() <= 3,
        "saw {} concurrent calls with a bound of 3",
        chain.max_in_flight()
    );
}

/// Two pools, batch size 1, two concurrent batches: both calls overlap
#[tokio::test]
async fn test_two_single_pool_batches_run_concurrently() {
    let records = vec![pool(1), pool(2)];
    let mut chain = FakeChain::with_pools(&records);
    chain.default_delay = Duration::from_millis(50);
    let chain = Arc::new(chain);
    let fetcher = fetcher(chain.clone(), 1, 2);

    let inputs: Vec<String> = records.iter().map(input).collect();
    let report = fetcher.fetch(&inputs, &FetchOptions::without_cache()).await.unwrap();

    assert_eq!(chain.calls(), 2);
    assert_eq!(chain.max_in_flight(), 2);
    assert_eq!(report.records, vec![Some(records[0].clone()), Some(records[1].clone())]);
}

/// A pool without standard token accessors decodes to sentinel metadata
#[tokio::test]
async fn test_nonstandard_pool_gets_sentinels() {
    let mut odd = pool(1);
    odd.token0 = TokenMetadata::unavailable();
    let unknown = Address::from_low_u64_be(0xdead);
    let chain = Arc::new(FakeChain::with_pools(&[odd.clone()]));
    let fetcher = fetcher(chain, 30, 1);

    let report = fetcher
        .fetch(&[input(&odd), format!("{:#x}", unknown)], &FetchOptions::without_cache())
        .await
        .unwrap();

    let first = report.records[0].as_ref().unwrap();
    assert_eq!(first.token0.name, "");
    assert_eq!(first.token0.symbol, "");
    assert_eq!(first.token0.decimals, 0);
    assert_eq!(first.token1, odd.token1);

    let second = report.records[1].as_ref().unwrap();
    assert_eq!(second, &PoolRecord::unresolved(unknown), "unreadable pool keeps its address");
}

/// Rate-limited calls are retried until they succeed
#[tokio::test]
async fn test_transient_errors_are_retried() {
    let record = pool(1);
    let mut chain = FakeChain::with_pools(&[record.clone()]);
    chain.rate_limited_calls = 2;
    let chain = Arc::new(chain);
    let fetcher = fetcher(chain.clone(), 30, 1);

    let report = fetcher.fetch(&[input(&record)], &FetchOptions::without_cache()).await.unwrap();

    assert_eq!(report.records, vec![Some(record)]);
    assert_eq!(chain.calls(), 3, "two rate-limited attempts then success");
}

/// A rejected batch leaves None at its positions and is not retried
#[tokio::test]
async fn test_failed_batch_leaves_gaps() {
    let records: Vec<PoolRecord> = (1..=3).map(pool).collect();
    let mut chain = FakeChain::with_pools(&records);
    chain.rejected.insert(records[1].pool_address);
    let chain = Arc::new(chain);
    let cache = Arc::new(EvictionCache::new(CacheConfig::default()));
    let fetcher = fetcher(chain.clone(), 1, 3).with_cache(cache.clone());

    let inputs: Vec<String> = records.iter().map(input).collect();
    let report = fetcher.fetch(&inputs, &FetchOptions::default()).await.unwrap();

    assert_eq!(
        report.records,
        vec![Some(records[0].clone()), None, Some(records[2].clone())]
    );
    assert_eq!((report.fetched, report.failed), (2, 1));
    assert_eq!(chain.calls(), 3, "rejections are not retried");
    assert!(!cache.contains(&records[1].pool_address), "failures are never cached");
}

/// Nothing resolved is an error, not an empty success
#[tokio::test]
async fn test_all_failed_is_reported() {
    let records: Vec<PoolRecord> = (1..=2).map(pool).collect();
    let mut chain = FakeChain::with_pools(&records);
    chain.rejected.extend(records.iter().map(|r| r.pool_address));
    let fetcher = fetcher(Arc::new(chain), 1, 2);

    let inputs: Vec<String> = records.iter().map(input).collect();
    let err = fetcher.fetch(&inputs, &FetchOptions::without_cache()).await.unwrap_err();

    let FetchError::AllFailed { failed, cause } = err;
    assert_eq!(failed, 2);
    assert!(matches!(cause, BatchFailure::Transport(TransportError::Rejected(_))));
}

/// On deadline, slow batches are abandoned but cached and finished results survive
#[tokio::test]
async fn test_deadline_returns_partial_results() {
    let cached = pool(1);
    let fast = pool(2);
    let slow = pool(3);
    let mut chain = FakeChain::with_pools(&[cached.clone(), fast.clone(), slow.clone()]);
    chain.delays.insert(slow.pool_address, Duration::from_secs(10));
    let chain = Arc::new(chain);
    let cache = Arc::new(EvictionCache::new(CacheConfig::default()));
    cache.put(cached.pool_address, cached.clone());
    let fetcher = fetcher(chain, 1, 2).with_cache(cache.clone());

    let options = FetchOptions::default().with_deadline(Duration::from_millis(200));
    let inputs = vec![input(&cached), input(&fast), input(&slow)];
    let report = fetcher.fetch(&inputs, &options).await.unwrap();

    assert_eq!(
        report.records,
        vec![Some(cached), Some(fast.clone()), None]
    );
    assert_eq!((report.cache_hits, report.fetched, report.failed), (1, 1, 1));
    assert!(cache.contains(&fast.pool_address));
    assert!(!cache.contains(&slow.pool_address));
}

/// With room for two pools, fetching a third evicts the least favored one
#[tokio::test]
async fn test_small_cache_evicts_and_refetches() {
    let records: Vec<PoolRecord> = (1..=3).map(pool).collect();
    let chain = Arc::new(FakeChain::with_pools(&records));
    let cache = Arc::new(EvictionCache::new(CacheConfig::with_max_pools(2)));
    let fetcher = fetcher(chain.clone(), 30, 1).with_cache(cache.clone());

    for record in &records {
        fetcher.fetch(&[input(record)], &FetchOptions::default()).await.unwrap();
    }
    assert_eq!(cache.len(), 2);
    assert!(!cache.contains(&records[0].pool_address), "oldest, least used pool goes first");
    assert_eq!(chain.calls(), 3);

    let again = fetcher.fetch(&[input(&records[0])], &FetchOptions::default()).await.unwrap();
    assert_eq!(again.cache_hits, 0);
    assert_eq!(chain.calls(), 4, "evicted pool is a miss");
    assert_eq!(cache.len(), 2);
}

/// A flushed cache starts warm in the next process
#[tokio::test]
async fn test_persisted_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let records: Vec<PoolRecord> = (1..=2).map(pool).collect();
    let inputs: Vec<String> = records.iter().map(input).collect();

    {
        let chain = Arc::new(FakeChain::with_pools(&records));
        let cache = Arc::new(EvictionCache::with_store(
            CacheConfig::default(),
            Box::new(FileCacheStore::in_dir(dir.path())),
        ));
        let fetcher = fetcher(chain, 30, 1).with_cache(cache.clone());
        fetcher.fetch(&inputs, &FetchOptions::default()).await.unwrap();
        assert_eq!(cache.flush(), 2);
    }

    let chain = Arc::new(FakeChain::with_pools(&records));
    let cache = Arc::new(EvictionCache::with_store(
        CacheConfig::default(),
        Box::new(FileCacheStore::in_dir(dir.path())),
    ));
    assert!(cache.is_persistent());
    assert_eq!(cache.len(), 2);

    let fetcher = fetcher(chain.clone(), 30, 1).with_cache(cache);
    let report = fetcher.fetch(&inputs, &FetchOptions::default()).await.unwrap();

    assert_eq!(report.cache_hits, 2);
    assert_eq!(chain.calls(), 0);
}

/// A damaged snapshot is discarded: the cache starts empty, keeps serving hits, and the
/// next flush replaces the file with a readable one
#[tokio::test]
async fn test_damaged_snapshot_is_replaced_on_flush() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCacheStore::in_dir(dir.path());
    std::fs::write(store.path(), b"not a snapshot").unwrap();

    let record = pool(1);
    let chain = Arc::new(FakeChain::with_pools(&[record.clone()]));
    let cache = Arc::new(EvictionCache::with_store(CacheConfig::default(), Box::new(store)));
    assert!(cache.is_empty());

    let fetcher = fetcher(chain.clone(), 30, 1).with_cache(cache.clone());
    fetcher.fetch(&[input(&record)], &FetchOptions::default()).await.unwrap();
    fetcher.fetch(&[input(&record)], &FetchOptions::default()).await.unwrap();
    assert_eq!(chain.calls(), 1, "memory cache still serves hits");

    assert_eq!(cache.flush(), 1);
    let reloaded = EvictionCache::with_store(CacheConfig::default(), Box::new(FileCacheStore::in_dir(dir.path())));
    assert_eq!(reloaded.get(&record.pool_address), Some(record));
}

/// A store that cannot be read at all leaves a working memory-only cache
#[tokio::test]
async fn test_unreachable_store_degrades_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCacheStore::in_dir(dir.path());
    // A directory where the snapshot file should be makes every read fail
    std::fs::create_dir(store.path()).unwrap();

    let record = pool(1);
    let chain = Arc::new(FakeChain::with_pools(&[record.clone()]));
    let cache = Arc::new(EvictionCache::with_store(CacheConfig::default(), Box::new(store)));
    assert!(!cache.is_persistent());

    let fetcher = fetcher(chain.clone(), 30, 1).with_cache(cache.clone());
    fetcher.fetch(&[input(&record)], &FetchOptions::default()).await.unwrap();
    fetcher.fetch(&[input(&record)], &FetchOptions::default()).await.unwrap();

    assert_eq!(chain.calls(), 1, "memory cache still serves hits");
    assert_eq!(cache.flush(), 0);
}
