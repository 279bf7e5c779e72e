// src/fetcher.rs
//
// Top-level pipeline: normalize -> cache lookup -> plan -> dispatch -> decode -> cache
// insert -> reassemble in input order.

use ethers::types::Address;
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::batch_planner::plan_batches;
use crate::cache::EvictionCache;
use crate::decoder::decode_batch;
use crate::dispatcher::{BatchDispatcher, BatchFailure, BatchProgress};
use crate::metrics;
use crate::normalization::normalize_addresses;
use crate::settings::Settings;
use crate::transport::RpcTransport;
use crate::types::PoolRecord;

pub const DEFAULT_BATCH_SIZE: usize = 30;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("none of the {failed} requested pools could be resolved: {cause}")]
    AllFailed { failed: usize, cause: BatchFailure },
}

/// Per-call knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Consult and populate the cache. Ignored when the fetcher has no cache.
    pub use_cache: bool,
    /// Give up on batches still in flight after this long.
    pub deadline: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            deadline: None,
        }
    }
}

impl FetchOptions {
    pub fn without_cache() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Result of one fetch.
///
/// `records` has one slot per valid input address, in input order. A `None` slot
/// belongs to a batch that failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub records: Vec<Option<PoolRecord>>,
    /// Inputs rejected by normalization.
    pub invalid: Vec<String>,
    /// Slots served from the cache.
    pub cache_hits: usize,
    /// Slots resolved through the transport.
    pub fetched: usize,
    /// Slots left empty by failed batches.
    pub failed: usize,
}

impl FetchReport {
    /// Records that resolved, in input order.
    pub fn resolved(&self) -> impl Iterator<Item = &PoolRecord> + '_ {
        self.records.iter().flatten()
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Batched, cached pool metadata lookup.
pub struct PoolMetadataFetcher {
    dispatcher: BatchDispatcher,
    cache: Option<Arc<EvictionCache>>,
    batch_size: usize,
}

impl PoolMetadataFetcher {
    pub fn new(dispatcher: BatchDispatcher) -> Self {
        Self {
            dispatcher,
            cache: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Fetcher over the configured RPC endpoint, with the cache (and its snapshot) as
    /// the `[cache]` section asks.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        settings.validate()?;

        let mut transport = RpcTransport::connect(&settings.rpc_url(), settings.rpc_timeout())?;
        if let Some(qps) = settings.rpc.qps_limit {
            transport = transport.with_rate_limit(qps);
        }
        let dispatcher = BatchDispatcher::new(Arc::new(transport), Arc::new(settings.metadata_encoder()?))
            .with_max_concurrent_batches(settings.fetch.max_concurrent_batches)
            .with_retry_policy(settings.retry_policy());

        let mut fetcher = Self::new(dispatcher).with_batch_size(settings.fetch.batch_size);
        if settings.cache.enabled {
            let cache = if settings.cache.persist {
                EvictionCache::with_store(settings.cache_config(), Box::new(settings.cache_store()))
            } else {
                EvictionCache::new(settings.cache_config())
            };
            fetcher = fetcher.with_cache(Arc::new(cache));
        }
        Ok(fetcher)
    }

    pub fn with_cache(mut self, cache: Arc<EvictionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Addresses per remote call. Zero is treated as 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Report batch completions to `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn BatchProgress>) -> Self {
        self.dispatcher = self.dispatcher.with_progress(progress);
        self
    }

    pub fn cache(&self) -> Option<&Arc<EvictionCache>> {
        self.cache.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Resolve metadata for `pools`.
    ///
    /// Malformed addresses are dropped (see [`FetchReport::invalid`]). Duplicates are
    /// fetched once and fill every position they occupy. Fails only when not a single
    /// valid address could be resolved.
    pub async fn fetch<S: AsRef<str>>(&self, pools: &[S], options: &FetchOptions) -> Result<FetchReport, FetchError> {
        let start = Instant::now();
        let normalized = normalize_addresses(pools);
        let mut report = FetchReport {
            records: vec![None; normalized.valid.len()],
            invalid: normalized.invalid,
            ..FetchReport::default()
        };
        if normalized.valid.is_empty() {
            return Ok(report);
        }

        // Unique addresses in first-appearance order -> output slots
        let mut pending: IndexMap<Address, Vec<usize>> = IndexMap::new();
        for (slot, (_, address)) in normalized.valid.iter().enumerate() {
            pending.entry(*address).or_default().push(slot);
        }

        let cache = self.cache.as_ref().filter(|_| options.use_cache);
        if let Some(cache) = cache {
            let keys: Vec<Address> = pending.keys().copied().collect();
            let hits = cache.get_many(&keys);
            for (address, record) in hits {
                if let Some(slots) = pending.shift_remove(&address) {
                    report.cache_hits += slots.len();
                    for slot in slots {
                        report.records[slot] = Some(record.clone());
                    }
                }
            }
            debug!("Cache served {} of {} slots", report.cache_hits, report.records.len());
        }

        if pending.is_empty() {
            info!("All {} pools served from cache in {:?}", report.records.len(), start.elapsed());
            return Ok(report);
        }

        let misses: Vec<(usize, Address)> = pending.keys().copied().enumerate().collect();
        let batches = plan_batches(&misses, self.batch_size);
        let outcomes = self.dispatcher.dispatch(batches, options.deadline).await;

        let mut fresh: Vec<(Address, PoolRecord)> = Vec::with_capacity(misses.len());
        let mut first_failure: Option<BatchFailure> = None;

        for outcome in outcomes {
            let decoded = outcome.result.and_then(|payload| {
                decode_batch(&payload, &outcome.batch.addresses).map_err(|e| {
                    metrics::increment_batch_failure("decode");
                    warn!("Batch {} returned an undecodable payload: {}", outcome.batch.id, e);
                    BatchFailure::Decode(e)
                })
            });

            match decoded {
                Ok(records) => {
                    for (key, record) in outcome.batch.indices.iter().zip(records) {
                        if let Some((address, slots)) = pending.get_index(*key) {
                            report.fetched += slots.len();
                            for slot in slots {
                                report.records[*slot] = Some(record.clone());
                            }
                            fresh.push((*address, record));
                        }
                    }
                }
                Err(failure) => {
                    for key in &outcome.batch.indices {
                        if let Some((_, slots)) = pending.get_index(*key) {
                            report.failed += slots.len();
                        }
                    }
                    first_failure.get_or_insert(failure);
                }
            }
        }

        if let Some(cache) = cache {
            if !fresh.is_empty() {
                cache.put_many(fresh);
            }
        }

        if let Some(cause) = first_failure {
            if report.failed == report.records.len() {
                return Err(FetchError::AllFailed {
                    failed: report.failed,
                    cause,
                });
            }
            warn!(
                "{} of {} pools could not be resolved (first failure: {})",
                report.failed,
                report.records.len(),
                cause
            );
        }

        info!(
            "Resolved {}/{} pools in {:?} ({} cached, {} fetched, {} failed)",
            report.cache_hits + report.fetched,
            report.records.len(),
            start.elapsed(),
            report.cache_hits,
            report.fetched,
            report.failed
        );
        Ok(report)
    }
}
