// src/dispatcher.rs
//
// Sends planned batches to the transport with bounded parallelism.
//
// Every batch becomes one tokio task. A semaphore owned by the dispatcher caps how many
// of them are talking to the endpoint at once, across concurrent dispatches; the rest
// wait for a permit. Transient transport errors are retried with exponential backoff
// while the permit is held, so retries count against the concurrency bound too.

use ethers::types::Bytes;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::batch_planner::Batch;
use crate::decoder::DecodeError;
use crate::metrics;
use crate::transport::{CallEncoder, Transport, TransportError};

pub const DEFAULT_MAX_CONCURRENT_BATCHES: usize = 3;
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 200;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;

/// Why a batch produced no records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchFailure {
    #[error("transport failed: {0}")]
    Transport(TransportError),
    #[error("undecodable response: {0}")]
    Decode(DecodeError),
    #[error("deadline exceeded before the batch completed")]
    DeadlineExceeded,
    #[error("batch task failed: {0}")]
    TaskFailed(String),
}

impl BatchFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            BatchFailure::Transport(e) => e.kind(),
            BatchFailure::Decode(_) => "decode",
            BatchFailure::DeadlineExceeded => "deadline",
            BatchFailure::TaskFailed(_) => "task",
        }
    }
}

/// Result of one dispatched batch. The batch travels with its result so callers can
/// map records back to input positions.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch: Batch,
    pub result: Result<Bytes, BatchFailure>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Exponential backoff for transient transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: usize,
    /// Delay before the first retry. Doubles on every further retry.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            max_backoff: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delays between attempts: base, 2·base, 4·base, … capped at `max_backoff`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // from_millis(2) yields 2, 4, 8 ms; the factor rescales that to base, 2·base, …
        let factor = (self.base_backoff.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_backoff)
            .take(self.max_retries)
    }
}

/// Observer of batch completions, e.g. a progress bar.
pub trait BatchProgress: Send + Sync {
    /// A dispatch is about to send `batches` batches.
    fn batches_planned(&self, batches: usize);
    /// One batch of `pools` addresses finished, successfully or not.
    fn batch_finished(&self, pools: usize, success: bool);
}

/// Bounded-parallel batch sender.
///
/// The concurrency bound is shared by every `dispatch` running on the same dispatcher.
pub struct BatchDispatcher {
    transport: Arc<dyn Transport>,
    encoder: Arc<dyn CallEncoder>,
    max_concurrent_batches: usize,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    progress: Option<Arc<dyn BatchProgress>>,
}

impl BatchDispatcher {
    pub fn new(transport: Arc<dyn Transport>, encoder: Arc<dyn CallEncoder>) -> Self {
        Self {
            transport,
            encoder,
            max_concurrent_batches: DEFAULT_MAX_CONCURRENT_BATCHES,
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_BATCHES)),
            retry: RetryPolicy::default(),
            progress: None,
        }
    }

    /// Maximum transport calls in flight. Zero is treated as 1.
    pub fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.max_concurrent_batches = max.max(1);
        self.permits = Arc::new(Semaphore::new(self.max_concurrent_batches));
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn BatchProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn max_concurrent_batches(&self) -> usize {
        self.max_concurrent_batches
    }

    /// Send every batch and collect exactly one outcome per batch, in batch order.
    ///
    /// With a `deadline`, tasks still running when it expires are aborted and their
    /// batches reported as [`BatchFailure::DeadlineExceeded`]. Batches that already
    /// completed keep their results.
    pub async fn dispatch(&self, batches: Vec<Batch>, deadline: Option<Duration>) -> Vec<BatchOutcome> {
        if batches.is_empty() {
            return Vec::new();
        }

        let start = Instant::now();
        let deadline_at = deadline.map(|d| tokio::time::Instant::now() + d);
        let mut tasks: Vec<(Batch, JoinHandle<Result<Bytes, BatchFailure>>)> = Vec::with_capacity(batches.len());

        debug!(
            "Dispatching {} batches (max {} concurrent)",
            batches.len(),
            self.max_concurrent_batches
        );
        if let Some(progress) = &self.progress {
            progress.batches_planned(batches.len());
        }

        for batch in batches {
            metrics::record_batch_size(batch.len());
            let payload = self.encoder.encode(&batch.addresses);
            let permits = self.permits.clone();
            let transport = self.transport.clone();
            let retry = self.retry.clone();
            let progress = self.progress.clone();
            let batch_id = batch.id;
            let pools = batch.len();

            let task = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| BatchFailure::TaskFailed(e.to_string()))?;
                let result = call_with_retry(transport, payload, &retry, batch_id)
                    .await
                    .map_err(BatchFailure::Transport);
                if let Some(progress) = progress {
                    progress.batch_finished(pools, result.is_ok());
                }
                result
            });

            tasks.push((batch, task));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (batch, mut task) in tasks {
            let joined = match deadline_at {
                // An already-finished task still resolves even when the deadline has passed
                Some(at) => match tokio::time::timeout_at(at, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        task.abort();
                        outcomes.push(BatchOutcome {
                            batch,
                            result: Err(BatchFailure::DeadlineExceeded),
                        });
                        continue;
                    }
                },
                None => task.await,
            };

            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(BatchFailure::DeadlineExceeded),
                Err(e) => Err(BatchFailure::TaskFailed(e.to_string())),
            };
            outcomes.push(BatchOutcome { batch, result });
        }

        let failed: Vec<&BatchOutcome> = outcomes.iter().filter(|o| !o.is_success()).collect();
        for outcome in &failed {
            if let Err(failure) = &outcome.result {
                metrics::increment_batch_failure(failure.kind());
                warn!(
                    "Batch {} ({} pools) failed: {}",
                    outcome.batch.id,
                    outcome.batch.len(),
                    failure
                );
            }
        }
        info!(
            "Dispatched {} batches in {:?} ({} failed)",
            outcomes.len(),
            start.elapsed(),
            failed.len()
        );

        outcomes
    }
}

async fn call_with_retry(
    transport: Arc<dyn Transport>,
    payload: Bytes,
    retry: &RetryPolicy,
    batch_id: usize,
) -> Result<Bytes, TransportError> {
    let mut attempt = 0usize;
    let action = || {
        attempt += 1;
        let transport = transport.clone();
        let payload = payload.clone();
        let current = attempt;
        async move {
            if current > 1 {
                debug!("Batch {}: attempt {}", batch_id, current);
            }
            transport.call(payload).await
        }
    };

    let mut retries_left = retry.max_retries;
    let should_retry = |e: &TransportError| {
        if !e.is_transient() || retries_left == 0 {
            return false;
        }
        retries_left -= 1;
        metrics::increment_transport_retry(e.kind());
        debug!("Batch {}: transient error, retrying: {}", batch_id, e);
        true
    };

    RetryIf::spawn(retry.delays(), action, should_retry).await
}
