//! # DexMeta SDK
//!
//! Batched, cached retrieval of DEX pool metadata over a read-only EVM RPC endpoint.
//! Given a list of pool addresses, the SDK resolves each pool's two tokens with their
//! name, symbol and decimals, using as few round trips as possible.
//!
//! ## Overview
//!
//! - **Batching**: addresses are grouped and resolved by a single deployless `eth_call`
//!   per group
//! - **Bounded concurrency**: a semaphore caps in-flight calls; transient errors are
//!   retried with exponential backoff
//! - **Tolerant decoding**: pools that do not expose the expected token accessors get
//!   sentinel values instead of failing their batch
//! - **Hybrid LRU/LFU cache**: recency and frequency of use decide what stays resident,
//!   optionally persisted between runs
//!
//! ## Architecture
//!
//! ### Pipeline
//! `normalization` → `cache` lookup → `batch_planner` → `dispatcher` → `decoder` →
//! `cache` insert, orchestrated by [`PoolMetadataFetcher`].
//!
//! ### Collaborators
//! The network boundary is two traits in `transport`: [`transport::CallEncoder`] builds
//! the payload and [`transport::Transport`] performs the call. Cache persistence goes
//! through [`cache_store::CacheStore`].

// Core Types
/// Pool and token metadata records
pub mod types;

// Pipeline
/// Address validation and canonicalization
pub mod normalization;
/// Partitioning of addresses into batches
pub mod batch_planner;
/// Bounded-concurrency batch dispatch with retries
pub mod dispatcher;
/// Decoding of helper-call return data
pub mod decoder;
/// Fetch orchestration
pub mod fetcher;

// Caching
/// Hybrid LRU/LFU eviction cache
pub mod cache;
/// Durable cache snapshots
pub mod cache_store;

// Infrastructure
/// Payload encoding and RPC transport
pub mod transport;
/// Metrics and observability
pub mod metrics;

// Command-line support
/// Text/JSON/CSV rendering of records
pub mod output;
/// Rate-limit based parameter recommendation
pub mod tuning;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use cache::{CacheConfig, EvictionCache};
pub use fetcher::{FetchError, FetchOptions, FetchReport, PoolMetadataFetcher};
pub use settings::Settings;
pub use types::{PoolRecord, TokenMetadata};
