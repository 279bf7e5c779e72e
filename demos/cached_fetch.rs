//! # Cached Fetch Example
//!
//! Resolves the same pools twice through one fetcher. The first pass goes to the
//! endpoint, the second is served from the hybrid LRU/LFU cache. With persistence on,
//! a later run starts warm.
//!
//! ## Prerequisites
//!
//! - Metadata helper bytecode in `Config.toml` (`[contracts] metadata_bytecode_path`)
//!   or in `DEXMETA_METADATA_BYTECODE`
//! - Optionally `DEXMETA_RPC_URL` (defaults to the public Base node)
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=debug cargo run --example cached_fetch
//! ```

use anyhow::Result;
use dexmeta_sdk::{FetchOptions, PoolMetadataFetcher, Settings};
use std::time::Instant;

const POOL_ADDRESSES: [&str; 4] = [
    "0xfBB6Eed8e7aa03B138556eeDaF5D271A5E1e43ef", // cbBTC/USDC on Uniswap v3
    "0x31f609019d0CC0b8cC865656142d6FeD69853689", // POPCAT/WETH on Uniswap v2
    "0x6cDcb1C4A4D1C3C6d054b27AC5B77e89eAFb971d", // AERO/USDC on Aerodrome
    "0x323b43332F97B1852D8567a08B1E8ed67d25A8d5", // msETH/WETH on PancakeSwap
];

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let mut settings = Settings::new()?;
    settings.fetch.batch_size = 2;
    settings.fetch.max_concurrent_batches = 2;
    settings.cache.max_pools = 1_000;

    let fetcher = PoolMetadataFetcher::from_settings(&settings)?;
    let options = FetchOptions::default();

    println!("🧊 Cold fetch ({} pools)...", POOL_ADDRESSES.len());
    let start = Instant::now();
    let cold = fetcher.fetch(&POOL_ADDRESSES, &options).await?;
    let cold_time = start.elapsed();
    println!(
        "✅ {} pools in {:?} ({} from cache)",
        cold.resolved().count(),
        cold_time,
        cold.cache_hits
    );
    for record in cold.resolved() {
        println!("{}\n", record);
    }

    println!("🔥 Warm fetch...");
    let start = Instant::now();
    let warm = fetcher.fetch(&POOL_ADDRESSES, &options).await?;
    let warm_time = start.elapsed();
    println!(
        "✅ {} pools in {:?} ({} from cache)",
        warm.resolved().count(),
        warm_time,
        warm.cache_hits
    );
    if warm_time.as_secs_f64() > 0.0 {
        println!(
            "⚡ Speedup from caching: {:.1}x",
            cold_time.as_secs_f64() / warm_time.as_secs_f64()
        );
    }

    if let Some(cache) = fetcher.cache() {
        let written = cache.flush();
        let stats = cache.stats();
        println!(
            "💾 Cache holds {} pools ({} persisted to {})",
            stats.entries,
            written,
            stats.location.as_deref().unwrap_or("memory only")
        );
    }

    Ok(())
}
