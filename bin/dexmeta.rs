//! # dexmeta
//!
//! Command-line front end for the DexMeta SDK.
//!
//! ## Usage
//!
//! ```bash
//! # Resolve two pools on Base and print them
//! dexmeta fetch 0x88A43bbDF9D098eEC7bCEda4e2494615dfD9bB9C 0xd0b53D9277642d899DF5C87A3966A349A798F224
//!
//! # Write a CSV file, bypassing the cache
//! dexmeta fetch --no-cache --output pools.csv 0x88A43bbDF9D098eEC7bCEda4e2494615dfD9bB9C
//!
//! # Cache maintenance
//! dexmeta cache-info
//! dexmeta cache-clear
//!
//! # Pick batch parameters for a 300 requests/minute endpoint
//! dexmeta tune --rpm 300
//! ```
//!
//! Settings come from `Config.toml` (or `--config`), then `DEXMETA_*` environment
//! variables, then flags.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use dexmeta_sdk::cache::{CapacityMode, EvictionCache};
use dexmeta_sdk::cache_store::CacheStore;
use dexmeta_sdk::dispatcher::BatchProgress;
use dexmeta_sdk::output::{self, OutputFormat};
use dexmeta_sdk::tuning::{self, DEFAULT_TARGET_UTILIZATION};
use dexmeta_sdk::{FetchOptions, PoolMetadataFetcher, PoolRecord, Settings};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "dexmeta")]
#[command(about = "Batched, cached DEX pool metadata lookup")]
#[command(version)]
struct Cli {
    /// Settings file (default: ./Config.toml if present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch token metadata for pool addresses
    Fetch(FetchArgs),
    /// Show what the persistent cache holds
    CacheInfo,
    /// Remove every cached pool
    CacheClear,
    /// Recommend batch size and concurrency for a rate-limited endpoint
    Tune(TuneArgs),
}

#[derive(Args)]
struct FetchArgs {
    /// Pool addresses (0x-prefixed, 40 hex digits)
    #[arg(required = true)]
    pools: Vec<String>,
    /// Network name used to build the default public RPC URL
    #[arg(long)]
    network: Option<String>,
    /// Explicit RPC URL; wins over --network
    #[arg(long)]
    rpc_url: Option<String>,
    /// Pools per remote call
    #[arg(long)]
    batch_size: Option<usize>,
    /// Maximum calls in flight
    #[arg(long)]
    max_concurrent_batches: Option<usize>,
    /// Write records to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Output format (default: from the output file extension, else text)
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,
    /// Neither read nor populate the cache
    #[arg(long)]
    no_cache: bool,
    /// Keep the cache in memory only
    #[arg(long)]
    no_cache_persist: bool,
    /// Give up on batches still running after this many milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,
}

#[derive(Args)]
struct TuneArgs {
    /// Endpoint limit in requests per minute
    #[arg(long, conflicts_with = "rps", required_unless_present = "rps")]
    rpm: Option<f64>,
    /// Endpoint limit in requests per second
    #[arg(long)]
    rps: Option<f64>,
    /// Typical response time of one batch call
    #[arg(long, default_value_t = 700)]
    avg_response_ms: u64,
    /// Share of the limit to use, in (0, 1]
    #[arg(long, default_value_t = DEFAULT_TARGET_UTILIZATION)]
    utilization: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())
        .with_context(|| format!("loading settings from {}", cli.config.as_deref().unwrap_or("Config.toml")))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str())).init();

    #[cfg(feature = "observability")]
    install_metrics_exporter();

    match cli.command {
        Commands::Fetch(args) => run_fetch(settings, args).await,
        Commands::CacheInfo => run_cache_info(&settings),
        Commands::CacheClear => run_cache_clear(&settings),
        Commands::Tune(args) => run_tune(&args),
    }
}

#[cfg(feature = "observability")]
fn install_metrics_exporter() {
    match metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        Ok(()) => dexmeta_sdk::metrics::describe_metrics(),
        Err(e) => log::warn!("Prometheus exporter not installed: {}", e),
    }
}

async fn run_fetch(mut settings: Settings, args: FetchArgs) -> Result<()> {
    if let Some(network) = args.network {
        settings.rpc.network = network;
    }
    if let Some(url) = args.rpc_url {
        settings.rpc.url = Some(url);
    }
    if let Some(size) = args.batch_size {
        settings.fetch.batch_size = size;
    }
    if let Some(max) = args.max_concurrent_batches {
        settings.fetch.max_concurrent_batches = max;
    }
    if let Some(ms) = args.deadline_ms {
        settings.fetch.deadline_ms = Some(ms);
    }
    if args.no_cache {
        settings.cache.enabled = false;
    }
    if args.no_cache_persist {
        settings.cache.persist = false;
    }

    let progress = FetchProgress::new();
    let fetcher = PoolMetadataFetcher::from_settings(&settings)?.with_progress(Arc::new(progress.clone()));
    let options = FetchOptions {
        use_cache: settings.cache.enabled,
        deadline: settings.deadline(),
    };

    println!(
        "{} {} pools from {} (batch size {}, {} concurrent)",
        "Fetching".cyan().bold(),
        args.pools.len(),
        settings.rpc_url(),
        settings.fetch.batch_size,
        settings.fetch.max_concurrent_batches
    );

    let start = Instant::now();
    let result = fetcher.fetch(&args.pools, &options).await;
    let elapsed = start.elapsed();
    progress.finish();

    if let Some(cache) = fetcher.cache() {
        cache.flush();
    }
    let report = result?;

    let records: Vec<PoolRecord> = report.resolved().cloned().collect();
    match &args.output {
        Some(path) => {
            let format = args.format.unwrap_or_else(|| OutputFormat::from_path(path));
            output::write_records(path, &records, format)?;
            println!("{} {} records to {}", "Wrote".green().bold(), records.len(), path.display());
        }
        None => {
            let rendered = output::render(&records, args.format.unwrap_or(OutputFormat::Text))?;
            println!("{}", rendered);
        }
    }

    println!();
    println!(
        "{} {} pools in {:.2}s ({:.1} pools/s)",
        "Resolved".green().bold(),
        records.len(),
        elapsed.as_secs_f64(),
        throughput(records.len(), elapsed)
    );
    println!("  from cache: {}, fetched: {}", report.cache_hits, report.fetched);
    if report.failed > 0 {
        println!("  {} {}", "failed:".red().bold(), report.failed);
    }
    if !report.invalid.is_empty() {
        println!("  {} {}", "invalid:".yellow().bold(), report.invalid.join(", "));
    }
    Ok(())
}

/// Progress bar over batches, advanced as each batch completes.
#[derive(Clone)]
struct FetchProgress {
    bar: ProgressBar,
    failed_pools: Arc<AtomicUsize>,
}

impl FetchProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} batches {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self {
            bar,
            failed_pools: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BatchProgress for FetchProgress {
    fn batches_planned(&self, batches: usize) {
        self.bar.set_length(batches as u64);
        self.bar.reset_elapsed();
    }

    fn batch_finished(&self, pools: usize, success: bool) {
        if !success {
            let failed = self.failed_pools.fetch_add(pools, Ordering::Relaxed) + pools;
            self.bar.set_message(format!("({} pools failed)", failed).red().to_string());
        }
        self.bar.inc(1);
    }
}

fn throughput(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn open_cache(settings: &Settings) -> EvictionCache {
    EvictionCache::with_store(settings.cache_config(), Box::new(settings.cache_store()))
}

fn run_cache_info(settings: &Settings) -> Result<()> {
    let stats = open_cache(settings).stats();

    println!("{}", "Pool metadata cache".cyan().bold());
    println!(
        "  location:   {}",
        stats.location.as_deref().unwrap_or("(unavailable, memory-only)")
    );
    println!("  entries:    {}", stats.entries);
    println!("  size:       {:.1} KiB", stats.approx_bytes as f64 / 1024.0);
    match stats.capacity {
        CapacityMode::Count(max) => println!("  capacity:   {} pools ({:.1}% used)", max, stats.usage_percent),
        CapacityMode::Bytes(max) => println!(
            "  capacity:   {:.2} MiB ({:.1}% used)",
            max as f64 / (1024.0 * 1024.0),
            stats.usage_percent
        ),
    }
    println!("  avg access: {:.2}", stats.avg_access_count);

    if !stats.top_accessed.is_empty() {
        println!("  most accessed:");
        for entry in &stats.top_accessed {
            println!("    {:#x}  {}", entry.address, entry.access_count);
        }
    }
    Ok(())
}

fn run_cache_clear(settings: &Settings) -> Result<()> {
    let cache = open_cache(settings);
    let entries = cache.len();
    cache.clear();
    if !cache.is_persistent() {
        // The cache could not open the snapshot; remove it directly
        let store = settings.cache_store();
        store
            .clear()
            .with_context(|| format!("removing cache snapshot at {}", store.location()))?;
    }
    println!("{} {} cached pools", "Cleared".green().bold(), entries);
    Ok(())
}

fn run_tune(args: &TuneArgs) -> Result<()> {
    let (rate_limit, per_second) = match (args.rpm, args.rps) {
        (Some(rpm), _) => (rpm, false),
        (None, Some(rps)) => (rps, true),
        (None, None) => anyhow::bail!("one of --rpm or --rps is required"),
    };
    let avg_response = args.avg_response_ms as f64 / 1000.0;
    let params = tuning::calculate_rate_limit_params(rate_limit, per_second, avg_response, args.utilization)?;

    println!("{}", "Recommended settings".cyan().bold());
    println!("  batch_size:             {}", params.batch_size);
    println!("  max_concurrent_batches: {}", params.max_concurrent_batches);
    println!(
        "  estimated load:         {:.1} rpm of {:.0} ({:.1}%)",
        params.estimated_rpm, params.rate_limit_rpm, params.utilization_percent
    );
    println!();
    println!("[fetch]");
    println!("batch_size = {}", params.batch_size);
    println!("max_concurrent_batches = {}", params.max_concurrent_batches);
    Ok(())
}
