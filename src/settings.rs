use anyhow::{bail, Context, Result};
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::cache_store::FileCacheStore;
use crate::dispatcher::RetryPolicy;
use crate::transport::DeploylessEncoder;

pub const DEFAULT_CONFIG_FILE: &str = "Config.toml";

fn default_network() -> String {
    "base".to_string()
}
fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    /// Explicit endpoint. When unset the public node for `network` is used.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Client-side cap on calls per second across all batches.
    #[serde(default)]
    pub qps_limit: Option<u32>,
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            url: None,
            network: default_network(),
            timeout_ms: default_timeout_ms(),
            qps_limit: None,
        }
    }
}

fn default_batch_size() -> usize {
    crate::fetcher::DEFAULT_BATCH_SIZE
}
fn default_max_concurrent_batches() -> usize {
    crate::dispatcher::DEFAULT_MAX_CONCURRENT_BATCHES
}
fn default_max_retries() -> usize {
    crate::dispatcher::DEFAULT_MAX_RETRIES
}
fn default_backoff_base_ms() -> u64 {
    crate::dispatcher::DEFAULT_BACKOFF_BASE_MS
}
fn default_backoff_max_ms() -> u64 {
    crate::dispatcher::DEFAULT_BACKOFF_MAX_MS
}

#[derive(Debug, Deserialize, Clone)]
pub struct Fetch {
    /// Pools per remote call. Useful range is roughly 30-120.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl Default for Fetch {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            deadline_ms: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_pools() -> usize {
    crate::cache::DEFAULT_MAX_POOLS
}
fn default_weight() -> f64 {
    0.5
}
fn default_top_n() -> usize {
    crate::cache::DEFAULT_TOP_N
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_pools")]
    pub max_pools: usize,
    /// Byte budget in MiB; wins over `max_pools` when set.
    #[serde(default)]
    pub max_size_mb: Option<f64>,
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Snapshot directory. Defaults to `~/.dexmeta_cache`.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_weight")]
    pub frequency_weight: f64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pools: default_max_pools(),
            max_size_mb: None,
            persist: true,
            dir: None,
            recency_weight: default_weight(),
            frequency_weight: default_weight(),
            top_n: default_top_n(),
        }
    }
}

/// Creation code of the metadata helper, inline as hex or in a file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Contracts {
    #[serde(default)]
    pub metadata_bytecode: Option<String>,
    #[serde(default)]
    pub metadata_bytecode_path: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub fetch: Fetch,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub contracts: Contracts,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    /// `Config.toml` from the working directory if present, then environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from `path` (required when given) or the optional default file, then apply
    /// `DEXMETA_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let source = match path {
            Some(p) => File::with_name(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let s = Config::builder().add_source(source).build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_overrides(|key| env::var(key).ok());
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Environment overrides. Empty or unparsable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = var("DEXMETA_RPC_URL") {
            self.rpc.url = Some(url);
        }
        if let Some(network) = var("DEXMETA_NETWORK") {
            self.rpc.network = network;
        }
        if let Some(size) = var("DEXMETA_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.fetch.batch_size = size;
        }
        if let Some(max) = var("DEXMETA_MAX_CONCURRENT_BATCHES").and_then(|v| v.parse().ok()) {
            self.fetch.max_concurrent_batches = max;
        }
        if let Some(dir) = var("DEXMETA_CACHE_DIR") {
            self.cache.dir = Some(dir);
        }
        if let Some(bytecode) = var("DEXMETA_METADATA_BYTECODE") {
            self.contracts.metadata_bytecode = Some(bytecode);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch.batch_size == 0 {
            bail!("fetch.batch_size must be at least 1");
        }
        if self.fetch.max_concurrent_batches == 0 {
            bail!("fetch.max_concurrent_batches must be at least 1");
        }
        if self.cache.recency_weight < 0.0 || self.cache.frequency_weight < 0.0 {
            bail!(
                "cache weights must be non-negative (recency {}, frequency {})",
                self.cache.recency_weight,
                self.cache.frequency_weight
            );
        }
        if let Some(mb) = self.cache.max_size_mb {
            if mb <= 0.0 {
                bail!("cache.max_size_mb must be positive, got {}", mb);
            }
        }
        if self.rpc.timeout_ms == 0 {
            bail!("rpc.timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn rpc_url(&self) -> String {
        self.rpc
            .url
            .clone()
            .unwrap_or_else(|| format!("https://{}-rpc.publicnode.com", self.rpc.network))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.fetch.deadline_ms.map(Duration::from_millis)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.fetch.max_retries,
            base_backoff: Duration::from_millis(self.fetch.backoff_base_ms),
            max_backoff: Duration::from_millis(self.fetch.backoff_max_ms),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_pools: self.cache.max_pools,
            max_size_bytes: self.cache.max_size_mb.map(|mb| (mb * 1024.0 * 1024.0) as usize),
            recency_weight: self.cache.recency_weight,
            frequency_weight: self.cache.frequency_weight,
            top_n: self.cache.top_n,
        }
    }

    pub fn cache_store(&self) -> FileCacheStore {
        match &self.cache.dir {
            Some(dir) => FileCacheStore::in_dir(PathBuf::from(dir)),
            None => FileCacheStore::default_location(),
        }
    }

    /// Payload encoder built from the configured helper bytecode.
    pub fn metadata_encoder(&self) -> Result<DeploylessEncoder> {
        let hex = match (&self.contracts.metadata_bytecode, &self.contracts.metadata_bytecode_path) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading metadata bytecode from {}", path))?,
            (None, None) => bail!(
                "no metadata helper bytecode configured; set contracts.metadata_bytecode, \
                 contracts.metadata_bytecode_path or DEXMETA_METADATA_BYTECODE"
            ),
        };
        DeploylessEncoder::from_hex(&hex).context("metadata bytecode is not valid hex")
    }
}
