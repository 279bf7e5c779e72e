// src/cache_store.rs
//
// Durable backing for the pool metadata cache. The cache loads everything once at
// construction and writes the full entry set back at explicit checkpoints.

use bincode::Options;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::PoolRecord;

pub const DEFAULT_CACHE_DIR_NAME: &str = ".dexmeta_cache";
pub const DEFAULT_CACHE_FILE_NAME: &str = "pool_cache.bin";

/// Snapshot format version; bumped when `PersistedEntry` changes shape.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache snapshot at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error("cache snapshot at {path} has version {found}, expected {expected}")]
    Version {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

impl StoreError {
    /// The store is reachable but its contents cannot be used.
    pub fn is_unreadable_snapshot(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. } | StoreError::Version { .. })
    }
}

/// One cached pool as written to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub address: Address,
    pub record: PoolRecord,
    pub access_count: u64,
    pub last_access_ms: u64,
}

/// Key -> record mapping that survives process restarts.
pub trait CacheStore: Send {
    /// Every persisted entry. A store that was never written returns an empty list.
    fn load(&self) -> Result<Vec<PersistedEntry>, StoreError>;
    /// Replace the persisted contents with `entries`.
    fn save(&self, entries: &[PersistedEntry]) -> Result<(), StoreError>;
    /// Remove everything persisted.
    fn clear(&self) -> Result<(), StoreError>;
    /// Human-readable location, for logs and `cache-info`.
    fn location(&self) -> String;
}

#[derive(Deserialize)]
struct SnapshotHeader {
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<PersistedEntry>,
}

/// Decoding never reads past `limit` bytes, so a damaged length prefix fails instead of
/// allocating. Same wire format as `bincode::serialize`.
fn snapshot_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(limit as u64)
}

/// Single-file bincode snapshot. Writes go to a sibling temp file that is renamed over
/// the snapshot, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    path: PathBuf,
}

impl FileCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/pool_cache.bin`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(DEFAULT_CACHE_FILE_NAME))
    }

    /// `~/.dexmeta_cache/pool_cache.bin`, falling back to the working directory when no
    /// home directory is known.
    pub fn default_location() -> Self {
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::in_dir(base.join(DEFAULT_CACHE_DIR_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CacheStore for FileCacheStore {
    fn load(&self) -> Result<Vec<PersistedEntry>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        let corrupt = |source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        };

        // Version first, so a snapshot from another layout is never decoded as entries
        let header: SnapshotHeader = snapshot_options(bytes.len()).deserialize(&bytes).map_err(corrupt)?;
        if header.version != SNAPSHOT_VERSION {
            return Err(StoreError::Version {
                path: self.path.clone(),
                found: header.version,
                expected: SNAPSHOT_VERSION,
            });
        }

        let snapshot: Snapshot = snapshot_options(bytes.len()).deserialize(&bytes).map_err(corrupt)?;
        Ok(snapshot.entries)
    }

    fn save(&self, entries: &[PersistedEntry]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let tmp_path = self.path.with_extension("bin.tmp");
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries: entries.to_vec(),
        };

        let file = fs::File::create(&tmp_path).map_err(|e| self.io_err(e))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &snapshot).map_err(|source| StoreError::Corrupt {
            path: tmp_path.clone(),
            source,
        })?;
        writer.flush().map_err(|e| self.io_err(e))?;
        drop(writer);

        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e))
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
