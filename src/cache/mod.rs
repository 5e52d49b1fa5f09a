//! # Cache Module
//!
//! Content-addressed storage for decoded audio.
//!
//! Entries are keyed by the hex SHA-256 of a song's source locator (see
//! [`cache_key`]) and hold the exact opus-in-webm bytes produced by the
//! transcoder, so a cache hit can be streamed without touching the network.
//!
//! ## Write path
//!
//! Writers stream into `<cache_dir>/tmp/<key>` and the file is renamed into
//! place only once the whole stream was written. A reader therefore never
//! sees a partial entry, and an interrupted write leaves nothing behind but a
//! temp file that [`ContentCache::cleanup`] removes on the next start.
//!
//! ## Leases
//!
//! [`ContentCache::try_get_path`] returns a [`CachedEntry`] that keeps the
//! entry leased while it is being read. Cleanup never touches leased entries
//! or temp files that are still being written.

pub mod file_cache;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use file_cache::FileCache;

/// Derives the cache key for a source locator.
pub fn cache_key(locator: &str) -> String {
    hex::encode(Sha256::digest(locator.as_bytes()))
}

/// Content-addressable storage for transcoded audio.
#[async_trait]
pub trait ContentCache: Send + Sync {
    /// Returns the stored entry for `key`, if a complete one exists.
    async fn try_get_path(&self, key: &str) -> Option<CachedEntry>;

    /// Opens a sink that stores a new entry under `key` once finished.
    async fn open_write_sink(&self, key: &str) -> Result<Box<dyn CacheSink>>;

    /// Removes leftovers from previous runs. Called once at startup.
    async fn cleanup(&self) -> Result<()>;
}

/// Streaming writer for one cache entry.
#[async_trait]
pub trait CacheSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Publishes the entry. A sink dropped without `finish` publishes nothing.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// A complete cache entry, leased for as long as this value lives.
#[derive(Debug)]
pub struct CachedEntry {
    path: PathBuf,
    _lease: Lease,
}

impl CachedEntry {
    pub fn new(path: PathBuf, lease: Lease) -> Self {
        Self {
            path,
            _lease: lease,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reference counts of keys that are in use.
#[derive(Debug, Default, Clone)]
pub struct LeaseTable {
    leases: Arc<DashMap<String, usize>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> Lease {
        *self.leases.entry(key.to_string()).or_insert(0) += 1;
        Lease {
            key: key.to_string(),
            leases: self.leases.clone(),
        }
    }

    /// Takes the only lease on `key`, or returns `None` if it is already
    /// leased. The check and the insert happen under the same shard lock.
    pub fn try_acquire(&self, key: &str) -> Option<Lease> {
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(1);
                Some(Lease {
                    key: key.to_string(),
                    leases: self.leases.clone(),
                })
            }
        }
    }

    pub fn is_leased(&self, key: &str) -> bool {
        self.leases.get(key).is_some_and(|count| *count > 0)
    }
}

/// Keeps a key marked as in use until dropped.
#[derive(Debug)]
pub struct Lease {
    key: String,
    leases: Arc<DashMap<String, usize>>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leases.remove_if_mut(&self.key, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}
