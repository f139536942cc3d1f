use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use shared::{
    domain::{CacheKey, FunctionKey},
    error::EngineError,
};
use tracing::{debug, warn};

/// Byte-oriented storage behind the in-memory tier. Implementations never
/// need to understand the structure of the values they hold.
pub trait PersistentTier: Send + Sync {
    fn get(&self, key: &CacheKey) -> anyhow::Result<Option<Vec<u8>>>;
    fn set(&self, key: &CacheKey, bytes: &[u8]) -> anyhow::Result<()>;
    fn delete(&self, key: &CacheKey) -> anyhow::Result<()>;
    fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ComputeCacheConfig {
    pub max_entries: usize,
    pub ttl: Option<Duration>,
}

impl Default for ComputeCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 128,
            ttl: None,
        }
    }
}

struct MemoryEntry {
    bytes: Vec<u8>,
    stored_at: Instant,
}

#[derive(Default)]
struct RegionEntries {
    map: HashMap<CacheKey, MemoryEntry>,
    order: VecDeque<CacheKey>,
}

/// One function's cache: a bounded in-memory tier consulted first, backed
/// by the optional persistent tier on miss. Redundant computation under
/// race is allowed; result storage is last-write-wins.
pub struct CacheRegion {
    entries: Mutex<RegionEntries>,
    persistent: Option<Arc<dyn PersistentTier>>,
    config: ComputeCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheRegion {
    fn new(config: ComputeCacheConfig, persistent: Option<Arc<dyn PersistentTier>>) -> Self {
        Self {
            entries: Mutex::new(RegionEntries::default()),
            persistent,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get_or_compute(
        &self,
        key: &CacheKey,
        compute: impl FnOnce() -> Result<Vec<u8>, EngineError>,
    ) -> Result<Vec<u8>, EngineError> {
        if let Some(bytes) = self.lookup_memory(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bytes);
        }

        if let Some(tier) = &self.persistent {
            match tier.get(key) {
                Ok(Some(bytes)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.store_memory(key, &bytes);
                    return Ok(bytes);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(%key, %error, "persistent cache read failed; treating as miss");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let bytes = compute()?;
        self.insert(key, &bytes);
        Ok(bytes)
    }

    /// Stores bytes in both tiers. Persistent write failures degrade to an
    /// in-memory-only entry.
    pub fn insert(&self, key: &CacheKey, bytes: &[u8]) {
        self.store_memory(key, bytes);
        if let Some(tier) = &self.persistent {
            if let Err(error) = tier.set(key, bytes) {
                warn!(%key, %error, "persistent cache write failed; entry kept in memory only");
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) {
        let mut entries = self.lock_entries();
        entries.map.remove(key);
        entries.order.retain(|queued| queued != key);
        drop(entries);
        if let Some(tier) = &self.persistent {
            if let Err(error) = tier.delete(key) {
                warn!(%key, %error, "persistent cache delete failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, RegionEntries> {
        // No user code runs under this lock, so a poisoned guard still
        // holds consistent data.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lookup_memory(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let mut entries = self.lock_entries();
        let expired = match entries.map.get(key) {
            Some(entry) => match self.config.ttl {
                Some(ttl) => entry.stored_at.elapsed() > ttl,
                None => false,
            },
            None => return None,
        };
        if expired {
            entries.map.remove(key);
            entries.order.retain(|queued| queued != key);
            return None;
        }
        entries.map.get(key).map(|entry| entry.bytes.clone())
    }

    fn store_memory(&self, key: &CacheKey, bytes: &[u8]) {
        let mut entries = self.lock_entries();
        if !entries.map.contains_key(key) {
            entries.order.push_back(key.clone());
        }
        entries.map.insert(
            key.clone(),
            MemoryEntry {
                bytes: bytes.to_vec(),
                stored_at: Instant::now(),
            },
        );
        while entries.map.len() > self.config.max_entries {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.map.remove(&oldest);
        }
    }
}

/// Process-wide `function_key -> region` table. Regions are created lazily
/// and locked individually so sessions never contend on one global lock.
pub struct ComputeCacheTable {
    regions: DashMap<FunctionKey, Arc<CacheRegion>>,
    persistent: Option<Arc<dyn PersistentTier>>,
    config: ComputeCacheConfig,
}

impl ComputeCacheTable {
    pub fn new(config: ComputeCacheConfig, persistent: Option<Arc<dyn PersistentTier>>) -> Self {
        Self {
            regions: DashMap::new(),
            persistent,
            config,
        }
    }

    pub fn region(&self, function_key: &FunctionKey) -> Arc<CacheRegion> {
        self.regions
            .entry(function_key.clone())
            .or_insert_with(|| {
                Arc::new(CacheRegion::new(
                    self.config.clone(),
                    self.persistent.clone(),
                ))
            })
            .clone()
    }

    /// Memoizes a typed computation. The stored value is a serialized blob;
    /// every read deserializes a fresh copy, so mutating a returned value
    /// cannot corrupt the cache.
    pub fn get_or_compute_json<T, F>(
        &self,
        function_key: &FunctionKey,
        arg_hash: &str,
        compute: F,
    ) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Result<T, EngineError>,
    {
        let region = self.region(function_key);
        let key = CacheKey::derive(function_key, arg_hash);
        let bytes = region.get_or_compute(&key, || {
            let value = compute()?;
            serde_json::to_vec(&value)
                .map_err(|error| EngineError::CacheStorage(error.to_string()))
        })?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(error) => {
                // A corrupt stored blob is treated as a miss, never a failure.
                warn!(function_key = %function_key, %error, "discarding undecodable cache entry");
                region.remove(&key);
                let value = compute()?;
                let bytes = serde_json::to_vec(&value)
                    .map_err(|error| EngineError::CacheStorage(error.to_string()))?;
                region.insert(&key, &bytes);
                Ok(value)
            }
        }
    }

    pub fn clear(&self, function_key: Option<&FunctionKey>) -> Result<(), EngineError> {
        match function_key {
            Some(function_key) => {
                if let Some((_, region)) = self.regions.remove(function_key) {
                    let (hits, misses) = region.stats();
                    debug!(%function_key, hits, misses, "cleared compute cache region");
                }
                Ok(())
            }
            None => {
                self.regions.clear();
                if let Some(tier) = &self.persistent {
                    tier.clear()
                        .map_err(|error| EngineError::CacheStorage(error.to_string()))?;
                }
                Ok(())
            }
        }
    }
}

/// Builds the argument digest for a cached call. Individual arguments can
/// override hashing with a caller-provided digest, e.g. for live handles
/// that are not serializable.
pub struct ArgHasher {
    function: String,
    hasher: Sha256,
}

impl ArgHasher {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            hasher: Sha256::new(),
        }
    }

    pub fn arg<T: Serialize>(mut self, name: &str, value: &T) -> Result<Self, EngineError> {
        let serialized =
            serde_json::to_vec(value).map_err(|error| EngineError::UnhashableArgument {
                function: self.function.clone(),
                argument: name.to_string(),
                reason: error.to_string(),
            })?;
        self.hasher.update(name.as_bytes());
        self.hasher.update(b"\x1f");
        self.hasher.update(&serialized);
        self.hasher.update(b"\x1e");
        Ok(self)
    }

    pub fn raw(mut self, name: &str, digest: &str) -> Self {
        self.hasher.update(name.as_bytes());
        self.hasher.update(b"\x1f");
        self.hasher.update(digest.as_bytes());
        self.hasher.update(b"\x1e");
        self
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

pub fn hash_args(
    function: &str,
    args: &[(&str, &serde_json::Value)],
) -> Result<String, EngineError> {
    let mut hasher = ArgHasher::new(function);
    for (name, value) in args {
        hasher = hasher.arg(name, value)?;
    }
    Ok(hasher.finish())
}
