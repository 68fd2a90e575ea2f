//! Tiered cache: memory first, disk second, with memory back-fill on disk
//! hits. Writes go through to both tiers.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::disk::{DiskCache, DiskCacheBuilder};
use crate::error::CacheError;
use crate::memory::MemoryCache;
use crate::model::CacheLimits;

/// Two-tier cache for one value type.
pub struct Cache<V> {
    name: String,
    memory: MemoryCache<String, V>,
    disk: DiskCache,
}

impl<V> Cache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open a cache rooted at `path` with default settings for both tiers.
    /// The cache is named after the final path component.
    ///
    /// # Errors
    ///
    /// Propagates disk tier open failures.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Self::with_tiers(DiskCacheBuilder::new(path), CacheLimits::default()).await
    }

    /// Open a cache with explicit disk tier configuration and memory limits.
    ///
    /// # Errors
    ///
    /// Propagates disk tier open failures.
    pub async fn with_tiers(
        disk: DiskCacheBuilder,
        memory_limits: CacheLimits,
    ) -> Result<Self, CacheError> {
        let disk = disk.build().await?;
        let name = disk.name().to_owned();
        Ok(Self {
            name,
            memory: MemoryCache::new(memory_limits),
            disk,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryCache<String, V> {
        &self.memory
    }

    #[must_use]
    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    /// # Errors
    ///
    /// Propagates disk tier errors; a memory tier hit never fails.
    pub async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        if self.memory.contains(key) {
            return Ok(true);
        }
        self.disk.contains(key).await
    }

    /// Write through to both tiers.
    ///
    /// # Errors
    ///
    /// Propagates disk tier errors. The memory tier is updated first and is
    /// not rolled back on a disk failure.
    pub async fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        self.memory.set(key.to_owned(), value.clone());
        self.disk.set(key, &value).await
    }

    /// Memory first; on a disk hit the value is cloned back into the memory
    /// tier before being returned.
    ///
    /// # Errors
    ///
    /// Propagates disk tier errors.
    pub async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        if let Some(value) = self.memory.get(key) {
            return Ok(Some(value));
        }
        match self.disk.get::<V>(key).await? {
            Some(value) => {
                self.memory.set(key.to_owned(), value.clone());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Propagates disk tier errors.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.memory.remove(key);
        self.disk.remove(key).await
    }

    /// # Errors
    ///
    /// Propagates disk tier errors.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.memory.clear();
        self.disk.clear().await
    }
}
