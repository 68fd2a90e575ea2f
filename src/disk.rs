//! Typed disk cache: serde values over the storage facade, plus eviction
//! policy (cost, count, age) enforced by an owned background trim task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;
use crate::model::CacheLimits;
use crate::storage::{KvStorage, StorageHandle, now_ms};

/// Payloads at or below this many bytes stay inline in the manifest.
pub const DEFAULT_INLINE_THRESHOLD: usize = 20 * 1024;

/// How often the background task re-applies the eviction limits.
pub const DEFAULT_AUTO_TRIM_INTERVAL: Duration = Duration::from_secs(60);

/// Builder for [`DiskCache`].
#[derive(Debug, Clone)]
pub struct DiskCacheBuilder {
    root: PathBuf,
    inline_threshold: usize,
    limits: CacheLimits,
    auto_trim_interval: Option<Duration>,
    legacy_double_quotes: bool,
}

impl DiskCacheBuilder {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            limits: CacheLimits::default(),
            auto_trim_interval: Some(DEFAULT_AUTO_TRIM_INTERVAL),
            legacy_double_quotes: false,
        }
    }

    /// Spill payloads larger than `bytes` to files instead of inlining them.
    #[must_use]
    pub fn inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold = bytes;
        self
    }

    /// Cap the total payload bytes kept on disk.
    #[must_use]
    pub fn cost_limit(mut self, bytes: u64) -> Self {
        self.limits.cost = Some(bytes);
        self
    }

    /// Cap the number of entries kept on disk.
    #[must_use]
    pub fn count_limit(mut self, count: u64) -> Self {
        self.limits.count = Some(count);
        self
    }

    /// Evict entries not accessed within `age`.
    #[must_use]
    pub fn age_limit(mut self, age: Duration) -> Self {
        self.limits.age = Some(age);
        self
    }

    /// Re-apply the limits every `interval` on a background task.
    #[must_use]
    pub fn auto_trim_every(mut self, interval: Duration) -> Self {
        self.auto_trim_interval = Some(interval);
        self
    }

    /// Disable the background trim task; limits then only apply on
    /// [`DiskCache::trim`].
    #[must_use]
    pub fn no_auto_trim(mut self) -> Self {
        self.auto_trim_interval = None;
        self
    }

    /// Keep the engine's legacy acceptance of double-quoted string literals
    /// on the cache's connection. Off by default; see [`crate::engine`].
    #[must_use]
    pub fn legacy_double_quotes(mut self, enabled: bool) -> Self {
        self.legacy_double_quotes = enabled;
        self
    }

    /// Open the store, apply connection configuration, and start the trim
    /// task.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the store cannot be opened or configured.
    pub async fn build(self) -> Result<DiskCache, CacheError> {
        let root = self.root.clone();
        let legacy = self.legacy_double_quotes;
        let storage = tokio::task::spawn_blocking(move || KvStorage::open_with(root, legacy))
            .await
            .map_err(|err| {
                CacheError::ConnectionError(format!("storage open task failed: {err}"))
            })??;
        let handle = StorageHandle::spawn(storage)?;

        let name = self
            .root
            .file_name()
            .map_or_else(|| "cache".to_owned(), |n| n.to_string_lossy().into_owned());
        let shutdown = CancellationToken::new();
        if let Some(interval) = self.auto_trim_interval {
            if !self.limits.is_unlimited() {
                spawn_auto_trim(handle.clone(), self.limits, interval, shutdown.clone());
            }
        }
        Ok(DiskCache {
            name,
            handle,
            inline_threshold: self.inline_threshold,
            limits: self.limits,
            shutdown,
        })
    }
}

/// Disk tier of the cache. Values are serialized with serde and persisted
/// through the storage worker; eviction follows the configured
/// [`CacheLimits`].
pub struct DiskCache {
    name: String,
    handle: StorageHandle,
    inline_threshold: usize,
    limits: CacheLimits,
    shutdown: CancellationToken,
}

impl DiskCache {
    #[must_use]
    pub fn builder(root: impl AsRef<Path>) -> DiskCacheBuilder {
        DiskCacheBuilder::new(root)
    }

    /// Open a cache at `root` with default settings.
    ///
    /// # Errors
    ///
    /// See [`DiskCacheBuilder::build`].
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        Self::builder(root).build().await
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw storage facade, for callers that need byte-level or batched
    /// access.
    #[must_use]
    pub fn handle(&self) -> &StorageHandle {
        &self.handle
    }

    /// # Errors
    ///
    /// Returns `CacheError::Codec` if serialization fails, or any storage
    /// error.
    pub async fn set<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = serde_json::to_vec(value)?;
        self.handle
            .save(key.to_owned(), bytes, None, self.inline_threshold)
            .await
    }

    /// # Errors
    ///
    /// Returns `CacheError::Codec` if deserialization fails, or any storage
    /// error.
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        match self.handle.get_value(key.to_owned()).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Propagates any storage error.
    pub async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        self.handle.contains(key.to_owned()).await
    }

    /// # Errors
    ///
    /// Propagates any storage error.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.handle.remove(key.to_owned()).await
    }

    /// # Errors
    ///
    /// Propagates any storage error.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.handle.clear().await
    }

    /// Total payload bytes on disk.
    ///
    /// # Errors
    ///
    /// Propagates any storage error.
    pub async fn total_cost(&self) -> Result<u64, CacheError> {
        self.handle.total_size().await
    }

    /// Number of entries on disk.
    ///
    /// # Errors
    ///
    /// Propagates any storage error.
    pub async fn total_count(&self) -> Result<u64, CacheError> {
        self.handle.item_count().await
    }

    /// Apply the configured limits now: age first, then cost, then count.
    ///
    /// # Errors
    ///
    /// Propagates any storage error.
    pub async fn trim(&self) -> Result<(), CacheError> {
        apply_limits(&self.handle, &self.limits).await
    }

    /// # Errors
    ///
    /// Propagates any storage error.
    pub async fn trim_to_cost(&self, max: u64) -> Result<(), CacheError> {
        self.handle.trim_to_size(max).await
    }

    /// # Errors
    ///
    /// Propagates any storage error.
    pub async fn trim_to_count(&self, max: u64) -> Result<(), CacheError> {
        self.handle.trim_to_count(max).await
    }

    /// # Errors
    ///
    /// Propagates any storage error.
    pub async fn trim_to_age(&self, age: Duration) -> Result<(), CacheError> {
        self.handle.remove_earlier_than(age_cutoff_ms(age)).await
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn age_cutoff_ms(age: Duration) -> i64 {
    let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
    now_ms().saturating_sub(age_ms)
}

async fn apply_limits(handle: &StorageHandle, limits: &CacheLimits) -> Result<(), CacheError> {
    if let Some(age) = limits.age {
        handle.remove_earlier_than(age_cutoff_ms(age)).await?;
    }
    if let Some(cost) = limits.cost {
        handle.trim_to_size(cost).await?;
    }
    if let Some(count) = limits.count {
        handle.trim_to_count(count).await?;
    }
    Ok(())
}

fn spawn_auto_trim(
    handle: StorageHandle,
    limits: CacheLimits,
    every: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly opened cache
        // is not trimmed before it has been used.
        tick.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) = apply_limits(&handle, &limits).await {
                        tracing::warn!(error = %err, "background trim failed");
                    }
                }
            }
        }
    });
}
