//! Tiered key-value cache: an in-memory LRU tier over a SQLite-backed disk
//! tier with file spillover for large payloads.

pub mod cache;
pub mod disk;
pub mod engine;
pub mod error;
pub mod memory;
pub mod model;
pub mod storage;

pub mod prelude;

pub use cache::Cache;
pub use disk::{DEFAULT_INLINE_THRESHOLD, DiskCache, DiskCacheBuilder};
pub use engine::{
    LogCallback, clear_log_callback, disable_double_quoted_strings, dqs_toggle_supported,
    enable_double_quoted_strings, register_log_callback,
};
pub use error::CacheError;
pub use memory::MemoryCache;
pub use model::{CacheLimits, StorageItem};
pub use storage::{KvStorage, StorageHandle};
