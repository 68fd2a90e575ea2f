//! Convenient imports for common functionality.

pub use crate::cache::Cache;
pub use crate::disk::{DiskCache, DiskCacheBuilder};
pub use crate::engine::{
    LogCallback, disable_double_quoted_strings, enable_double_quoted_strings,
    register_log_callback,
};
pub use crate::error::CacheError;
pub use crate::memory::MemoryCache;
pub use crate::model::{CacheLimits, StorageItem};
pub use crate::storage::StorageHandle;
