use std::time::Duration;

/// One manifest row: a cached entry as the disk tier sees it.
///
/// `value` is `None` when the row was fetched info-only, or when the payload
/// lives in a spill file that has not been read back yet.
#[derive(Debug, Clone)]
pub struct StorageItem {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub extended: Option<Vec<u8>>,
    pub filename: Option<String>,
    pub size: u64,
    pub last_modified: i64,
    pub last_access: i64,
}

impl StorageItem {
    /// Whether the payload was spilled to a file instead of stored inline.
    #[must_use]
    pub fn is_spilled(&self) -> bool {
        self.filename.is_some()
    }
}

/// Eviction limits shared by the memory and disk tiers.
///
/// `None` means unlimited for that dimension.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheLimits {
    /// Total cost (bytes for the disk tier, caller-defined for memory).
    pub cost: Option<u64>,
    /// Total entry count.
    pub count: Option<u64>,
    /// Maximum entry age since last write.
    pub age: Option<Duration>,
}

impl CacheLimits {
    #[must_use]
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    #[must_use]
    pub fn with_age(mut self, age: Duration) -> Self {
        self.age = Some(age);
        self
    }

    /// True when no dimension is limited, in which case trims are skipped.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.cost.is_none() && self.count.is_none() && self.age.is_none()
    }
}
