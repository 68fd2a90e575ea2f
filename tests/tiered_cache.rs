use serde::{Deserialize, Serialize};
use tempfile::tempdir;
use tiered_kv::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    user: String,
    visits: u32,
}

fn profile(user: &str, visits: u32) -> Profile {
    Profile {
        user: user.to_owned(),
        visits,
    }
}

#[tokio::test]
async fn set_populates_both_tiers() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let cache: Cache<Profile> = Cache::open(dir.path().join("profiles")).await?;

    cache.set("ada", profile("ada", 3)).await?;
    assert!(cache.memory().contains("ada"));
    assert!(cache.disk().contains("ada").await?);
    assert_eq!(cache.get("ada").await?, Some(profile("ada", 3)));
    assert_eq!(cache.name(), "profiles");
    Ok(())
}

#[tokio::test]
async fn disk_hit_backfills_the_memory_tier() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let root = dir.path().join("backfill");

    {
        let cache: Cache<Profile> = Cache::open(&root).await?;
        cache.set("grace", profile("grace", 8)).await?;
    }

    // Fresh instance: memory is cold, the value comes off disk once and is
    // cached in memory afterwards.
    let cache: Cache<Profile> = Cache::open(&root).await?;
    assert!(!cache.memory().contains("grace"));
    assert_eq!(cache.get("grace").await?, Some(profile("grace", 8)));
    assert!(cache.memory().contains("grace"));
    Ok(())
}

#[tokio::test]
async fn remove_and_clear_hit_both_tiers() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let cache: Cache<Profile> = Cache::open(dir.path().join("rm")).await?;

    cache.set("a", profile("a", 1)).await?;
    cache.set("b", profile("b", 2)).await?;

    cache.remove("a").await?;
    assert!(!cache.memory().contains("a"));
    assert!(!cache.contains("a").await?);
    assert!(cache.contains("b").await?);

    cache.clear().await?;
    assert!(!cache.contains("b").await?);
    assert_eq!(cache.memory().total_count(), 0);
    assert_eq!(cache.disk().total_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn tier_limits_can_differ() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let cache: Cache<Profile> = Cache::with_tiers(
        DiskCacheBuilder::new(dir.path().join("limits")).count_limit(100),
        CacheLimits::default().with_count(1),
    )
    .await?;

    cache.set("first", profile("first", 1)).await?;
    cache.set("second", profile("second", 2)).await?;

    // Memory holds only the newest entry; disk still has both.
    assert!(!cache.memory().contains("first"));
    assert!(cache.memory().contains("second"));
    assert_eq!(cache.disk().total_count().await?, 2);

    // A get for the evicted key falls through to disk and back-fills.
    assert_eq!(cache.get("first").await?, Some(profile("first", 1)));
    assert!(cache.memory().contains("first"));
    Ok(())
}
