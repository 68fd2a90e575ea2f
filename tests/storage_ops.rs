use std::fs;
use std::time::Duration;

use tempfile::tempdir;
use tiered_kv::{CacheError, StorageHandle};
use tokio::time::sleep;

const INLINE: usize = 1024;

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_owned()).collect()
}

#[tokio::test]
async fn extended_data_rides_along_with_the_payload() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let handle = StorageHandle::open(dir.path())?;

    handle
        .save(
            "entry".to_owned(),
            b"payload".to_vec(),
            Some(b"etag:77".to_vec()),
            INLINE,
        )
        .await?;

    let info = handle.get_info("entry".to_owned()).await?.expect("entry");
    assert_eq!(info.extended.as_deref(), Some(b"etag:77".as_slice()));
    assert_eq!(info.value, None, "info lookups skip the payload");
    assert_eq!(info.size, 7);

    let item = handle.get("entry".to_owned()).await?.expect("entry");
    assert_eq!(item.value.as_deref(), Some(b"payload".as_slice()));
    Ok(())
}

#[tokio::test]
async fn batched_fetch_skips_missing_keys() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let handle = StorageHandle::open(dir.path())?;

    for name in ["a", "b", "c"] {
        handle
            .save(name.to_owned(), name.as_bytes().to_vec(), None, INLINE)
            .await?;
    }

    let items = handle.get_many(keys(&["a", "missing", "c"]), false).await?;
    let mut found: Vec<&str> = items.iter().map(|item| item.key.as_str()).collect();
    found.sort_unstable();
    assert_eq!(found, vec!["a", "c"]);

    handle.remove_many(keys(&["a", "b"])).await?;
    assert_eq!(handle.item_count().await?, 1);
    assert!(handle.contains("c".to_owned()).await?);
    Ok(())
}

#[tokio::test]
async fn remove_by_size_and_age() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let handle = StorageHandle::open(dir.path())?;

    handle
        .save("small".to_owned(), vec![0u8; 8], None, INLINE)
        .await?;
    handle
        .save("large".to_owned(), vec![0u8; 64], None, INLINE)
        .await?;

    handle.remove_larger_than(16).await?;
    assert!(handle.contains("small".to_owned()).await?);
    assert!(!handle.contains("large".to_owned()).await?);

    sleep(Duration::from_millis(40)).await;
    let cutoff = chrono::Utc::now().timestamp_millis() - 10;
    handle.remove_earlier_than(cutoff).await?;
    assert_eq!(handle.item_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn totals_track_saves_and_clear() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let handle = StorageHandle::open(dir.path())?;

    handle
        .save("x".to_owned(), vec![0u8; 10], None, INLINE)
        .await?;
    handle
        .save("y".to_owned(), vec![0u8; 30], None, INLINE)
        .await?;
    assert_eq!(handle.item_count().await?, 2);
    assert_eq!(handle.total_size().await?, 40);

    // Replacing a key replaces its size contribution.
    handle
        .save("y".to_owned(), vec![0u8; 5], None, INLINE)
        .await?;
    assert_eq!(handle.total_size().await?, 15);

    handle.clear().await?;
    assert_eq!(handle.item_count().await?, 0);
    assert_eq!(handle.total_size().await?, 0);
    Ok(())
}

#[tokio::test]
async fn empty_keys_are_rejected_on_save_and_miss_on_read() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let handle = StorageHandle::open(dir.path())?;

    let err = handle
        .save(String::new(), b"value".to_vec(), None, INLINE)
        .await;
    assert!(matches!(err, Err(CacheError::StorageError(_))));

    assert!(handle.get(String::new()).await?.is_none());
    assert!(!handle.contains(String::new()).await?);
    Ok(())
}

#[tokio::test]
async fn raw_connection_access_sees_the_manifest() -> Result<(), CacheError> {
    let dir = tempdir()?;
    let handle = StorageHandle::open(dir.path())?;

    handle
        .save("raw".to_owned(), b"payload".to_vec(), None, INLINE)
        .await?;

    let (mode, rows) = handle
        .with_connection(|conn| {
            let mode: String =
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            let rows: u64 =
                conn.query_row("SELECT count(*) FROM manifest", [], |row| row.get(0))?;
            Ok((mode, rows))
        })
        .await?;
    assert_eq!(mode, "wal");
    assert_eq!(rows, 1);
    Ok(())
}

#[tokio::test]
async fn corrupt_manifest_is_reset_on_open() -> Result<(), CacheError> {
    let dir = tempdir()?;
    fs::write(dir.path().join("manifest.sqlite"), b"definitely not a database")?;

    // Opening over the garbage file deletes it and starts from an empty store.
    let handle = StorageHandle::open(dir.path())?;
    assert_eq!(handle.item_count().await?, 0);

    handle
        .save("fresh".to_owned(), b"value".to_vec(), None, INLINE)
        .await?;
    assert!(handle.contains("fresh".to_owned()).await?);
    assert_eq!(
        handle.get_value("fresh".to_owned()).await?.as_deref(),
        Some(b"value".as_slice())
    );
    Ok(())
}
