//! Disk tier storage: a SQLite manifest describing every cached entry, with
//! payloads either inlined as blobs or spilled to files under `data/`.
//!
//! Everything here is synchronous and single-owner; the async facade in
//! [`worker`] runs one `KvStorage` on a dedicated thread.

mod files;
pub mod worker;

pub use worker::StorageHandle;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::engine;
use crate::error::CacheError;
use crate::model::StorageItem;

use files::{FileStore, spill_filename};

const DB_FILENAME: &str = "manifest.sqlite";
const OPEN_RETRY_MAX: u32 = 8;
const OPEN_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const TRIM_BATCH: usize = 16;

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS manifest (
    key TEXT PRIMARY KEY,
    inline_data BLOB,
    extended_data BLOB,
    filename TEXT,
    size INTEGER NOT NULL DEFAULT 0,
    last_modified INTEGER NOT NULL DEFAULT 0,
    last_access INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS manifest_last_access_idx ON manifest (last_access);
";

const SELECT_FULL: &str = "SELECT key, inline_data, extended_data, filename, size, \
     last_modified, last_access FROM manifest WHERE key = ?1";
// Info lookups skip the payload blob; NULL keeps the column layout uniform.
const SELECT_INFO: &str = "SELECT key, NULL, extended_data, filename, size, \
     last_modified, last_access FROM manifest WHERE key = ?1";

/// SQLite-backed key-value store with file spillover.
pub struct KvStorage {
    root: PathBuf,
    db_path: PathBuf,
    files: FileStore,
    conn: Option<Connection>,
    legacy_double_quotes: bool,
    open_fail_count: u32,
    open_fail_last: Option<Instant>,
}

impl KvStorage {
    /// Open (or create) a store rooted at `root`, with the engine's legacy
    /// double-quoted string literals disabled.
    ///
    /// If the manifest cannot be opened or initialized the store is assumed
    /// corrupt: the database files are deleted, existing payload files are
    /// trashed, and one more open is attempted before giving up.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the directories cannot be created or the
    /// database still fails to open after the reset.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        Self::open_with(root, false)
    }

    /// Like [`KvStorage::open`], choosing the double-quoted string literal
    /// mode for the connection. The mode is re-applied on every reopen, so it
    /// survives [`KvStorage::clear`] and failure recovery.
    ///
    /// # Errors
    ///
    /// See [`KvStorage::open`].
    pub fn open_with(root: impl AsRef<Path>, legacy_double_quotes: bool) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        let files = FileStore::new(&root)?;
        let db_path = root.join(DB_FILENAME);
        let mut storage = Self {
            root,
            db_path,
            files,
            conn: None,
            legacy_double_quotes,
            open_fail_count: 0,
            open_fail_last: None,
        };
        if let Err(err) = storage.try_open() {
            tracing::warn!(error = %err, path = %storage.root.display(), "sqlite open failed; resetting store");
            storage.reset();
            storage.open_fail_count = 0;
            storage.open_fail_last = None;
            storage.try_open()?;
        }
        // Finish any trash cleanup a previous process left behind.
        storage.files.empty_trash_in_background();
        Ok(storage)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Insert or replace an entry. Payloads larger than `inline_threshold`
    /// bytes are written to a spill file and only referenced from the
    /// manifest. Both timestamps are set to now.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::StorageError` for an empty key, or the underlying
    /// io/sqlite error. A failed spill write aborts the save.
    pub fn save(
        &mut self,
        key: &str,
        value: &[u8],
        extended: Option<&[u8]>,
        inline_threshold: usize,
    ) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::StorageError("cannot save an empty key".into()));
        }
        let previous = self.spill_name(key)?;
        let spilled = value.len() > inline_threshold;
        let filename = if spilled {
            Some(spill_filename(key))
        } else {
            None
        };
        if let Some(name) = &filename {
            self.files.write(name, value)?;
        }
        let now = now_ms();
        let size = i64::try_from(value.len()).unwrap_or(i64::MAX);
        {
            let inline: Option<&[u8]> = if spilled { None } else { Some(value) };
            let conn = self.connection()?;
            let mut stmt = conn.prepare_cached(
                "INSERT OR REPLACE INTO manifest \
                 (key, inline_data, extended_data, filename, size, last_modified, last_access) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            stmt.execute(params![key, inline, extended, filename, size, now, now])?;
        }
        // A value that moved from spilled to inline leaves its old file behind.
        if let Some(old) = previous {
            if filename.as_deref() != Some(old.as_str()) {
                let _ = self.files.delete(&old);
            }
        }
        Ok(())
    }

    /// Fetch a full entry, reading back any spilled payload and bumping its
    /// access time. A row whose spill file has gone missing is deleted and
    /// reported as a miss.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite/io error.
    pub fn get(&mut self, key: &str) -> Result<Option<StorageItem>, CacheError> {
        let Some(mut item) = self.row(key, false)? else {
            return Ok(None);
        };
        if let Some(name) = item.filename.clone() {
            match self.files.read(&name) {
                Ok(bytes) => item.value = Some(bytes),
                Err(err) => {
                    tracing::warn!(key, error = %err, "spill file missing; dropping orphaned row");
                    self.remove(key)?;
                    return Ok(None);
                }
            }
        }
        self.touch(key)?;
        Ok(Some(item))
    }

    /// Fetch entry metadata without the payload and without touching the
    /// access time.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn get_info(&mut self, key: &str) -> Result<Option<StorageItem>, CacheError> {
        self.row(key, true)
    }

    /// Fetch just the payload bytes for `key`.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite/io error.
    pub fn get_value(&mut self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.get(key)?.and_then(|item| item.value))
    }

    /// Batched fetch. Rows with missing spill files are repaired (deleted) and
    /// skipped; the access time of every returned entry is bumped once.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite/io error.
    pub fn get_many(
        &mut self,
        keys: &[String],
        exclude_inline: bool,
    ) -> Result<Vec<StorageItem>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let columns = if exclude_inline {
            "key, NULL, extended_data, filename, size, last_modified, last_access"
        } else {
            "key, inline_data, extended_data, filename, size, last_modified, last_access"
        };
        let sql = format!(
            "SELECT {columns} FROM manifest WHERE key IN ({})",
            placeholders(keys.len())
        );
        let rows: Vec<StorageItem> = {
            let conn = self.connection()?;
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params_from_iter(keys.iter()), item_from_row)?
                .collect::<rusqlite::Result<_>>()?
        };
        let mut items = Vec::with_capacity(rows.len());
        let mut touched: Vec<String> = Vec::with_capacity(rows.len());
        for mut item in rows {
            if !exclude_inline {
                if let Some(name) = item.filename.clone() {
                    match self.files.read(&name) {
                        Ok(bytes) => item.value = Some(bytes),
                        Err(err) => {
                            tracing::warn!(key = %item.key, error = %err, "spill file missing; dropping orphaned row");
                            self.remove(&item.key)?;
                            continue;
                        }
                    }
                }
                touched.push(item.key.clone());
            }
            items.push(item);
        }
        if !touched.is_empty() {
            self.touch_many(&touched)?;
        }
        Ok(items)
    }

    /// Whether an entry exists for `key`. Does not verify the spill file.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn contains(&mut self, key: &str) -> Result<bool, CacheError> {
        if key.is_empty() {
            return Ok(false);
        }
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM manifest WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete one entry and its spill file, if any.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn remove(&mut self, key: &str) -> Result<(), CacheError> {
        if key.is_empty() {
            return Ok(());
        }
        if let Some(name) = self.spill_name(key)? {
            let _ = self.files.delete(&name);
        }
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached("DELETE FROM manifest WHERE key = ?1")?;
        stmt.execute(params![key])?;
        Ok(())
    }

    /// Delete a batch of entries, spill files first.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn remove_many(&mut self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = {
            let sql = format!(
                "SELECT filename FROM manifest WHERE filename IS NOT NULL AND key IN ({})",
                placeholders(keys.len())
            );
            let conn = self.connection()?;
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params_from_iter(keys.iter()), |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        for name in &names {
            let _ = self.files.delete(name);
        }
        let sql = format!(
            "DELETE FROM manifest WHERE key IN ({})",
            placeholders(keys.len())
        );
        let conn = self.connection()?;
        conn.execute(&sql, params_from_iter(keys.iter()))?;
        Ok(())
    }

    /// Delete every entry whose payload exceeds `size` bytes. `0` clears the
    /// whole store.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn remove_larger_than(&mut self, size: u64) -> Result<(), CacheError> {
        if size == 0 {
            return self.clear();
        }
        if size == u64::MAX {
            return Ok(());
        }
        let limit = i64::try_from(size).unwrap_or(i64::MAX);
        let names: Vec<String> = {
            let conn = self.connection()?;
            let mut stmt = conn.prepare_cached(
                "SELECT filename FROM manifest WHERE size > ?1 AND filename IS NOT NULL",
            )?;
            stmt.query_map(params![limit], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        for name in &names {
            let _ = self.files.delete(name);
        }
        let deleted = {
            let conn = self.connection()?;
            conn.execute("DELETE FROM manifest WHERE size > ?1", params![limit])?
        };
        if deleted > 0 {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Delete every entry last accessed before `cutoff_ms` (unix millis).
    /// Non-positive cutoffs are no-ops; `i64::MAX` clears the whole store.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn remove_earlier_than(&mut self, cutoff_ms: i64) -> Result<(), CacheError> {
        if cutoff_ms <= 0 {
            return Ok(());
        }
        if cutoff_ms == i64::MAX {
            return self.clear();
        }
        let names: Vec<String> = {
            let conn = self.connection()?;
            let mut stmt = conn.prepare_cached(
                "SELECT filename FROM manifest WHERE last_access < ?1 AND filename IS NOT NULL",
            )?;
            stmt.query_map(params![cutoff_ms], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        for name in &names {
            let _ = self.files.delete(name);
        }
        let deleted = {
            let conn = self.connection()?;
            conn.execute(
                "DELETE FROM manifest WHERE last_access < ?1",
                params![cutoff_ms],
            )?
        };
        if deleted > 0 {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Evict least-recently-accessed entries until the total payload size is
    /// at most `max` bytes. `0` clears the whole store.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn trim_to_size(&mut self, max: u64) -> Result<(), CacheError> {
        if max == 0 {
            return self.clear();
        }
        if max == u64::MAX {
            return Ok(());
        }
        let mut total = self.total_size()?;
        if total <= max {
            return Ok(());
        }
        let mut changed = false;
        while total > max {
            let victims = self.eviction_batch(TRIM_BATCH)?;
            if victims.is_empty() {
                break;
            }
            for victim in victims {
                if total <= max {
                    break;
                }
                self.delete_row_and_file(&victim.key, victim.filename.as_deref())?;
                total = total.saturating_sub(victim.size);
                changed = true;
            }
        }
        if changed {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Evict least-recently-accessed entries until at most `max` remain.
    /// `0` clears the whole store.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn trim_to_count(&mut self, max: u64) -> Result<(), CacheError> {
        if max == 0 {
            return self.clear();
        }
        if max == u64::MAX {
            return Ok(());
        }
        let mut total = self.item_count()?;
        if total <= max {
            return Ok(());
        }
        let mut changed = false;
        while total > max {
            let victims = self.eviction_batch(TRIM_BATCH)?;
            if victims.is_empty() {
                break;
            }
            for victim in victims {
                if total <= max {
                    break;
                }
                self.delete_row_and_file(&victim.key, victim.filename.as_deref())?;
                total -= 1;
                changed = true;
            }
        }
        if changed {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Drop everything: close the database, delete its files, trash the data
    /// directory, and reopen empty. Trash deletion happens in the background.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the store cannot be reopened afterwards.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.close();
        self.delete_db_files();
        if let Err(err) = self.files.move_all_to_trash() {
            tracing::warn!(error = %err, "failed to trash data directory");
        }
        self.files.empty_trash_in_background();
        self.open_fail_count = 0;
        self.open_fail_last = None;
        self.try_open()
    }

    /// Number of entries in the manifest.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn item_count(&mut self) -> Result<u64, CacheError> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM manifest", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Total payload bytes across all entries, inline and spilled.
    ///
    /// # Errors
    ///
    /// Returns the underlying sqlite error.
    pub fn total_size(&mut self) -> Result<u64, CacheError> {
        let conn = self.connection()?;
        let size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM manifest",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(size).unwrap_or_default())
    }

    /// The live connection, reopening it if a previous failure closed it.
    /// Reopen attempts are rate-limited so a persistently broken database
    /// does not get hammered.
    pub(crate) fn connection(&mut self) -> Result<&Connection, CacheError> {
        if self.conn.is_none() {
            self.reopen()?;
        }
        self.conn
            .as_ref()
            .ok_or_else(|| CacheError::ConnectionError("sqlite connection unavailable".into()))
    }

    fn reopen(&mut self) -> Result<(), CacheError> {
        if self.open_fail_count >= OPEN_RETRY_MAX {
            return Err(CacheError::ConnectionError(
                "sqlite reopen attempts exhausted".into(),
            ));
        }
        if let Some(last) = self.open_fail_last {
            if last.elapsed() < OPEN_RETRY_INTERVAL {
                return Err(CacheError::ConnectionError(
                    "sqlite reopen suppressed; last attempt failed recently".into(),
                ));
            }
        }
        self.try_open()
    }

    fn try_open(&mut self) -> Result<(), CacheError> {
        if self.conn.is_some() {
            return Ok(());
        }
        match self.open_connection() {
            Ok(conn) => {
                self.conn = Some(conn);
                self.open_fail_count = 0;
                self.open_fail_last = None;
                Ok(())
            }
            Err(err) => {
                self.open_fail_count += 1;
                self.open_fail_last = Some(Instant::now());
                Err(err)
            }
        }
    }

    fn open_connection(&self) -> Result<Connection, CacheError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        if self.legacy_double_quotes {
            engine::enable_double_quoted_strings(&conn)?;
        } else {
            engine::disable_double_quoted_strings(&conn)?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            // close() finalizes cached statements; a busy handle gets one more
            // attempt before we give up and let it leak until process exit.
            if let Err((conn, err)) = conn.close() {
                tracing::warn!(error = %err, "sqlite close failed; retrying");
                if let Err((_conn, err)) = conn.close() {
                    tracing::warn!(error = %err, "sqlite close failed again");
                }
            }
        }
    }

    fn reset(&mut self) {
        self.close();
        self.delete_db_files();
        if let Err(err) = self.files.move_all_to_trash() {
            tracing::debug!(error = %err, "failed to trash data directory during reset");
        }
        self.files.empty_trash_in_background();
    }

    fn delete_db_files(&self) {
        for path in [
            self.db_path.clone(),
            sibling(&self.db_path, "-wal"),
            sibling(&self.db_path, "-shm"),
        ] {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), error = %err, "failed to delete database file");
                }
            }
        }
    }

    fn row(&mut self, key: &str, exclude_inline: bool) -> Result<Option<StorageItem>, CacheError> {
        if key.is_empty() {
            return Ok(None);
        }
        let sql = if exclude_inline { SELECT_INFO } else { SELECT_FULL };
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let item = stmt.query_row(params![key], item_from_row).optional()?;
        Ok(item)
    }

    fn spill_name(&mut self, key: &str) -> Result<Option<String>, CacheError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached("SELECT filename FROM manifest WHERE key = ?1")?;
        let name: Option<Option<String>> = stmt
            .query_row(params![key], |row| row.get(0))
            .optional()?;
        Ok(name.flatten())
    }

    fn touch(&mut self, key: &str) -> Result<(), CacheError> {
        let now = now_ms();
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare_cached("UPDATE manifest SET last_access = ?1 WHERE key = ?2")?;
        stmt.execute(params![now, key])?;
        Ok(())
    }

    fn touch_many(&mut self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE manifest SET last_access = ?1 WHERE key IN ({})",
            placeholders(keys.len())
        );
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(keys.len() + 1);
        values.push(rusqlite::types::Value::from(now_ms()));
        values.extend(keys.iter().map(|key| rusqlite::types::Value::from(key.clone())));
        let conn = self.connection()?;
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn eviction_batch(&mut self, limit: usize) -> Result<Vec<Victim>, CacheError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(
            "SELECT key, filename, size FROM manifest ORDER BY last_access ASC LIMIT ?1",
        )?;
        let victims = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                let size: i64 = row.get(2)?;
                Ok(Victim {
                    key: row.get(0)?,
                    filename: row.get(1)?,
                    size: u64::try_from(size).unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(victims)
    }

    fn delete_row_and_file(&mut self, key: &str, filename: Option<&str>) -> Result<(), CacheError> {
        if let Some(name) = filename {
            let _ = self.files.delete(name);
        }
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached("DELETE FROM manifest WHERE key = ?1")?;
        stmt.execute(params![key])?;
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), CacheError> {
        let conn = self.connection()?;
        // Merge the WAL back into the main database after bulk deletes.
        conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_row| Ok(()))?;
        Ok(())
    }
}

impl Drop for KvStorage {
    fn drop(&mut self) {
        self.close();
    }
}

struct Victim {
    key: String,
    filename: Option<String>,
    size: u64,
}

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StorageItem> {
    let size: i64 = row.get(4)?;
    Ok(StorageItem {
        key: row.get(0)?,
        value: row.get(1)?,
        extended: row.get(2)?,
        filename: row.get(3)?,
        size: u64::try_from(size).unwrap_or_default(),
        last_modified: row.get(5)?,
        last_access: row.get(6)?,
    })
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
