//! Spill-file handling for the disk tier: `data/` holds payloads too large to
//! inline in the manifest, `trash/` holds directories awaiting background
//! deletion.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

const DATA_DIR: &str = "data";
const TRASH_DIR: &str = "trash";

static TRASH_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) struct FileStore {
    data_dir: PathBuf,
    trash_dir: PathBuf,
}

impl FileStore {
    pub(crate) fn new(root: &Path) -> io::Result<Self> {
        let data_dir = root.join(DATA_DIR);
        let trash_dir = root.join(TRASH_DIR);
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&trash_dir)?;
        Ok(Self {
            data_dir,
            trash_dir,
        })
    }

    pub(crate) fn write(&self, name: &str, data: &[u8]) -> io::Result<()> {
        fs::write(self.data_dir.join(name), data)
    }

    pub(crate) fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.data_dir.join(name))
    }

    pub(crate) fn delete(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.data_dir.join(name))
    }

    /// Move the whole data directory into the trash and re-create it empty.
    /// Actual deletion happens later in [`FileStore::empty_trash_in_background`].
    pub(crate) fn move_all_to_trash(&self) -> io::Result<()> {
        let seq = TRASH_SEQ.fetch_add(1, Ordering::Relaxed);
        let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let target = self.trash_dir.join(format!("{stamp}-{seq}"));
        fs::rename(&self.data_dir, &target)?;
        fs::create_dir_all(&self.data_dir)
    }

    /// Delete everything under `trash/` on a background thread. Failures are
    /// logged and retried implicitly the next time the trash is emptied.
    pub(crate) fn empty_trash_in_background(&self) {
        let trash_dir = self.trash_dir.clone();
        let spawned = thread::Builder::new()
            .name("tiered-kv-trash".into())
            .spawn(move || {
                let entries = match fs::read_dir(&trash_dir) {
                    Ok(entries) => entries,
                    Err(err) => {
                        tracing::debug!(error = %err, "trash directory unreadable");
                        return;
                    }
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    let removed = if path.is_dir() {
                        fs::remove_dir_all(&path)
                    } else {
                        fs::remove_file(&path)
                    };
                    if let Err(err) = removed {
                        tracing::debug!(path = %path.display(), error = %err, "trash cleanup failed");
                    }
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to spawn trash cleanup thread");
        }
    }
}

/// Filename for a spilled payload. Must be stable across processes, so this
/// hashes with fixed-key FNV-1a rather than the randomly seeded std hasher.
pub(crate) fn spill_filename(key: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::spill_filename;

    #[test]
    fn spill_filenames_are_stable_and_distinct() {
        assert_eq!(spill_filename("alpha"), spill_filename("alpha"));
        assert_ne!(spill_filename("alpha"), spill_filename("beta"));
        assert_eq!(spill_filename("alpha").len(), 16);
    }
}
