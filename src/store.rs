//! The public façade: composes the segment manager and keydir, runs
//! recovery at open, and exposes `put`/`get`/`delete`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs4::fs_std::FileExt;

use crate::config::Config;
use crate::entry::Entry;
use crate::error::{Error, IoContext, Result};
use crate::keydir::Keydir;
use crate::segment_manager::SegmentManager;

fn now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs_f64()
}

/// A durable, log-structured, append-only key-value store.
///
/// Not safe for concurrent mutation from multiple threads or processes:
/// callers must serialize `put`/`get`/`delete` calls on a single `Store`,
/// and only one `Store` may have a given directory open at a time (enforced
/// by an advisory exclusive lock on `.lock`).
pub struct Store {
    segment_manager: SegmentManager,
    keydir: Keydir,
    _lock: File,
}

impl Store {
    /// Opens (or creates) a store at `base_directory` using default
    /// configuration, recovering the keydir from whatever segments exist.
    pub fn open(base_directory: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(base_directory, Config::default())
    }

    /// Opens (or creates) a store at `base_directory` with caller-supplied
    /// configuration.
    pub fn open_with_config(base_directory: impl AsRef<Path>, config: Config) -> Result<Self> {
        let base_directory: PathBuf = base_directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_directory).context("creating store directory")?;

        let lock = acquire_lock(&base_directory)?;

        log::info!("opening store at {}", base_directory.display());
        let segment_manager = SegmentManager::open(&base_directory, config)?;
        let mut keydir = Keydir::new();
        keydir.recover_from(&segment_manager);
        log::info!("recovered {} live keys from {}", keydir.size(), base_directory.display());

        Ok(Self { segment_manager, keydir, _lock: lock })
    }

    /// Stores `value` under `key`, durably appending before the keydir is
    /// updated: a failed append never mutates the keydir.
    pub fn put(&mut self, key: &str, value: &str) -> Result<()> {
        let timestamp = now();
        let entry = Entry::put(key.as_bytes().to_vec(), value.as_bytes().to_vec(), timestamp);
        let result = self.segment_manager.append(&entry)?;
        self.keydir.put(key, result.segment_id, result.offset, entry.value_size(), timestamp);
        Ok(())
    }

    /// Looks up `key`. Returns `Ok(None)` on a miss or a tombstone.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(located) = self.keydir.get(key) else {
            return Ok(None);
        };
        let entry = self.segment_manager.read(located.segment_id, located.value_pos)?;
        // Defensive recheck: a keydir entry recovered via log scan may point
        // at a tombstone (see crate::keydir's scan-recovery note).
        if entry.tombstone {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&entry.value).into_owned()))
    }

    /// Marks `key` as deleted by appending a tombstone entry and removing it
    /// from the keydir.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        let timestamp = now();
        let entry = Entry::tombstone(key.as_bytes().to_vec(), timestamp);
        self.segment_manager.append(&entry)?;
        self.keydir.delete(key);
        Ok(())
    }

    /// Number of live keys currently indexed.
    pub fn len(&self) -> usize {
        self.keydir.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn acquire_lock(base_directory: &Path) -> Result<File> {
    let lock_path = base_directory.join(".lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&lock_path)
        .context(format!("opening lock file {}", lock_path.display()))?;
    file.try_lock_exclusive().map_err(|_| Error::Locked(base_directory.to_path_buf()))?;
    Ok(file)
}
