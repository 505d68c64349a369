//! A segment is a bounded append-only log file plus two JSON sidecars: a
//! "hint" file mirroring the segment's own metadata, and an index file
//! recording where every appended entry landed, so recovery can rebuild the
//! keydir without re-reading the log.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::entry::{Entry, HEADER_SIZE};
use crate::error::{Error, IoContext, Result};

/// Result of a successful append: where the entry landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub segment_id: u64,
    /// Byte offset, within the segment's log file, where the entry starts.
    pub offset: u64,
    pub entry_size: u64,
}

/// The JSON shape of a segment's "hint" metadata sidecar.
#[derive(Debug, Serialize, Deserialize)]
struct SegmentMeta {
    id: u64,
    filepath: PathBuf,
    metadata_filepath: PathBuf,
    size: u64,
    num_entries: u64,
    active: bool,
    max_size: u64,
    max_entries: u64,
    closed: bool,
    created_at: f64,
    metadata_sync_interval: f64,
    last_sync: f64,
}

/// A single line of a segment's `.log.index` sidecar.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexRecord {
    pub key: String,
    pub offset: u64,
    pub size: u32,
    pub timestamp: f64,
    #[serde(default)]
    pub tombstone: bool,
}

/// An append-only segment log file, plus its metadata and index sidecars.
pub struct Segment {
    pub id: u64,
    pub filepath: PathBuf,
    pub metadata_filepath: PathBuf,
    pub index_filepath: PathBuf,
    pub size: u64,
    pub num_entries: u64,
    pub active: bool,
    pub closed: bool,
    pub max_size: u64,
    pub max_entries: u64,
    pub created_at: f64,
    pub metadata_sync_interval: f64,
    pub last_sync: f64,
    file: File,
}

fn now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs_f64()
}

pub fn log_filename(id: u64) -> String {
    format!("segment_{id}.log")
}

pub fn hint_filename(id: u64) -> String {
    format!("segment_{id}.hint")
}

pub fn index_filename(id: u64) -> String {
    format!("{}.index", log_filename(id))
}

impl Segment {
    /// Creates a brand-new, empty segment: log, hint, and index files, with
    /// `active=true, closed=false`. Persists metadata immediately.
    pub fn new(id: u64, base_path: &Path, max_size: u64, max_entries: u64) -> Result<Self> {
        fs::create_dir_all(base_path).context("creating segment base directory")?;

        let filepath = base_path.join(log_filename(id));
        let metadata_filepath = base_path.join(hint_filename(id));
        let index_filepath = base_path.join(index_filename(id));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&filepath)
            .context(format!("creating segment log {}", filepath.display()))?;
        // Touch the sidecars so they exist even before the first append.
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(&metadata_filepath)
            .context("creating segment hint file")?;
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(&index_filepath)
            .context("creating segment index file")?;

        let created = now();
        let mut segment = Self {
            id,
            filepath,
            metadata_filepath,
            index_filepath,
            size: 0,
            num_entries: 0,
            active: true,
            closed: false,
            max_size,
            max_entries,
            created_at: created,
            metadata_sync_interval: Config::default().metadata_sync_interval,
            last_sync: created,
            file,
        };
        segment.sync_metadata()?;
        Ok(segment)
    }

    /// Opens an existing segment. Loads its hint file if present and
    /// consistent with the on-disk log size; otherwise rebuilds metadata by
    /// scanning the log. Fails with [`Error::NotFound`] if the log file is
    /// missing.
    pub fn open(id: u64, base_path: &Path, fallback: &Config) -> Result<Self> {
        let filepath = base_path.join(log_filename(id));
        if !filepath.exists() {
            return Err(Error::NotFound(filepath));
        }
        let metadata_filepath = base_path.join(hint_filename(id));
        let actual_size = fs::metadata(&filepath).context("statting segment log")?.len();

        let meta = if metadata_filepath.exists() {
            fs::read_to_string(&metadata_filepath)
                .ok()
                .and_then(|s| serde_json::from_str::<SegmentMeta>(&s).ok())
        } else {
            None
        };

        match meta {
            // The hint file is only trustworthy if its recorded size matches
            // what's actually on disk; otherwise a crash happened between an
            // append and the next periodic sync.
            Some(meta) if meta.size == actual_size => {
                log::info!("segment {id}: opening from hint file ({actual_size} bytes, {} entries)", meta.num_entries);
                Self::from_meta(meta)
            }
            Some(meta) => {
                log::warn!(
                    "segment {id}: hint file out of date (hint says {} bytes, log has {actual_size}), rebuilding from scan",
                    meta.size
                );
                Self::scan_and_rebuild(id, base_path, fallback)
            }
            None => {
                log::info!("segment {id}: no hint file found, rebuilding from scan");
                Self::scan_and_rebuild(id, base_path, fallback)
            }
        }
    }

    fn from_meta(meta: SegmentMeta) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&meta.filepath)
            .context(format!("opening segment log {}", meta.filepath.display()))?;
        Ok(Self {
            id: meta.id,
            index_filepath: index_filepath_for(&meta.filepath),
            filepath: meta.filepath,
            metadata_filepath: meta.metadata_filepath,
            size: meta.size,
            num_entries: meta.num_entries,
            active: meta.active,
            closed: meta.closed,
            max_size: meta.max_size,
            max_entries: meta.max_entries,
            created_at: meta.created_at,
            metadata_sync_interval: meta.metadata_sync_interval,
            last_sync: meta.last_sync,
            file,
        })
    }

    /// Rebuilds a segment's metadata by scanning its log file, discarding
    /// any trailing partial entry left by an interrupted write. Returns a
    /// closed, inactive segment and persists a fresh hint file.
    fn scan_and_rebuild(id: u64, base_path: &Path, fallback: &Config) -> Result<Self> {
        let filepath = base_path.join(log_filename(id));
        let metadata_filepath = base_path.join(hint_filename(id));
        let index_filepath = base_path.join(index_filename(id));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&filepath)
            .context(format!("opening segment log {}", filepath.display()))?;
        let file_size = file.metadata().context("statting segment log")?.len();

        let mut offset = 0u64;
        let mut num_entries = 0u64;
        let mut header = [0u8; HEADER_SIZE];
        loop {
            if offset >= file_size {
                break;
            }
            file.seek(SeekFrom::Start(offset)).context("seeking during segment scan")?;
            if file.read_exact(&mut header).is_err() {
                log::warn!("segment {id}: truncated header at offset {offset}, discarding trailing bytes");
                break;
            }
            let key_size = u32::from_be_bytes(header[8..12].try_into().unwrap()) as u64;
            let value_size = u32::from_be_bytes(header[12..16].try_into().unwrap()) as u64;
            let entry_size = HEADER_SIZE as u64 + key_size + value_size;
            if offset + entry_size > file_size {
                log::warn!(
                    "segment {id}: partial entry at offset {offset} (needs {entry_size} bytes, {} available), discarding",
                    file_size - offset
                );
                break;
            }
            offset += entry_size;
            num_entries += 1;
        }

        if offset < file_size {
            file.set_len(offset).context("truncating trailing partial entry")?;
        }

        let created_at =
            file.metadata().ok().and_then(|m| m.created().ok()).and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or_else(now);

        let mut segment = Self {
            id,
            filepath,
            metadata_filepath,
            index_filepath,
            size: offset,
            num_entries,
            active: false,
            closed: true,
            max_size: fallback.max_segment_size,
            max_entries: fallback.max_segment_entries,
            created_at,
            metadata_sync_interval: fallback.metadata_sync_interval,
            last_sync: now(),
            file,
        };
        segment.sync_metadata()?;
        Ok(segment)
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.max_size || self.num_entries >= self.max_entries
    }

    pub fn is_active(&self) -> bool {
        self.active && !self.closed
    }

    /// Marks the segment inactive and closed, and persists that fact.
    pub fn close(&mut self) -> Result<()> {
        self.active = false;
        self.closed = true;
        self.sync_metadata()
    }

    /// Appends `entry` to the log, records it in the index sidecar, and
    /// periodically persists the hint file.
    pub fn append(&mut self, entry: &Entry) -> Result<AppendResult> {
        if self.is_full() {
            return Err(Error::SegmentFull(self.id));
        }
        let entry_size = entry.size();
        if self.size + entry_size > self.max_size {
            return Err(Error::SegmentFull(self.id));
        }
        if self.num_entries + 1 > self.max_entries {
            return Err(Error::SegmentFull(self.id));
        }

        let offset = self.size;
        let bytes = entry.serialize();
        self.file.seek(SeekFrom::End(0)).context("seeking to end of segment log")?;
        self.file.write_all(&bytes).context("appending entry to segment log")?;
        self.file.flush().context("flushing segment log")?;

        self.size += entry_size;
        self.num_entries += 1;

        self.append_index_record(entry, offset)?;

        if now() - self.last_sync >= self.metadata_sync_interval {
            self.sync_metadata()?;
        }

        Ok(AppendResult { segment_id: self.id, offset, entry_size })
    }

    fn append_index_record(&self, entry: &Entry, offset: u64) -> Result<()> {
        let record = IndexRecord {
            key: String::from_utf8_lossy(&entry.key).into_owned(),
            offset,
            size: entry.value_size(),
            timestamp: entry.timestamp,
            tombstone: entry.tombstone,
        };
        let line = serde_json::to_string(&record)?;
        let mut f = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.index_filepath)
            .context("opening segment index file")?;
        writeln!(f, "{line}").context("appending to segment index file")?;
        Ok(())
    }

    /// Reads the entry whose first byte is at `offset`.
    pub fn read(&self, offset: u64) -> Result<Entry> {
        // Clone the handle rather than requiring `&mut self`: segments are
        // read-only once their metadata is loaded, and a shared read path
        // lets the store and segment manager read without locking out
        // concurrent reads of other segments.
        let mut f = self.file.try_clone().context("cloning segment file handle")?;
        f.seek(SeekFrom::Start(offset)).context("seeking to read entry")?;

        let mut header = [0u8; HEADER_SIZE];
        f.read_exact(&mut header)
            .map_err(|_| Error::MalformedEntry(format!("truncated header at offset {offset}")))?;
        let key_size = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let value_size = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;

        let mut body = vec![0u8; key_size + value_size];
        f.read_exact(&mut body)
            .map_err(|_| Error::MalformedEntry(format!("truncated body at offset {offset}")))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&body);
        Entry::deserialize(&buf)
    }

    /// Atomically replaces the hint file with the segment's current state.
    fn sync_metadata(&mut self) -> Result<()> {
        self.last_sync = now();
        let meta = SegmentMeta {
            id: self.id,
            filepath: self.filepath.clone(),
            metadata_filepath: self.metadata_filepath.clone(),
            size: self.size,
            num_entries: self.num_entries,
            active: self.active,
            max_size: self.max_size,
            max_entries: self.max_entries,
            closed: self.closed,
            created_at: self.created_at,
            metadata_sync_interval: self.metadata_sync_interval,
            last_sync: self.last_sync,
        };

        let mut tmp_path = self.metadata_filepath.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let write_result = (|| -> Result<()> {
            let json = serde_json::to_string_pretty(&meta)?;
            fs::write(&tmp_path, json).context("writing temporary hint file")?;
            fs::rename(&tmp_path, &self.metadata_filepath).context("renaming hint file into place")?;
            Ok(())
        })();

        if write_result.is_err() && tmp_path.exists() {
            let _ = fs::remove_file(&tmp_path);
        }
        write_result
    }
}

fn index_filepath_for(log_filepath: &Path) -> PathBuf {
    let mut s = log_filepath.as_os_str().to_owned();
    s.push(".index");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    fn cfg() -> Config {
        Config { max_segment_size: 1024, max_segment_entries: 3, ..Config::default() }
    }

    #[test]
    fn new_segment_is_active_and_empty() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::new(0, dir.path(), 1024, 10).unwrap();
        assert!(segment.is_active());
        assert!(!segment.is_full());
        assert_eq!(segment.size, 0);
        assert_eq!(segment.num_entries, 0);
        assert!(dir.path().join("segment_0.hint").exists());
        assert!(dir.path().join("segment_0.log.index").exists());
    }

    #[test]
    fn append_returns_offsets_in_order() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::new(0, dir.path(), 1 << 20, 100).unwrap();

        let e1 = Entry::put(b"a".to_vec(), b"1".to_vec(), 1.0);
        let e2 = Entry::put(b"bb".to_vec(), b"22".to_vec(), 2.0);

        let r1 = segment.append(&e1).unwrap();
        let r2 = segment.append(&e2).unwrap();

        assert_eq!(r1.offset, 0);
        assert_eq!(r1.entry_size, e1.size());
        assert_eq!(r2.offset, e1.size());
        assert_eq!(r2.entry_size, e2.size());
        assert_eq!(segment.size, e1.size() + e2.size());
        assert_eq!(segment.num_entries, 2);
    }

    #[test]
    fn read_round_trips_appended_entries() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::new(0, dir.path(), 1 << 20, 100).unwrap();
        let e = Entry::put(b"key".to_vec(), b"value".to_vec(), 99.0);
        let r = segment.append(&e).unwrap();
        assert_eq!(segment.read(r.offset).unwrap(), e);
    }

    #[test]
    fn full_by_entry_count_rejects_append() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::new(0, dir.path(), 1 << 20, 2).unwrap();
        segment.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1.0)).unwrap();
        segment.append(&Entry::put(b"b".to_vec(), b"2".to_vec(), 2.0)).unwrap();
        assert!(matches!(
            segment.append(&Entry::put(b"c".to_vec(), b"3".to_vec(), 3.0)),
            Err(Error::SegmentFull(0))
        ));
    }

    #[test]
    fn full_by_size_rejects_append() {
        let dir = TempDir::new().unwrap();
        let e = Entry::put(b"a".to_vec(), b"1".to_vec(), 1.0);
        let mut segment = Segment::new(0, dir.path(), e.size(), 100).unwrap();
        segment.append(&e).unwrap();
        assert!(matches!(
            segment.append(&Entry::put(b"b".to_vec(), b"2".to_vec(), 2.0)),
            Err(Error::SegmentFull(0))
        ));
    }

    /// Tests that is_full() handles the size/entry-count caps correctly.
    #[test_case(0, 0, 100, 10 => false; "empty segment")]
    #[test_case(99, 9, 100, 10 => false; "below both limits")]
    #[test_case(100, 9, 100, 10 => true; "at size limit")]
    #[test_case(101, 9, 100, 10 => true; "over size limit")]
    #[test_case(50, 10, 100, 10 => true; "at entry limit")]
    #[test_case(50, 11, 100, 10 => true; "over entry limit")]
    fn is_full_cases(size: u64, num_entries: u64, max_size: u64, max_entries: u64) -> bool {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::new(0, dir.path(), max_size, max_entries).unwrap();
        segment.size = size;
        segment.num_entries = num_entries;
        segment.is_full()
    }

    #[test]
    fn open_prefers_hint_file_when_consistent() {
        let dir = TempDir::new().unwrap();
        {
            let mut segment = Segment::new(0, dir.path(), 1 << 20, 100).unwrap();
            segment.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1.0)).unwrap();
            segment.close().unwrap();
        }
        let reopened = Segment::open(0, dir.path(), &cfg()).unwrap();
        assert_eq!(reopened.num_entries, 1);
        assert!(reopened.closed);
        assert!(!reopened.active);
    }

    #[test]
    fn open_rebuilds_when_hint_missing() {
        let dir = TempDir::new().unwrap();
        {
            let mut segment = Segment::new(0, dir.path(), 1 << 20, 100).unwrap();
            segment.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1.0)).unwrap();
            segment.append(&Entry::put(b"b".to_vec(), b"2".to_vec(), 2.0)).unwrap();
        }
        fs::remove_file(dir.path().join("segment_0.hint")).unwrap();

        let reopened = Segment::open(0, dir.path(), &cfg()).unwrap();
        assert_eq!(reopened.num_entries, 2);
        assert!(!reopened.active);
        assert!(reopened.closed);
    }

    #[test]
    fn open_rebuilds_when_hint_diverges_from_log() {
        let dir = TempDir::new().unwrap();
        {
            let mut segment = Segment::new(0, dir.path(), 1 << 20, 100).unwrap();
            segment.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1.0)).unwrap();
        }
        // Simulate a crash after an append but before the next metadata sync:
        // append a second entry to the log directly without updating the hint.
        {
            let mut f = OpenOptions::new().append(true).open(dir.path().join("segment_0.log")).unwrap();
            f.write_all(&Entry::put(b"b".to_vec(), b"2".to_vec(), 2.0).serialize()).unwrap();
        }

        let reopened = Segment::open(0, dir.path(), &cfg()).unwrap();
        assert_eq!(reopened.num_entries, 2);
    }

    #[test]
    fn scan_rebuild_discards_trailing_partial_entry() {
        let dir = TempDir::new().unwrap();
        let filepath;
        {
            let mut segment = Segment::new(0, dir.path(), 1 << 20, 100).unwrap();
            segment.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1.0)).unwrap();
            filepath = segment.filepath.clone();
        }
        // Append a truncated (partial) entry directly to the log file.
        {
            let mut f = OpenOptions::new().append(true).open(&filepath).unwrap();
            let full = Entry::put(b"bb".to_vec(), b"222".to_vec(), 2.0).serialize();
            f.write_all(&full[..full.len() - 2]).unwrap();
        }
        fs::remove_file(dir.path().join("segment_0.hint")).unwrap();

        let reopened = Segment::open(0, dir.path(), &cfg()).unwrap();
        assert_eq!(reopened.num_entries, 1);
        assert_eq!(reopened.size, Entry::put(b"a".to_vec(), b"1".to_vec(), 1.0).size());
        let on_disk = fs::metadata(&filepath).unwrap().len();
        assert_eq!(on_disk, reopened.size);
    }

    #[test]
    fn open_missing_log_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(Segment::open(0, dir.path(), &cfg()), Err(Error::NotFound(_))));
    }
}
