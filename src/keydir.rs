//! The in-memory index: a map from key to the location of its most recent
//! live write, plus the startup procedure that rebuilds it from disk.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};

use crate::entry::Entry;
use crate::segment::{IndexRecord, Segment};
use crate::segment_manager::SegmentManager;

/// Where a key's latest live value lives on disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeydirEntry {
    pub segment_id: u64,
    pub value_pos: u64,
    pub value_size: u32,
    pub timestamp: f64,
}

/// Maps each live key to its latest write location.
#[derive(Debug, Default)]
pub struct Keydir {
    table: HashMap<String, KeydirEntry>,
}

impl Keydir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<KeydirEntry> {
        self.table.get(key).copied()
    }

    /// Unconditionally overwrites the mapping for `key`.
    pub fn put(&mut self, key: &str, segment_id: u64, value_pos: u64, value_size: u32, timestamp: f64) {
        self.table.insert(key.to_string(), KeydirEntry { segment_id, value_pos, value_size, timestamp });
    }

    pub fn delete(&mut self, key: &str) {
        self.table.remove(key);
    }

    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Upserts `key` with `candidate` only if the existing mapping is absent
    /// or strictly older. Ties keep the existing entry, making recovery
    /// idempotent.
    fn upsert_if_newer(&mut self, key: &str, candidate: KeydirEntry) {
        match self.table.get(key) {
            Some(existing) if existing.timestamp >= candidate.timestamp => {}
            _ => {
                self.table.insert(key.to_string(), candidate);
            }
        }
    }

    /// Deletes `key` if the tombstone being recovered is newer than (or as
    /// new as) whatever is currently mapped, so an older mapping can't
    /// resurrect a key a later tombstone removed.
    fn delete_if_newer_or_absent(&mut self, key: &str, tombstone_timestamp: f64) {
        match self.table.get(key) {
            Some(existing) if existing.timestamp > tombstone_timestamp => {}
            _ => {
                self.table.remove(key);
            }
        }
    }

    /// Rebuilds the keydir from every segment the manager owns. Segment
    /// order doesn't matter: correctness relies purely on timestamp
    /// comparisons, which are idempotent and commutative.
    pub fn recover_from(&mut self, manager: &SegmentManager) {
        for segment in manager.segments() {
            self.recover_segment(segment);
        }
    }

    fn recover_segment(&mut self, segment: &Segment) {
        match self.recover_from_index(segment) {
            Ok(()) => {}
            Err(reason) => {
                log::warn!("segment {}: {reason}, falling back to log scan", segment.id);
                self.recover_from_scan(segment);
            }
        }
    }

    /// Recovers from the `.log.index` sidecar. Returns `Err` (with a reason)
    /// if the sidecar can't be opened at all, so the caller falls back to a
    /// full scan; individual malformed lines are logged and skipped without
    /// aborting the whole recovery.
    fn recover_from_index(&mut self, segment: &Segment) -> Result<(), String> {
        let file = std::fs::File::open(&segment.index_filepath).map_err(|e| e.to_string())?;
        let reader = BufReader::new(file);

        for (line_num, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    log::warn!("segment {}: error reading index line {}: {err}", segment.id, line_num + 1);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let record: IndexRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("segment {}: malformed index line {}: {err}", segment.id, line_num + 1);
                    continue;
                }
            };

            if record.tombstone {
                self.delete_if_newer_or_absent(&record.key, record.timestamp);
            } else {
                self.upsert_if_newer(
                    &record.key,
                    KeydirEntry {
                        segment_id: segment.id,
                        value_pos: record.offset,
                        value_size: record.size,
                        timestamp: record.timestamp,
                    },
                );
            }
        }
        Ok(())
    }

    /// Recovers by scanning the raw log in file order. Tombstones are kept
    /// as live, zero-length keydir entries here (there's no sidecar to
    /// carry an explicit delete marker on this path) — callers must
    /// defensively recheck the tombstone byte when reading through a
    /// keydir entry that may have come from this path.
    fn recover_from_scan(&mut self, segment: &Segment) {
        let mut offset = 0u64;
        while offset < segment.size {
            let entry = match segment.read(offset) {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("segment {}: stopping scan at offset {offset}: {err}", segment.id);
                    break;
                }
            };
            let entry_size = entry.size();
            self.apply_scanned_entry(segment.id, offset, &entry);
            offset += entry_size;
        }
    }

    fn apply_scanned_entry(&mut self, segment_id: u64, offset: u64, entry: &Entry) {
        let key = String::from_utf8_lossy(&entry.key).into_owned();
        self.upsert_if_newer(
            &key,
            KeydirEntry {
                segment_id,
                value_pos: offset,
                value_size: entry.value_size(),
                timestamp: entry.timestamp,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let mut keydir = Keydir::new();
        keydir.put("a", 0, 10, 5, 1.0);
        assert_eq!(keydir.get("a").unwrap().value_pos, 10);
        keydir.delete("a");
        assert!(keydir.get("a").is_none());
    }

    #[test]
    fn delete_missing_key_is_silent() {
        let mut keydir = Keydir::new();
        keydir.delete("nope");
        assert_eq!(keydir.size(), 0);
    }

    #[test]
    fn upsert_if_newer_keeps_latest_timestamp() {
        let mut keydir = Keydir::new();
        keydir.upsert_if_newer("a", KeydirEntry { segment_id: 0, value_pos: 0, value_size: 1, timestamp: 5.0 });
        keydir.upsert_if_newer("a", KeydirEntry { segment_id: 0, value_pos: 10, value_size: 1, timestamp: 3.0 });
        assert_eq!(keydir.get("a").unwrap().value_pos, 0, "older write must not overwrite newer");

        keydir.upsert_if_newer("a", KeydirEntry { segment_id: 0, value_pos: 20, value_size: 1, timestamp: 7.0 });
        assert_eq!(keydir.get("a").unwrap().value_pos, 20, "newer write must win");
    }

    #[test]
    fn upsert_tie_keeps_existing() {
        let mut keydir = Keydir::new();
        keydir.upsert_if_newer("a", KeydirEntry { segment_id: 0, value_pos: 0, value_size: 1, timestamp: 5.0 });
        keydir.upsert_if_newer("a", KeydirEntry { segment_id: 0, value_pos: 99, value_size: 1, timestamp: 5.0 });
        assert_eq!(keydir.get("a").unwrap().value_pos, 0);
    }
}
