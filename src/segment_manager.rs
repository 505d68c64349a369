//! Owns the set of segments under a store directory: assigns ids, routes
//! appends to the active segment, rolls over when it's full, and serves
//! random-access reads by segment id.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::entry::Entry;
use crate::error::{Error, IoContext, Result};
use crate::segment::{AppendResult, Segment};

pub struct SegmentManager {
    base_directory: PathBuf,
    segments: BTreeMap<u64, Segment>,
    active_segment_id: u64,
    next_segment_id: u64,
    config: Config,
}

impl SegmentManager {
    /// Loads any existing segments under `base_directory`, enforces the
    /// single-active-segment invariant, and creates a fresh active segment
    /// if none was found.
    pub fn open(base_directory: &Path, config: Config) -> Result<Self> {
        fs::create_dir_all(base_directory).context("creating store base directory")?;

        let mut segments = BTreeMap::new();
        let mut next_segment_id = 0u64;
        let mut active_ids = Vec::new();

        for entry in fs::read_dir(base_directory).context("listing store base directory")? {
            let entry = entry.context("reading directory entry")?;
            let Some(id) = parse_segment_id(&entry.file_name()) else { continue };
            let segment = Segment::open(id, base_directory, &config)?;
            if segment.is_active() {
                active_ids.push(id);
            }
            next_segment_id = next_segment_id.max(id + 1);
            segments.insert(id, segment);
        }

        // At most one segment may be active. If the hint files disagree
        // (e.g. an unclean shutdown), keep the highest id active and force
        // the rest closed.
        active_ids.sort_unstable();
        let active_segment_id = if let Some((&keep, rest)) = active_ids.split_last() {
            for &id in rest {
                segments.get_mut(&id).expect("segment present").close()?;
            }
            Some(keep)
        } else {
            None
        };

        let mut manager = Self {
            base_directory: base_directory.to_path_buf(),
            segments,
            active_segment_id: active_segment_id.unwrap_or(0),
            next_segment_id,
            config,
        };

        if active_segment_id.is_none() {
            manager.create_active_segment()?;
        }

        Ok(manager)
    }

    fn create_active_segment(&mut self) -> Result<()> {
        let id = self.next_segment_id;
        let segment =
            Segment::new(id, &self.base_directory, self.config.max_segment_size, self.config.max_segment_entries)?;
        self.segments.insert(id, segment);
        self.active_segment_id = id;
        self.next_segment_id += 1;
        Ok(())
    }

    fn active_segment_mut(&mut self) -> &mut Segment {
        self.segments.get_mut(&self.active_segment_id).expect("active segment always present")
    }

    /// Appends `entry` to the active segment, rolling over to a new segment
    /// first if the active one is full. Rollover is strictly
    /// close-then-create-then-append: no write can land between the two.
    pub fn append(&mut self, entry: &Entry) -> Result<AppendResult> {
        if self.active_segment_mut().is_full() {
            let old_id = self.active_segment_id;
            self.active_segment_mut().close()?;
            self.create_active_segment()?;
            log::info!("segment {old_id} full, rolled over to segment {}", self.active_segment_id);
        }
        self.active_segment_mut().append(entry)
    }

    /// Reads the entry at `offset` within segment `segment_id`.
    pub fn read(&self, segment_id: u64, offset: u64) -> Result<Entry> {
        let segment = self.segments.get(&segment_id).ok_or(Error::SegmentNotFound(segment_id))?;
        segment.read(offset)
    }

    /// Iterates over all known segments, in ascending id order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }
}

/// Parses `N` out of a `segment_N.log` filename; `None` for anything else
/// (hint/index sidecars, unrelated files).
fn parse_segment_id(filename: &std::ffi::OsStr) -> Option<u64> {
    let name = filename.to_str()?;
    let id_str = name.strip_prefix("segment_")?.strip_suffix(".log")?;
    id_str.parse().ok()
}
