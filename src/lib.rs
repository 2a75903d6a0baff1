//!
//! An embedded key-value store built on a [Log-Structured Merge
//! Tree](https://en.wikipedia.org/wiki/Log-structured_merge-tree).
//!
//! ## Example usage
//!
//! ```
//! use jumpdb::EngineBuilder;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut db = EngineBuilder::new()
//!         .persist_segments(false)
//!         .segment_size(2)
//!         .max_inmemory_size(1)
//!         .sparse_offset(2)
//!         .build()?;
//!
//!     db.put("k1".to_owned(), "v1".to_owned())?;
//!     db.put("k2".to_owned(), "v2".to_owned())?;
//!     db.put("k1".to_owned(), "v1_1".to_owned())?;
//!     let value = db.get("k1")?;
//!     assert_eq!(value, Some("v1_1".to_owned()));
//!     Ok(())
//! }
//! ```
//!
//! ## Design
//!
//! `jumpdb` is an embedded key-value store that uses LSM-trees. There is no
//! write-ahead log; a write is durable only once its containing segment has
//! been flushed and closed.
//!
//! ### Write
//! When a write comes in:
//! * It is inserted into the memtable.
//! * If the memtable was already at capacity for a *new* key, the memtable
//!   is flushed into a new on-disk segment first, compaction runs if the
//!   segment count has crossed `merge_threshold`, and only then does the
//!   write land in the now-empty memtable.
//!
//! ### Read
//! When a read comes in:
//! * The Bloom filter is consulted first; a negative answer is definitive
//!   and skips every other step.
//! * The memtable is checked next.
//! * Failing that, the sparse index narrows the search down to the
//!   segment(s) most likely to hold the key, and a linear scan confirms it.
//!
//! ### Delete
//! A delete is a write of a tombstone marker; flush silently drops
//! tombstones instead of ever writing them to disk.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`record`] | The one-record-per-line JSON codec used by every segment file |
//! | [`memtable`] | The in-memory, capacity-bounded write buffer |
//! | [`segment`] | Append-only writer / seekable reader over one sorted run |
//! | [`merge`] | The k-way merge that drives compaction |
//! | [`sparse_index`] | The key-sampled locator map used to narrow disk reads |
//! | [`bloom`] | The scalable Bloom filter used to short-circuit negative reads |
//! | [`recovery`] | Directory-scan based reconstruction of engine state on open |
//! | [`error`] | The crate-wide error type |

pub mod bloom;
pub mod error;
pub mod memtable;
pub mod merge;
pub mod record;
pub mod recovery;
pub mod segment;
pub mod sparse_index;

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{debug, trace};

pub use error::Error;
use error::Result;

use bloom::ScalableBloomFilter;
use memtable::{Memtable, ValueStatus};
use segment::{Segment, SegmentWriter};
use sparse_index::{KeyDirEntry, SparseIndex};

/// Engine construction options; see the crate docs' configuration table.
#[derive(Debug, Clone)]
pub struct Config {
    /// Memtable capacity, in distinct keys.
    pub max_inmemory_size: usize,
    /// Sampling stride for the sparse index: one offset is kept in memory
    /// for every `sparse_offset` records written.
    pub sparse_offset: usize,
    /// Maximum number of records in a segment produced by compaction.
    pub segment_size: usize,
    /// If `false`, segments live in temp files removed once they are
    /// superseded or the engine is dropped.
    pub persist_segments: bool,
    /// Segment count at which a flush is followed by compaction.
    pub merge_threshold: usize,
    /// Directory to scan on open and to write persistent segments into.
    /// `None` means temp-file-backed, non-persistent segments.
    pub path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_inmemory_size: 500,
            sparse_offset: 35,
            segment_size: 1500,
            persist_segments: false,
            merge_threshold: 3,
            path: None,
        }
    }
}

/// Fluent builder for [`Engine`], mirroring the construction style used
/// across this engine's sibling LSM implementations.
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: Config,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder::default()
    }

    pub fn max_inmemory_size(mut self, size: usize) -> Self {
        self.config.max_inmemory_size = size;
        self
    }

    pub fn sparse_offset(mut self, stride: usize) -> Self {
        self.config.sparse_offset = stride;
        self
    }

    pub fn segment_size(mut self, size: usize) -> Self {
        self.config.segment_size = size;
        self
    }

    pub fn persist_segments(mut self, persist: bool) -> Self {
        self.config.persist_segments = persist;
        self
    }

    pub fn merge_threshold(mut self, threshold: usize) -> Self {
        self.config.merge_threshold = threshold;
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Engine> {
        if self.config.segment_size < self.config.max_inmemory_size {
            panic!(
                "segment_size ({}) cannot be smaller than max_inmemory_size ({})",
                self.config.segment_size, self.config.max_inmemory_size
            );
        }
        Engine::open(self.config)
    }
}

pub struct Engine {
    memtable: Memtable,
    segments: Vec<Segment>,
    sparse_index: SparseIndex,
    bloom: ScalableBloomFilter,
    config: Config,
}

impl Engine {
    /// Opens an engine. If `config.path` is set, scans it for pre-existing
    /// segments and rebuilds the sparse index and Bloom filter from them
    /// (see [`recovery::recover`]); recovery is all-or-nothing, so this
    /// fails rather than exposing a partially-reconstructed engine.
    pub fn open(config: Config) -> Result<Self> {
        let (segments, sparse_index, bloom) = match &config.path {
            Some(path) => {
                let recovered = recovery::recover(path, config.sparse_offset)?;
                (recovered.segments, recovered.sparse_index, recovered.bloom)
            }
            None => (Vec::new(), SparseIndex::new(), ScalableBloomFilter::new()),
        };

        Ok(Engine {
            memtable: Memtable::new(config.max_inmemory_size),
            segments,
            sparse_index,
            bloom,
            config,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Inserts `value` under `key`. If the memtable is at capacity and
    /// `key` is new, this first flushes the memtable to a new segment
    /// (triggering compaction if the segment count has crossed
    /// `merge_threshold`) before applying the write to the now-empty
    /// memtable.
    pub fn put(&mut self, key: String, value: String) -> Result<()> {
        self.bloom.add(&key);
        self.write_entry(key, ValueStatus::Present(value))
    }

    /// Marks `key` as deleted. Fails with [`Error::NotFound`] if `key` has
    /// no live value anywhere in the store.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        if self.get(key)?.is_none() {
            return Err(Error::NotFound(key.to_owned()));
        }
        self.write_entry(key.to_owned(), ValueStatus::Tombstone)
    }

    fn write_entry(&mut self, key: String, status: ValueStatus) -> Result<()> {
        if self.memtable.capacity_reached() && !self.memtable.contains(&key) {
            debug!(memtable_len = self.memtable.len(), "memtable at capacity, flushing");
            self.flush_memtable()?;
            self.compact_if_needed()?;
        }
        match status {
            ValueStatus::Present(value) => self.memtable.put(key, value),
            ValueStatus::Tombstone => self.memtable.delete(key),
        }
        Ok(())
    }

    /// Looks up `key`: Bloom filter, then memtable, then the sparse index's
    /// best candidates, then a full scan of whatever segments remain
    /// unconsulted, newest first.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        if !self.bloom.contains(key) {
            trace!(key, "bloom filter rejected key");
            return Ok(None);
        }

        if let Some(status) = self.memtable.get(key) {
            trace!(key, "memtable hit");
            return Ok(match status {
                ValueStatus::Present(value) => Some(value.clone()),
                ValueStatus::Tombstone => None,
            });
        }

        if self.sparse_index.is_empty() {
            return Ok(None);
        }

        let mut searched = HashSet::new();
        for locators in self.sparse_index.candidates(key) {
            for locator in locators.iter().rev() {
                if !searched.insert(locator.segment_index) {
                    continue;
                }
                let segment = &self.segments[locator.segment_index];
                if let Some(record) = segment.open_reader()?.search(key, locator.offset)? {
                    trace!(key, segment_index = locator.segment_index, "sparse index hit");
                    return Ok(Some(record.value));
                }
            }
        }

        for (segment_index, segment) in self.segments.iter().enumerate().rev() {
            if searched.contains(&segment_index) {
                continue;
            }
            if let Some(record) = segment.open_reader()?.search(key, 0)? {
                trace!(key, segment_index, "fallback scan hit");
                return Ok(Some(record.value));
            }
        }

        Ok(None)
    }

    /// `false` if the Bloom filter rejects `key` outright; otherwise
    /// equivalent to `get(key).is_some()`.
    pub fn contains(&self, key: &str) -> Result<bool> {
        if !self.bloom.contains(key) {
            return Ok(false);
        }
        Ok(self.get(key)?.is_some())
    }

    fn new_output_segment(&self) -> Result<(Segment, SegmentWriter)> {
        match (self.config.persist_segments, &self.config.path) {
            (true, Some(dir)) => Segment::create_persistent(dir),
            _ => Segment::create_temp(),
        }
    }

    fn flush_memtable(&mut self) -> Result<()> {
        let (segment, mut writer) = self.new_output_segment()?;
        let segment_index = self.segments.len();
        let mut count = 0usize;
        for (key, status) in self.memtable.drain() {
            // tombstones are never written to disk; a deleted key simply
            // has no disk record, and the memtable is the only place a
            // tombstone can ever be observed.
            if let ValueStatus::Present(value) = status {
                let offset = writer.add_entry(&key, &value)?;
                if count % self.config.sparse_offset == 0 {
                    self.sparse_index.record(&key, KeyDirEntry { segment_index, offset });
                }
                count += 1;
            }
        }
        debug!(timestamp = segment.timestamp(), records = writer.len(), "flushed memtable to new segment");
        drop(writer);
        self.segments.push(segment);
        Ok(())
    }

    fn compact_if_needed(&mut self) -> Result<()> {
        if self.segments.len() < self.config.merge_threshold {
            return Ok(());
        }
        debug!(segment_count = self.segments.len(), "compaction starting");
        let segments = std::mem::take(&mut self.segments);
        let base_dir = self.config.path.clone();
        self.sparse_index.clear();

        let sparse_offset = self.config.sparse_offset;
        let sparse_index = &mut self.sparse_index;
        let mut count = 0usize;
        let merged = merge::merge(
            segments,
            self.config.segment_size,
            self.config.persist_segments,
            base_dir.as_deref(),
            |segment_index, offset, key| {
                if count % sparse_offset == 0 {
                    sparse_index.record(key, KeyDirEntry { segment_index, offset });
                }
                count += 1;
            },
        )?;
        debug!(new_segment_count = merged.len(), "compaction finished");
        self.segments = merged;
        Ok(())
    }
}
