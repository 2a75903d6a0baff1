//! A segment is one immutable, key-sorted run of records on disk (or, when
//! the engine is configured not to persist, in a temp file that is removed
//! once the segment is no longer needed).
//!
//! Segments are identified by a creation timestamp that survives restart by
//! being embedded in the filename (`<timestamp>.txt`); recency between
//! segments is always decided by comparing this timestamp, never by mtime
//! or insertion order alone.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::record::Record;

/// Disambiguates segments created within the same wall-clock tick. Never
/// reset, so timestamps stay strictly increasing for the lifetime of the
/// process even if `SystemTime::now()` doesn't advance between two calls.
static TIMESTAMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_timestamp() -> f64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let tiebreak = TIMESTAMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    now + (tiebreak as f64) * 1e-6
}

/// Whether `stem` matches the `[+-]?digits.digits` grammar §6 requires of a
/// segment's embedded timestamp, without pulling in a regex dependency for
/// one small check.
fn looks_like_timestamp(stem: &str) -> bool {
    let unsigned = stem.strip_prefix(['+', '-']).unwrap_or(stem);
    let Some((whole, frac)) = unsigned.split_once('.') else {
        return false;
    };
    !whole.is_empty()
        && !frac.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && frac.bytes().all(|b| b.is_ascii_digit())
}

fn parse_timestamp(path: &Path) -> Result<f64> {
    let corrupt = |reason: String| Error::CorruptSegment {
        path: path.to_path_buf(),
        reason,
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| corrupt("filename is not valid UTF-8".into()))?;
    if !looks_like_timestamp(stem) {
        return Err(corrupt(format!(
            "`{stem}` does not look like a `[+-]?digits.digits` timestamp"
        )));
    }
    stem.parse::<f64>()
        .map_err(|e| corrupt(format!("failed to parse timestamp: {e}")))
}

/// The three access modes §4.2 names. `Append` and `ReadWrite` are
/// implemented identically here (create + truncate + write): no code path
/// in this engine ever reads and writes the same handle, so there is
/// nothing for `ReadWrite` to add over `Append` beyond matching the
/// Python original's use of `"w+"` purely to create-and-write a fresh file.
pub enum OpenMode {
    Read,
    Append,
    ReadWrite,
}

pub struct Segment {
    path: PathBuf,
    timestamp: f64,
    // Some for non-persistent segments: dropping this deletes the backing
    // file, so an engine with `persist_segments = false` cleans up simply
    // by letting its segments go out of scope.
    temp: Option<tempfile::TempPath>,
}

impl Segment {
    pub fn create_persistent(dir: &Path) -> Result<(Segment, SegmentWriter)> {
        fs::create_dir_all(dir)?;
        let timestamp = unique_timestamp();
        let path = dir.join(format!("{timestamp:.9}.txt"));
        let segment = Segment {
            path,
            timestamp,
            temp: None,
        };
        let writer = segment.open_writer()?;
        Ok((segment, writer))
    }

    pub fn create_temp() -> Result<(Segment, SegmentWriter)> {
        let timestamp = unique_timestamp();
        let named = tempfile::Builder::new()
            .prefix(&format!("{timestamp:.9}"))
            .suffix(".txt")
            .rand_bytes(0)
            .tempfile()?;
        let path = named.path().to_path_buf();
        let segment = Segment {
            path,
            timestamp,
            temp: Some(named.into_temp_path()),
        };
        let writer = segment.open_writer()?;
        Ok((segment, writer))
    }

    /// Reconstructs a segment handle for a file already on disk, as seen
    /// during recovery's directory scan. Fails with [`Error::CorruptSegment`]
    /// if the filename doesn't carry a parseable timestamp.
    pub fn from_existing_path(path: PathBuf) -> Result<Segment> {
        let timestamp = parse_timestamp(&path)?;
        Ok(Segment {
            path,
            timestamp,
            temp: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Scoped acquisition of the underlying file. `Read` yields a
    /// [`SegmentReader`]; `Append` and `ReadWrite` both yield a
    /// [`SegmentWriter`] (see [`OpenMode`] for why those two don't differ
    /// here). `open_reader`/`open_writer` are the typed call sites most of
    /// this crate uses; this is the one place that actually touches the
    /// filesystem.
    pub fn open(&self, mode: OpenMode) -> Result<SegmentHandle> {
        match mode {
            OpenMode::Read => {
                let file = File::open(&self.path)?;
                Ok(SegmentHandle::Reader(SegmentReader {
                    reader: BufReader::new(file),
                }))
            }
            OpenMode::Append | OpenMode::ReadWrite => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&self.path)?;
                Ok(SegmentHandle::Writer(SegmentWriter {
                    file,
                    previous_key: None,
                    count: 0,
                }))
            }
        }
    }

    pub fn open_reader(&self) -> Result<SegmentReader> {
        match self.open(OpenMode::Read)? {
            SegmentHandle::Reader(reader) => Ok(reader),
            SegmentHandle::Writer(_) => unreachable!("OpenMode::Read always yields a Reader"),
        }
    }

    pub fn open_writer(&self) -> Result<SegmentWriter> {
        match self.open(OpenMode::Append)? {
            SegmentHandle::Writer(writer) => Ok(writer),
            SegmentHandle::Reader(_) => unreachable!("OpenMode::Append always yields a Writer"),
        }
    }

    /// Removes the backing file. For a persistent segment this is an
    /// explicit `remove_file`; for a non-persistent one it's implicit
    /// (dropping `self` drops the `TempPath` guard).
    pub fn delete(self) -> Result<()> {
        if self.temp.is_none() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

pub enum SegmentHandle {
    Reader(SegmentReader),
    Writer(SegmentWriter),
}

pub struct SegmentReader {
    reader: BufReader<File>,
}

impl SegmentReader {
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn read_entry(&mut self) -> Result<Option<Record>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.strip_suffix('\n').unwrap_or(&line);
        Ok(Some(Record::decode(trimmed)?))
    }

    pub fn peek_entry(&mut self) -> Result<Option<Record>> {
        let pos = self.reader.stream_position()?;
        let entry = self.read_entry();
        self.reader.seek(SeekFrom::Start(pos))?;
        entry
    }

    /// Linear scan from `start_offset` for `query_key`. Stops as soon as a
    /// strictly greater key is observed, since entries are sorted.
    pub fn search(&mut self, query_key: &str, start_offset: u64) -> Result<Option<Record>> {
        self.seek(start_offset)?;
        while let Some(record) = self.read_entry()? {
            match record.key.as_str().cmp(query_key) {
                std::cmp::Ordering::Equal => return Ok(Some(record)),
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Less => continue,
            }
        }
        Ok(None)
    }

    /// Consumes the reader into a lazy, from-the-current-position sequence
    /// of records. Dropping the iterator (early break, error, or plain
    /// exhaustion) closes the underlying file.
    pub fn entries(mut self) -> impl Iterator<Item = Result<Record>> {
        std::iter::from_fn(move || self.read_entry().transpose())
    }

    /// As [`Self::entries`], but yielding each record's starting offset
    /// alongside it.
    pub fn offsets_and_entries(mut self) -> impl Iterator<Item = Result<(u64, Record)>> {
        std::iter::from_fn(move || {
            let offset = match self.reader.stream_position() {
                Ok(offset) => offset,
                Err(e) => return Some(Err(Error::from(e))),
            };
            match self.read_entry() {
                Ok(Some(record)) => Some(Ok((offset, record))),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        })
    }
}

pub struct SegmentWriter {
    file: File,
    previous_key: Option<String>,
    count: usize,
}

impl SegmentWriter {
    /// Appends a record, returning the byte offset of its first byte.
    /// Fails with [`Error::UnsortedWrite`] if `key` is not strictly greater
    /// than the last key appended in this open session.
    pub fn add_entry(&mut self, key: &str, value: &str) -> Result<u64> {
        if let Some(previous) = &self.previous_key {
            if key <= previous.as_str() {
                return Err(Error::UnsortedWrite {
                    previous: previous.clone(),
                    current: key.to_owned(),
                });
            }
        }
        let offset = self.file.stream_position()?;
        let line = Record::new(key, value).encode();
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.previous_key = Some(key.to_owned());
        self.count += 1;
        Ok(offset)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_dispatches_on_mode() -> Result<()> {
        let (segment, mut writer) = Segment::create_temp()?;
        writer.add_entry("k1", "v1")?;
        drop(writer);

        match segment.open(OpenMode::Read)? {
            SegmentHandle::Reader(mut reader) => {
                assert_eq!(reader.read_entry()?, Some(Record::new("k1", "v1")));
            }
            SegmentHandle::Writer(_) => panic!("OpenMode::Read must yield a Reader"),
        }

        match segment.open(OpenMode::ReadWrite)? {
            SegmentHandle::Writer(mut writer) => {
                writer.add_entry("k2", "v2")?;
            }
            SegmentHandle::Reader(_) => panic!("OpenMode::ReadWrite must yield a Writer"),
        }
        Ok(())
    }

    #[test]
    fn read_after_write() -> Result<()> {
        let (segment, mut writer) = Segment::create_temp()?;
        writer.add_entry("k1", "v1")?;
        writer.add_entry("k2", "v2")?;
        drop(writer);

        let reader = segment.open_reader()?;
        let entries: Vec<_> = reader.entries().collect::<Result<_>>()?;
        assert_eq!(
            entries,
            vec![Record::new("k1", "v1"), Record::new("k2", "v2")]
        );
        Ok(())
    }

    #[test]
    fn peek_does_not_advance() -> Result<()> {
        let (segment, mut writer) = Segment::create_temp()?;
        writer.add_entry("k1", "v1")?;
        drop(writer);

        let mut reader = segment.open_reader()?;
        let first = reader.peek_entry()?;
        let second = reader.peek_entry()?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn seek_lands_on_the_written_offset() -> Result<()> {
        let (segment, mut writer) = Segment::create_temp()?;
        let first_offset = writer.add_entry("k1", "v1")?;
        let second_offset = writer.add_entry("k2", "v2")?;
        writer.add_entry("k3", "v3")?;
        drop(writer);

        let mut reader = segment.open_reader()?;
        reader.seek(first_offset)?;
        assert_eq!(reader.read_entry()?, Some(Record::new("k1", "v1")));

        reader.seek(second_offset)?;
        assert_eq!(reader.read_entry()?, Some(Record::new("k2", "v2")));
        Ok(())
    }

    #[test]
    fn search_finds_and_stops_early() -> Result<()> {
        let (segment, mut writer) = Segment::create_temp()?;
        let o1 = writer.add_entry("k1", "v1")?;
        let o2 = writer.add_entry("k2", "v2")?;
        writer.add_entry("k3", "v3")?;
        drop(writer);

        let mut reader = segment.open_reader()?;
        assert_eq!(
            reader.search("k2", o2)?,
            Some(Record::new("k2", "v2"))
        );
        assert_eq!(reader.search("k1", o2)?, None, "search must not walk backwards from start_offset");
        let _ = o1;
        Ok(())
    }

    #[test]
    fn unsorted_write_is_rejected() -> Result<()> {
        let (_segment, mut writer) = Segment::create_temp()?;
        writer.add_entry("k2", "v2")?;
        assert!(writer.add_entry("k1", "v1").is_err());
        Ok(())
    }

    #[test]
    fn duplicate_key_in_same_session_is_rejected() -> Result<()> {
        let (_segment, mut writer) = Segment::create_temp()?;
        writer.add_entry("k1", "v1")?;
        assert!(writer.add_entry("k1", "v1_1").is_err());
        Ok(())
    }

    #[test]
    fn persistent_segments_embed_a_parseable_timestamp() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (segment, mut writer) = Segment::create_persistent(dir.path())?;
        writer.add_entry("k1", "v1")?;
        drop(writer);

        let reopened = Segment::from_existing_path(segment.path().to_path_buf())?;
        assert_eq!(reopened.timestamp(), segment.timestamp());
        Ok(())
    }

    #[test]
    fn garbage_filenames_are_corrupt() {
        let path = PathBuf::from("not-a-timestamp.txt");
        assert!(matches!(
            Segment::from_existing_path(path),
            Err(Error::CorruptSegment { .. })
        ));
    }

    #[test]
    fn delete_removes_persistent_files_from_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (segment, writer) = Segment::create_persistent(dir.path())?;
        drop(writer);
        let path = segment.path().to_path_buf();
        assert!(path.exists());
        segment.delete()?;
        assert!(!path.exists());
        Ok(())
    }
}
