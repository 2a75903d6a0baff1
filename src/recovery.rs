//! Rebuilds an engine's in-memory state from a directory of segment files
//! left behind by a previous process. There is no write-ahead log: recovery
//! is entirely a function of which segments are on disk.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::bloom::ScalableBloomFilter;
use crate::error::{Error, Result};
use crate::segment::Segment;
use crate::sparse_index::{KeyDirEntry, SparseIndex};

/// Turns a decode failure while walking `segment` into the spec-mandated
/// [`Error::CorruptSegment`], instead of letting the underlying
/// [`Error::InvalidRecord`]/[`Error::Io`] escape recovery unconverted.
fn corrupt_line(segment: &Segment, err: Error) -> Error {
    Error::CorruptSegment {
        path: segment.path().to_path_buf(),
        reason: err.to_string(),
    }
}

pub struct Recovered {
    pub segments: Vec<Segment>,
    pub sparse_index: SparseIndex,
    pub bloom: ScalableBloomFilter,
}

/// Scans `path` for segment files, orders them oldest-first by their
/// embedded timestamp, then rebuilds the sparse index and Bloom filter by
/// walking every record in every segment. All-or-nothing: any corrupt
/// filename or line aborts the whole recovery.
pub fn recover(path: &Path, sparse_offset: usize) -> Result<Recovered> {
    if !path.exists() {
        info!(path = %path.display(), "no existing segment directory, starting empty");
        return Ok(Recovered {
            segments: Vec::new(),
            sparse_index: SparseIndex::new(),
            bloom: ScalableBloomFilter::new(),
        });
    }

    let mut paths: Vec<_> = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    paths.retain(|p| p.is_file());

    let mut segments = paths
        .into_iter()
        .map(Segment::from_existing_path)
        .collect::<Result<Vec<_>>>()?;
    segments.sort_by(|a, b| {
        a.timestamp()
            .partial_cmp(&b.timestamp())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    info!(count = segments.len(), path = %path.display(), "recovered segment list");

    let mut sparse_index = SparseIndex::new();
    let mut count = 0usize;
    for (segment_index, segment) in segments.iter().enumerate() {
        for result in segment.open_reader()?.offsets_and_entries() {
            let (offset, record) = result.map_err(|e| corrupt_line(segment, e))?;
            if count % sparse_offset == 0 {
                sparse_index.record(&record.key, KeyDirEntry { segment_index, offset });
            }
            count += 1;
        }
    }

    let mut bloom = ScalableBloomFilter::new();
    for segment in &segments {
        for result in segment.open_reader()?.entries() {
            let record = result.map_err(|e| corrupt_line(segment, e))?;
            bloom.add(&record.key);
        }
    }

    if segments.is_empty() {
        warn!(path = %path.display(), "segment directory exists but contains no segments");
    }

    Ok(Recovered {
        segments,
        sparse_index,
        bloom,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;

    #[test]
    fn recovers_segments_in_timestamp_order_and_rebuilds_index() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let (s1, mut w1) = Segment::create_persistent(dir.path())?;
        w1.add_entry("k1", "v1")?;
        drop(w1);
        std::thread::sleep(std::time::Duration::from_millis(1));

        let (s2, mut w2) = Segment::create_persistent(dir.path())?;
        w2.add_entry("k2", "v2")?;
        drop(w2);
        std::thread::sleep(std::time::Duration::from_millis(1));

        let (s3, mut w3) = Segment::create_persistent(dir.path())?;
        w3.add_entry("k2", "v2_2")?;
        drop(w3);

        assert!(s1.timestamp() < s2.timestamp());
        assert!(s2.timestamp() < s3.timestamp());

        let recovered = recover(dir.path(), 1)?;
        assert_eq!(recovered.segments.len(), 3);
        assert!(recovered.segments.windows(2).all(|w| w[0].timestamp() < w[1].timestamp()));
        assert!(recovered.bloom.contains("k1"));
        assert!(recovered.bloom.contains("k2"));
        assert!(!recovered.sparse_index.is_empty());
        Ok(())
    }

    #[test]
    fn missing_directory_recovers_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("does-not-exist");
        let recovered = recover(&missing, 10)?;
        assert!(recovered.segments.is_empty());
        Ok(())
    }

    #[test]
    fn garbage_filename_is_a_corrupt_segment_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("not-a-segment.txt"), "junk")?;
        assert!(recover(dir.path(), 10).is_err());
        Ok(())
    }

    #[test]
    fn garbage_line_in_a_well_named_segment_is_a_corrupt_segment_error() -> Result<()> {
        use std::io::Write;

        let dir = tempfile::tempdir()?;
        let (segment, mut writer) = Segment::create_persistent(dir.path())?;
        writer.add_entry("k1", "v1")?;
        drop(writer);
        // append a line that isn't a valid single-member JSON object
        std::fs::OpenOptions::new()
            .append(true)
            .open(segment.path())?
            .write_all(b"not json at all\n")?;

        let err = recover(dir.path(), 10).unwrap_err();
        assert!(matches!(err, Error::CorruptSegment { .. }), "expected CorruptSegment, got {err:?}");
        Ok(())
    }
}
