//! The k-way merge that underlies compaction: given N segments, produce a
//! single key-ascending, duplicate-free stream where each key's value comes
//! from whichever contributing segment has the newest timestamp, then
//! re-chunk that stream into fresh size-bounded segments.

use std::cmp::Ordering;
use std::path::Path;

use binary_heap_plus::{BinaryHeap, MinComparator};

use crate::error::Result;
use crate::record::Record;
use crate::segment::{Segment, SegmentReader, SegmentWriter};

struct HeapItem {
    record: Record,
    timestamp: f64,
    segment_index: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.record.key == other.record.key && self.timestamp == other.timestamp
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders by key ascending, then by timestamp descending: for a tied key,
/// the entry from the newest segment is the "smallest" and therefore the
/// first one a min-heap pops.
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.record
            .key
            .cmp(&other.record.key)
            .then_with(|| other.timestamp.partial_cmp(&self.timestamp).unwrap_or(Ordering::Equal))
    }
}

fn new_output_segment(persist: bool, base_dir: Option<&Path>) -> Result<(Segment, SegmentWriter)> {
    match (persist, base_dir) {
        (true, Some(dir)) => Segment::create_persistent(dir),
        _ => Segment::create_temp(),
    }
}

/// Merges `segments` into a new, size-bounded set of segments and deletes
/// the inputs once every record has been read out of them.
///
/// `on_write(output_segment_index, offset, key)` is invoked for every
/// record written to the output, in order, so a caller can build a sparse
/// index over the result without a second pass.
pub fn merge(
    segments: Vec<Segment>,
    segment_size: usize,
    persist: bool,
    base_dir: Option<&Path>,
    mut on_write: impl FnMut(usize, u64, &str),
) -> Result<Vec<Segment>> {
    let timestamps: Vec<f64> = segments.iter().map(Segment::timestamp).collect();
    let mut readers: Vec<SegmentReader> = segments
        .iter()
        .map(Segment::open_reader)
        .collect::<Result<_>>()?;

    let mut heap: BinaryHeap<HeapItem, MinComparator> = BinaryHeap::new_min();
    for (segment_index, reader) in readers.iter_mut().enumerate() {
        if let Some(record) = reader.read_entry()? {
            heap.push(HeapItem {
                record,
                timestamp: timestamps[segment_index],
                segment_index,
            });
        }
    }

    let mut output = Vec::new();
    let mut previous_key: Option<String> = None;
    let (mut current_segment, mut current_writer) = new_output_segment(persist, base_dir)?;

    while let Some(HeapItem { record, segment_index, .. }) = heap.pop() {
        if let Some(next) = readers[segment_index].read_entry()? {
            heap.push(HeapItem {
                record: next,
                timestamp: timestamps[segment_index],
                segment_index,
            });
        }

        if previous_key.as_deref() == Some(record.key.as_str()) {
            // an older version of a key we already emitted from a newer segment
            continue;
        }
        previous_key = Some(record.key.clone());

        if current_writer.len() == segment_size {
            output.push(current_segment);
            let (seg, w) = new_output_segment(persist, base_dir)?;
            current_segment = seg;
            current_writer = w;
        }
        let offset = current_writer.add_entry(&record.key, &record.value)?;
        on_write(output.len(), offset, &record.key);
    }
    if !current_writer.is_empty() {
        output.push(current_segment);
    }

    drop(readers);
    for segment in segments {
        segment.delete()?;
    }

    Ok(output)
}
