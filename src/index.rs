//! Sparse offset index.
//!
//! Every segment may have a sibling `.index` file holding a sequence of varint
//! pairs `(Δoffset, Δbyte_offset)`. The first pair is relative to the implicit
//! entry `(segment.start_offset, 0)`, which is never stored; every following
//! pair is relative to the one before it. There is no header or trailer, so an
//! increment is a plain append.

use bytes::BufMut;
use log::{debug, warn};
use std::io::{Read, Write};
use std::path::Path;

use crate::codec::FrameReader;
use crate::fs::FileSystem;
use crate::segment::{INDEX_EXTENSION, Segment, list_segments};
use crate::types::{ByteOffset, IoResultExt, LogError, Offset, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: Offset,
    pub byte_offset: ByteOffset,
}

impl IndexEntry {
    pub fn new(offset: Offset, byte_offset: ByteOffset) -> Self {
        Self {
            offset,
            byte_offset,
        }
    }

    /// The entry every segment has without storing it.
    pub fn implicit(segment: Segment) -> Self {
        Self::new(segment.start_offset, 0)
    }
}

/// Encode an unsigned integer as a LEB128 varint
pub fn encode_varint(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode one varint from the front of `buf`, advancing it.
pub fn decode_varint(buf: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let Some((&byte, rest)) = buf.split_first() else {
            return Err(LogError::Parse("varint ends mid-value".to_string()));
        };
        *buf = rest;
        if shift == 63 && byte > 1 {
            return Err(LogError::Parse("varint overflows u64".to_string()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Delta-encode `entries`, continuing from `base`.
pub fn encode_entries(base: IndexEntry, entries: &[IndexEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * 4);
    let mut previous = base;
    for entry in entries {
        encode_varint(&mut buf, entry.offset - previous.offset);
        encode_varint(&mut buf, entry.byte_offset - previous.byte_offset);
        previous = *entry;
    }
    buf
}

/// The decoded index of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentIndex {
    segment: Segment,
    entries: Vec<IndexEntry>,
}

impl SegmentIndex {
    pub fn empty(segment: Segment) -> Self {
        Self {
            segment,
            entries: Vec::new(),
        }
    }

    /// Build an index from absolute entries, which must be strictly increasing.
    pub fn from_entries(segment: Segment, entries: Vec<IndexEntry>) -> Self {
        Self { segment, entries }
    }

    pub fn decode(segment: Segment, mut bytes: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut previous = IndexEntry::implicit(segment);
        while !bytes.is_empty() {
            let delta_offset = decode_varint(&mut bytes)?;
            if bytes.is_empty() {
                return Err(LogError::Parse(format!(
                    "index of segment {} ends after an offset delta",
                    segment.start_offset
                )));
            }
            let delta_bytes = decode_varint(&mut bytes)?;
            if delta_offset == 0 || delta_bytes == 0 {
                return Err(LogError::Parse(format!(
                    "index of segment {} is not strictly increasing after offset {}",
                    segment.start_offset, previous.offset
                )));
            }
            let entry = match (
                previous.offset.checked_add(delta_offset),
                previous.byte_offset.checked_add(delta_bytes),
            ) {
                (Some(offset), Some(byte_offset)) => IndexEntry::new(offset, byte_offset),
                _ => {
                    return Err(LogError::Parse(format!(
                        "index of segment {} overflows after offset {}",
                        segment.start_offset, previous.offset
                    )));
                }
            };
            entries.push(entry);
            previous = entry;
        }
        Ok(Self { segment, entries })
    }

    /// Read the index file of `segment`. A missing file is an empty index.
    pub fn read(fs: &dyn FileSystem, topic_dir: &Path, segment: Segment) -> Result<Self> {
        let path = segment.index_path(topic_dir);
        if !fs.exists(&path) {
            return Ok(Self::empty(segment));
        }
        let mut bytes = Vec::new();
        fs.open_read(&path)
            .and_then(|mut file| file.read_to_end(&mut bytes))
            .ctx(|| format!("failed to read index '{}'", path.display()))?;
        Self::decode(segment, &bytes)
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last stored entry, or the implicit one.
    pub fn last(&self) -> IndexEntry {
        self.entries
            .last()
            .copied()
            .unwrap_or_else(|| IndexEntry::implicit(self.segment))
    }

    /// The stored entry with the greatest offset `<= offset`, falling back to
    /// the implicit start entry. Its byte offset is never past the record of
    /// `offset`.
    pub fn lookup(&self, offset: Offset) -> IndexEntry {
        let idx = self.entries.partition_point(|e| e.offset <= offset);
        if idx == 0 {
            IndexEntry::implicit(self.segment)
        } else {
            self.entries[idx - 1]
        }
    }
}

/// How far the index builder has come.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCursor {
    pub segment: Segment,
    /// Byte offset in the segment to resume scanning from.
    pub scan_from: ByteOffset,
    /// Last entry written for `segment`; the base of the next delta.
    pub last: IndexEntry,
}

impl IndexCursor {
    pub fn start_of(segment: Segment) -> Self {
        Self {
            segment,
            scan_from: 0,
            last: IndexEntry::implicit(segment),
        }
    }

    /// Resume from the newest segment that has an index file. An index file
    /// that does not parse is removed and its segment indexed again.
    pub fn restore(fs: &dyn FileSystem, topic_dir: &Path, log_segments: &[Segment]) -> Result<Option<Self>> {
        let Some(first) = log_segments.first() else {
            return Ok(None);
        };
        let indexed = list_segments(fs, topic_dir, INDEX_EXTENSION)?;
        let Some(segment) = indexed.into_iter().rev().find(|s| log_segments.contains(s)) else {
            return Ok(Some(Self::start_of(*first)));
        };

        match SegmentIndex::read(fs, topic_dir, segment) {
            Ok(index) => {
                let last = index.last();
                Ok(Some(Self {
                    segment,
                    scan_from: last.byte_offset,
                    last,
                }))
            }
            Err(LogError::Parse(reason)) => {
                let path = segment.index_path(topic_dir);
                warn!("discarding unreadable index '{}': {reason}", path.display());
                fs.remove_file(&path)
                    .ctx(|| format!("failed to remove index '{}'", path.display()))?;
                Ok(Some(Self::start_of(segment)))
            }
            Err(e) => Err(e),
        }
    }
}

/// Index everything appended since `cursor`.
///
/// Walks forward through `segments`, recording every record whose offset is a
/// multiple of `one_in_every` (the first record of a segment is implicit).
/// Scanning stops at the last complete frame, so a half-written tail is never
/// indexed. `segments` must be a snapshot taken before the call: a segment is
/// only left behind once a newer one exists, which means it is sealed.
///
/// Returns the number of entries written.
pub fn build_increment(
    fs: &dyn FileSystem,
    topic_dir: &Path,
    segments: &[Segment],
    cursor: &mut IndexCursor,
    one_in_every: u64,
) -> Result<usize> {
    let one_in_every = one_in_every.max(1);
    let mut written = 0;

    loop {
        let segment = cursor.segment;
        let log_path = segment.log_path(topic_dir);
        if !fs.exists(&log_path) {
            break;
        }

        let file = fs
            .open_read(&log_path)
            .ctx(|| format!("failed to open segment '{}' for indexing", log_path.display()))?;
        let mut frames = FrameReader::new(file, cursor.scan_from)?;
        let mut next = *cursor;
        let mut buf = Vec::new();
        let mut failure = None;

        loop {
            match frames.next_frame() {
                Ok(Some((byte_offset, record))) => {
                    if record.offset != segment.start_offset
                        && record.offset % one_in_every == 0
                        && record.offset > next.last.offset
                    {
                        let entry = IndexEntry::new(record.offset, byte_offset);
                        buf.extend(encode_entries(next.last, &[entry]));
                        next.last = entry;
                        written += 1;
                    }
                }
                Ok(None) | Err(LogError::Truncated(_)) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        next.scan_from = frames.position();

        if !buf.is_empty() {
            let index_path = segment.index_path(topic_dir);
            fs.open_append(&index_path)
                .and_then(|mut file| file.write_all(&buf))
                .ctx(|| format!("failed to append to index '{}'", index_path.display()))?;
        }
        *cursor = next;

        if let Some(e) = failure {
            return Err(e);
        }

        match segments.iter().find(|s| s.start_offset > segment.start_offset) {
            Some(newer) => *cursor = IndexCursor::start_of(*newer),
            None => break,
        }
    }

    if written > 0 {
        debug!(
            "indexed {written} entries in '{}', cursor at segment {} byte {}",
            topic_dir.display(),
            cursor.segment.start_offset,
            cursor.scan_from
        );
    }
    Ok(written)
}

/// Drop the entries of `segment`'s index that point at or past
/// `safe_byte_offset`. Used after the segment was truncated by repair.
pub fn truncate_index(
    fs: &dyn FileSystem,
    topic_dir: &Path,
    segment: Segment,
    safe_byte_offset: ByteOffset,
) -> Result<()> {
    let path = segment.index_path(topic_dir);
    if !fs.exists(&path) {
        return Ok(());
    }
    let index = match SegmentIndex::read(fs, topic_dir, segment) {
        Ok(index) => index,
        Err(LogError::Parse(_)) => {
            return fs
                .remove_file(&path)
                .ctx(|| format!("failed to remove index '{}'", path.display()));
        }
        Err(e) => return Err(e),
    };

    let kept: Vec<IndexEntry> = index
        .entries()
        .iter()
        .copied()
        .filter(|e| e.byte_offset < safe_byte_offset)
        .collect();
    if kept.len() == index.len() {
        return Ok(());
    }
    let bytes = encode_entries(IndexEntry::implicit(segment), &kept);
    fs.create(&path)
        .and_then(|mut file| file.write_all(&bytes))
        .ctx(|| format!("failed to rewrite index '{}'", path.display()))
}

/// Remove every index file of a topic, returning how many were removed.
pub fn remove_index_files(fs: &dyn FileSystem, topic_dir: &Path) -> Result<usize> {
    let segments = list_segments(fs, topic_dir, INDEX_EXTENSION)?;
    for segment in &segments {
        let path = segment.index_path(topic_dir);
        fs.remove_file(&path)
            .ctx(|| format!("failed to remove index '{}'", path.display()))?;
    }
    Ok(segments.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::fs::MemoryFs;
    use std::path::PathBuf;

    fn write_records(fs: &MemoryFs, dir: &Path, segment: Segment, offsets: std::ops::Range<u64>) {
        let mut buf = Vec::new();
        for offset in offsets {
            codec::encode_into(&mut buf, offset, format!("record-{offset}").as_bytes());
        }
        fs.open_append(&segment.log_path(dir))
            .unwrap()
            .write_all(&buf)
            .unwrap();
    }

    fn topic_dir(fs: &MemoryFs) -> PathBuf {
        let dir = PathBuf::from("/data/topic");
        fs.create_dir_all(&dir).unwrap();
        dir
    }

    /// Byte position of every record in a segment, by full scan.
    fn positions(fs: &MemoryFs, dir: &Path, segment: Segment) -> Vec<(Offset, ByteOffset)> {
        let file = fs.open_read(&segment.log_path(dir)).unwrap();
        FrameReader::new(file, 0)
            .unwrap()
            .map(|f| f.map(|(pos, r)| (r.offset, pos)).unwrap())
            .collect()
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(&mut buf, value);
            let mut slice = buf.as_slice();
            assert_eq!(decode_varint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_malformed_varint_is_a_parse_error() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(matches!(decode_varint(&mut slice), Err(LogError::Parse(_))));

        let mut slice: &[u8] = &[0xFF; 11];
        assert!(matches!(decode_varint(&mut slice), Err(LogError::Parse(_))));

        // a lone offset delta without its byte delta
        assert!(matches!(
            SegmentIndex::decode(Segment::new(0), &[5]),
            Err(LogError::Parse(_))
        ));
    }

    #[test]
    fn test_lookup_nearest_entry() {
        let entries = (0..10).map(|i| IndexEntry::new(i * 10, i * 100)).collect();
        let index = SegmentIndex::from_entries(Segment::new(0), entries);

        assert_eq!(index.lookup(45).byte_offset, 400);
        assert_eq!(index.lookup(45).offset, 40);
        assert_eq!(index.lookup(1999).byte_offset, 900);
        assert_eq!(index.lookup(3).byte_offset, 0);
        assert_eq!(index.lookup(10).byte_offset, 100);
    }

    #[test]
    fn test_lookup_before_first_entry_is_implicit() {
        let index = SegmentIndex::from_entries(Segment::new(100), vec![IndexEntry::new(110, 230)]);
        assert_eq!(index.lookup(105), IndexEntry::new(100, 0));
        assert_eq!(SegmentIndex::empty(Segment::new(7)).lookup(9), IndexEntry::new(7, 0));
    }

    #[test]
    fn test_encode_decode_entries() {
        let segment = Segment::new(50);
        let entries = vec![IndexEntry::new(60, 200), IndexEntry::new(70, 410)];
        let bytes = encode_entries(IndexEntry::implicit(segment), &entries);
        // deltas (10, 200) and (10, 210)
        assert_eq!(bytes, vec![10, 0xC8, 0x01, 10, 0xD2, 0x01]);
        let index = SegmentIndex::decode(segment, &bytes).unwrap();
        assert_eq!(index.entries(), entries.as_slice());
    }

    #[test]
    fn test_every_record_index_skips_the_first() {
        let fs = MemoryFs::new();
        let dir = topic_dir(&fs);
        let segment = Segment::new(0);
        write_records(&fs, &dir, segment, 0..10);

        let mut cursor = IndexCursor::start_of(segment);
        let written = build_increment(&fs, &dir, &[segment], &mut cursor, 1).unwrap();
        assert_eq!(written, 9);

        let index = SegmentIndex::read(&fs, &dir, segment).unwrap();
        assert_eq!(index.len(), 9);
        let expected: Vec<IndexEntry> = positions(&fs, &dir, segment)[1..]
            .iter()
            .map(|&(o, b)| IndexEntry::new(o, b))
            .collect();
        assert_eq!(index.entries(), expected.as_slice());
    }

    #[test]
    fn test_incremental_build_matches_full_build() {
        let fs = MemoryFs::new();
        let dir = topic_dir(&fs);
        let segment = Segment::new(0);

        let mut cursor = IndexCursor::start_of(segment);
        write_records(&fs, &dir, segment, 0..7);
        build_increment(&fs, &dir, &[segment], &mut cursor, 3).unwrap();
        write_records(&fs, &dir, segment, 7..20);
        build_increment(&fs, &dir, &[segment], &mut cursor, 3).unwrap();
        // nothing new
        assert_eq!(build_increment(&fs, &dir, &[segment], &mut cursor, 3).unwrap(), 0);

        let index = SegmentIndex::read(&fs, &dir, segment).unwrap();
        let offsets: Vec<_> = index.entries().iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![3, 6, 9, 12, 15, 18]);
        let all = positions(&fs, &dir, segment);
        for entry in index.entries() {
            assert!(all.contains(&(entry.offset, entry.byte_offset)));
        }
    }

    #[test]
    fn test_build_stops_at_partial_frame() {
        let fs = MemoryFs::new();
        let dir = topic_dir(&fs);
        let segment = Segment::new(0);
        write_records(&fs, &dir, segment, 0..3);
        let tail = codec::encode(3, b"record-3");
        fs.open_append(&segment.log_path(&dir))
            .unwrap()
            .write_all(&tail[..tail.len() - 2])
            .unwrap();

        let mut cursor = IndexCursor::start_of(segment);
        assert_eq!(build_increment(&fs, &dir, &[segment], &mut cursor, 1).unwrap(), 2);
        let complete = positions_until_partial(&fs, &dir, segment);
        assert_eq!(cursor.scan_from, complete);

        // the writer finishes the frame
        fs.open_append(&segment.log_path(&dir))
            .unwrap()
            .write_all(&tail[tail.len() - 2..])
            .unwrap();
        assert_eq!(build_increment(&fs, &dir, &[segment], &mut cursor, 1).unwrap(), 1);
        assert_eq!(cursor.last.offset, 3);
    }

    fn positions_until_partial(fs: &MemoryFs, dir: &Path, segment: Segment) -> ByteOffset {
        let file = fs.open_read(&segment.log_path(dir)).unwrap();
        let mut frames = FrameReader::new(file, 0).unwrap();
        while let Ok(Some(_)) = frames.next_frame() {}
        frames.position()
    }

    #[test]
    fn test_build_moves_across_sealed_segments() {
        let fs = MemoryFs::new();
        let dir = topic_dir(&fs);
        let first = Segment::new(0);
        let second = Segment::new(5);
        write_records(&fs, &dir, first, 0..5);
        write_records(&fs, &dir, second, 5..9);

        let mut cursor = IndexCursor::start_of(first);
        let written = build_increment(&fs, &dir, &[first, second], &mut cursor, 2).unwrap();
        // 2, 4 in the first segment; 6, 8 in the second
        assert_eq!(written, 4);
        assert_eq!(cursor.segment, second);
        assert_eq!(SegmentIndex::read(&fs, &dir, second).unwrap().entries()[0].offset, 6);
    }

    #[test]
    fn test_cursor_restore_resumes_without_duplicates() {
        let fs = MemoryFs::new();
        let dir = topic_dir(&fs);
        let segment = Segment::new(0);
        write_records(&fs, &dir, segment, 0..6);
        let mut cursor = IndexCursor::start_of(segment);
        build_increment(&fs, &dir, &[segment], &mut cursor, 1).unwrap();

        write_records(&fs, &dir, segment, 6..10);
        let mut restored = IndexCursor::restore(&fs, &dir, &[segment]).unwrap().unwrap();
        assert_eq!(restored.last.offset, 5);
        build_increment(&fs, &dir, &[segment], &mut restored, 1).unwrap();

        let offsets: Vec<_> = SegmentIndex::read(&fs, &dir, segment)
            .unwrap()
            .entries()
            .iter()
            .map(|e| e.offset)
            .collect();
        assert_eq!(offsets, (1..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_cursor_restore_discards_torn_index() {
        let fs = MemoryFs::new();
        let dir = topic_dir(&fs);
        let segment = Segment::new(0);
        write_records(&fs, &dir, segment, 0..3);
        fs.open_append(&segment.index_path(&dir))
            .unwrap()
            .write_all(&[1, 0x80])
            .unwrap();

        let cursor = IndexCursor::restore(&fs, &dir, &[segment]).unwrap().unwrap();
        assert_eq!(cursor, IndexCursor::start_of(segment));
        assert!(!fs.exists(&segment.index_path(&dir)));
    }

    #[test]
    fn test_truncate_index_drops_entries_past_safe_point() {
        let fs = MemoryFs::new();
        let dir = topic_dir(&fs);
        let segment = Segment::new(0);
        write_records(&fs, &dir, segment, 0..10);
        let mut cursor = IndexCursor::start_of(segment);
        build_increment(&fs, &dir, &[segment], &mut cursor, 1).unwrap();

        let safe = positions(&fs, &dir, segment)[4].1;
        truncate_index(&fs, &dir, segment, safe).unwrap();
        let offsets: Vec<_> = SegmentIndex::read(&fs, &dir, segment)
            .unwrap()
            .entries()
            .iter()
            .map(|e| e.offset)
            .collect();
        assert_eq!(offsets, vec![1, 2, 3]);
    }
}
