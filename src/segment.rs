use log::debug;
use std::path::{Path, PathBuf};

use crate::fs::FileSystem;
use crate::types::{IoResultExt, LogError, Offset, Result};

pub const LOG_EXTENSION: &str = "log";
pub const INDEX_EXTENSION: &str = "index";
pub const CORRUPT_EXTENSION: &str = "corrupt";

/// Generate a segment filename, e.g. `00000000000000000042.log`
pub fn segment_filename(start_offset: Offset, extension: &str) -> String {
    format!("{start_offset:020}.{extension}")
}

/// Parse the start offset out of a segment filename with the given extension.
pub fn parse_segment_filename(name: &str, extension: &str) -> Option<Offset> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// A segment is identified by the offset of its first record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    pub start_offset: Offset,
}

impl Segment {
    pub fn new(start_offset: Offset) -> Self {
        Self { start_offset }
    }

    pub fn log_path(&self, topic_dir: &Path) -> PathBuf {
        topic_dir.join(segment_filename(self.start_offset, LOG_EXTENSION))
    }

    pub fn index_path(&self, topic_dir: &Path) -> PathBuf {
        topic_dir.join(segment_filename(self.start_offset, INDEX_EXTENSION))
    }

    pub fn corrupt_path(&self, topic_dir: &Path) -> PathBuf {
        topic_dir.join(segment_filename(self.start_offset, CORRUPT_EXTENSION))
    }
}

/// List the segments in `topic_dir` that have a file with `extension`,
/// ordered by start offset ascending.
pub fn list_segments(fs: &dyn FileSystem, topic_dir: &Path, extension: &str) -> Result<Vec<Segment>> {
    let names = fs
        .list_dir(topic_dir)
        .ctx(|| format!("failed to list segments in '{}'", topic_dir.display()))?;
    let mut segments: Vec<Segment> = names
        .iter()
        .filter_map(|name| parse_segment_filename(name, extension))
        .map(Segment::new)
        .collect();
    segments.sort();
    Ok(segments)
}

/// Ordered segment list of one topic plus the size of its head segment.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    topic_dir: PathBuf,
    segments: Vec<Segment>,
    head_size: u64,
    max_segment_size: u64,
}

impl SegmentStore {
    pub fn new(topic_dir: PathBuf, max_segment_size: u64) -> Self {
        Self {
            topic_dir,
            segments: Vec::new(),
            head_size: 0,
            max_segment_size,
        }
    }

    /// Discover the `.log` segments of a topic. The head size is left at 0;
    /// the caller sets it once the head has been verified.
    pub fn load(fs: &dyn FileSystem, topic_dir: PathBuf, max_segment_size: u64) -> Result<Self> {
        let segments = list_segments(fs, &topic_dir, LOG_EXTENSION)?;
        debug!(
            "loaded {} segment(s) from '{}'",
            segments.len(),
            topic_dir.display()
        );
        Ok(Self {
            topic_dir,
            segments,
            head_size: 0,
            max_segment_size,
        })
    }

    pub fn topic_dir(&self) -> &Path {
        &self.topic_dir
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn head(&self) -> Result<Segment> {
        self.segments.last().copied().ok_or_else(|| {
            LogError::NotFound(format!("no segments in '{}'", self.topic_dir.display()))
        })
    }

    pub fn head_size(&self) -> u64 {
        self.head_size
    }

    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    pub(crate) fn set_head_size(&mut self, size: u64) {
        self.head_size = size;
    }

    /// Return the head segment, creating the descriptor for an empty topic.
    pub(crate) fn ensure_head(&mut self, next_offset: Offset) -> Segment {
        if let Some(head) = self.segments.last() {
            return *head;
        }
        let head = Segment::new(next_offset);
        self.segments.push(head);
        self.head_size = 0;
        head
    }

    /// Account for `bytes` appended to the head. Returns true when the head
    /// has outgrown the configured maximum and should be rotated.
    pub(crate) fn record_append(&mut self, bytes: u64) -> bool {
        self.head_size += bytes;
        self.head_size > self.max_segment_size
    }

    /// Start a new head segment at `next_offset`.
    pub(crate) fn rotate(&mut self, next_offset: Offset) -> Segment {
        if let Some(head) = self.segments.last()
            && head.start_offset >= next_offset
        {
            return *head;
        }
        let head = Segment::new(next_offset);
        self.segments.push(head);
        self.head_size = 0;
        head
    }

    /// The segment holding `offset`: the one with the greatest start offset
    /// that is `<= offset`.
    pub fn containing_offset(&self, offset: Offset, next_offset: Offset) -> Result<Segment> {
        if offset >= next_offset {
            return Err(LogError::OutOfBounds {
                requested: offset,
                next_offset,
            });
        }
        self.segments
            .iter()
            .rev()
            .find(|s| s.start_offset <= offset)
            .copied()
            .ok_or_else(|| {
                LogError::NotFound(format!(
                    "no segment in '{}' contains offset {offset}",
                    self.topic_dir.display()
                ))
            })
    }

    pub fn next_after(&self, segment: Segment) -> Option<Segment> {
        self.segments
            .iter()
            .find(|s| s.start_offset > segment.start_offset)
            .copied()
    }

    pub fn is_head(&self, segment: Segment) -> bool {
        self.segments.last() == Some(&segment)
    }
}
