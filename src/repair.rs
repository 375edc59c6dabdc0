//! Detection and repair of torn or corrupted segment tails.
//!
//! A segment is valid when its frames decode back to back, every checksum
//! matches, and offsets rise by exactly one starting from the offset in the
//! file name. Repair keeps the verified prefix and sets the rest aside in a
//! `.corrupt` sibling, which is never deleted automatically.

use log::{info, warn};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::codec::FrameReader;
use crate::fs::FileSystem;
use crate::index::truncate_index;
use crate::segment::{CORRUPT_EXTENSION, LOG_EXTENSION, Segment, parse_segment_filename};
use crate::types::{ByteOffset, IoResultExt, LogError, Offset, Result, SegmentCheck, SegmentInfo};

/// What a verification pass found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    /// End of the last record that passed every check.
    pub safe_byte_offset: ByteOffset,
    pub first_offset: Option<Offset>,
    pub last_offset: Option<Offset>,
    pub records: u64,
    /// Offset of the first record that failed a check.
    pub corrupt_at: Option<Offset>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt_at.is_none()
    }
}

fn scan(fs: &dyn FileSystem, path: &Path) -> Result<VerifyReport> {
    let expected_first = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| parse_segment_filename(n, LOG_EXTENSION));
    let file = fs
        .open_read(path)
        .ctx(|| format!("failed to open segment '{}' for verification", path.display()))?;
    let mut frames = FrameReader::new(file, 0)?;

    let mut report = VerifyReport {
        safe_byte_offset: 0,
        first_offset: None,
        last_offset: None,
        records: 0,
        corrupt_at: None,
    };
    loop {
        let expected = match report.last_offset {
            Some(previous) => Some(previous + 1),
            None => expected_first,
        };
        match frames.next_frame() {
            Ok(None) => return Ok(report),
            Ok(Some((_, record))) => {
                if expected.is_some_and(|e| e != record.offset) {
                    report.corrupt_at = expected;
                    return Ok(report);
                }
                report.first_offset.get_or_insert(record.offset);
                report.last_offset = Some(record.offset);
                report.records += 1;
                report.safe_byte_offset = frames.position();
            }
            Err(LogError::Truncated(_)) | Err(LogError::ChecksumMismatch { .. }) => {
                report.corrupt_at = Some(expected.unwrap_or(0));
                return Ok(report);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Verify a segment file from its first byte.
///
/// Returns the safe byte offset (the end of the last good record), or
/// [`LogError::CorruptionDetected`] naming the first bad offset and the safe
/// byte offset to truncate to.
pub fn verify(fs: &dyn FileSystem, path: &Path) -> Result<ByteOffset> {
    let report = scan(fs, path)?;
    match report.corrupt_at {
        None => Ok(report.safe_byte_offset),
        Some(offset) => Err(LogError::CorruptionDetected {
            offset,
            safe_byte_offset: report.safe_byte_offset,
        }),
    }
}

fn corrupt_sibling(fs: &dyn FileSystem, path: &Path) -> PathBuf {
    let first = path.with_extension(CORRUPT_EXTENSION);
    if !fs.exists(&first) {
        return first;
    }
    (1u32..)
        .map(|n| path.with_extension(format!("{CORRUPT_EXTENSION}.{n}")))
        .find(|p| !fs.exists(p))
        .unwrap_or(first)
}

/// Keep bytes `[0, safe_byte_offset)` of the segment at `path`.
///
/// The original file is renamed to a `.corrupt` sibling and the verified
/// prefix copied back into a fresh file at `path`.
pub fn repair(fs: &dyn FileSystem, path: &Path, safe_byte_offset: ByteOffset) -> Result<PathBuf> {
    let corrupt = corrupt_sibling(fs, path);
    fs.rename(path, &corrupt).ctx(|| {
        format!(
            "failed to move '{}' to '{}'",
            path.display(),
            corrupt.display()
        )
    })?;

    let source = fs
        .open_read(&corrupt)
        .ctx(|| format!("failed to open '{}'", corrupt.display()))?;
    let mut target = fs
        .create(path)
        .ctx(|| format!("failed to create '{}'", path.display()))?;
    let copied = std::io::copy(&mut source.take(safe_byte_offset), &mut target)
        .ctx(|| format!("failed to copy verified prefix into '{}'", path.display()))?;
    if copied != safe_byte_offset {
        return Err(LogError::Truncated(format!(
            "'{}' holds only {copied} of {safe_byte_offset} verified bytes",
            corrupt.display()
        )));
    }
    target
        .sync_data()
        .ctx(|| format!("failed to sync '{}'", path.display()))?;

    info!(
        "repaired '{}' at byte offset {safe_byte_offset}, corrupt copy kept at '{}'",
        path.display(),
        corrupt.display()
    );
    Ok(corrupt)
}

/// Verify one segment of a topic and, unless `read_only`, repair it. The
/// segment's index is trimmed to the repaired length as well.
pub fn check_segment(
    fs: &dyn FileSystem,
    topic_dir: &Path,
    segment: Segment,
    read_only: bool,
) -> Result<(VerifyReport, SegmentCheck)> {
    let path = segment.log_path(topic_dir);
    let report = scan(fs, &path)?;
    let mut check = SegmentCheck {
        start_offset: segment.start_offset,
        safe_byte_offset: report.safe_byte_offset,
        corrupt_at: report.corrupt_at,
        repaired: false,
    };

    if let Some(offset) = report.corrupt_at {
        warn!(
            "corruption detected in '{}' at offset {offset}, safe byte offset {}",
            path.display(),
            report.safe_byte_offset
        );
        if read_only {
            warn!("read only mode, leaving '{}' untouched", path.display());
        } else {
            repair(fs, &path, report.safe_byte_offset)?;
            truncate_index(fs, topic_dir, segment, report.safe_byte_offset)?;
            check.repaired = true;
        }
    }
    Ok((report, check))
}

/// Validated summary of one segment file.
pub fn inspect_segment(fs: &dyn FileSystem, path: &Path) -> Result<SegmentInfo> {
    let report = scan(fs, path)?;
    if let Some(offset) = report.corrupt_at {
        return Err(LogError::CorruptionDetected {
            offset,
            safe_byte_offset: report.safe_byte_offset,
        });
    }
    let size_bytes = fs
        .file_size(path)
        .ctx(|| format!("failed to stat '{}'", path.display()))?;
    let start_offset = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| parse_segment_filename(n, LOG_EXTENSION))
        .or(report.first_offset)
        .unwrap_or(0);
    Ok(SegmentInfo {
        start_offset,
        first_offset: report.first_offset,
        last_offset: report.last_offset,
        records: report.records,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::fs::MemoryFs;
    use crate::types::LogRecord;
    use std::io::Write;

    fn segment_with(fs: &MemoryFs, start: Offset, count: u64) -> PathBuf {
        let dir = PathBuf::from("/data/topic");
        fs.create_dir_all(&dir).unwrap();
        let path = Segment::new(start).log_path(&dir);
        let mut buf = Vec::new();
        for offset in start..start + count {
            codec::encode_into(&mut buf, offset, format!("dummy{offset}").as_bytes());
        }
        fs.open_append(&path).unwrap().write_all(&buf).unwrap();
        path
    }

    fn read_all(fs: &MemoryFs, path: &Path) -> Vec<LogRecord> {
        FrameReader::new(fs.open_read(path).unwrap(), 0)
            .unwrap()
            .map(|f| f.unwrap().1)
            .collect()
    }

    fn overwrite_byte(fs: &MemoryFs, path: &Path, at: usize) {
        let mut bytes = Vec::new();
        fs.open_read(path).unwrap().read_to_end(&mut bytes).unwrap();
        bytes[at] ^= 0xFF;
        fs.create(path).unwrap().write_all(&bytes).unwrap();
    }

    #[test]
    fn test_clean_segment_verifies_to_its_size() {
        let fs = MemoryFs::new();
        let path = segment_with(&fs, 0, 3);
        assert_eq!(verify(&fs, &path).unwrap(), 78);

        let info = inspect_segment(&fs, &path).unwrap();
        assert_eq!(info.last_offset, Some(2));
        assert_eq!(info.size_bytes, 78);
        assert_eq!(info.records, 3);
    }

    #[test]
    fn test_truncated_tail_is_detected() {
        let fs = MemoryFs::new();
        let path = segment_with(&fs, 0, 3);
        fs.open_append(&path).unwrap().write_all(&[1, 2, 3]).unwrap();

        match verify(&fs, &path) {
            Err(LogError::CorruptionDetected {
                offset,
                safe_byte_offset,
            }) => {
                assert_eq!(offset, 3);
                assert_eq!(safe_byte_offset, 78);
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_offset_gap_is_detected() {
        let fs = MemoryFs::new();
        let path = segment_with(&fs, 0, 2);
        fs.open_append(&path)
            .unwrap()
            .write_all(&codec::encode(5, b"dummy5"))
            .unwrap();

        let err = verify(&fs, &path).unwrap_err();
        assert!(matches!(
            err,
            LogError::CorruptionDetected {
                offset: 2,
                safe_byte_offset: 52
            }
        ));
    }

    #[test]
    fn test_first_record_must_match_file_name() {
        let fs = MemoryFs::new();
        let path = segment_with(&fs, 10, 2);
        let wrong = path.with_file_name(crate::segment::segment_filename(9, LOG_EXTENSION));
        fs.rename(&path, &wrong).unwrap();

        let err = verify(&fs, &wrong).unwrap_err();
        assert!(matches!(
            err,
            LogError::CorruptionDetected {
                offset: 9,
                safe_byte_offset: 0
            }
        ));
    }

    #[test]
    fn test_repair_is_idempotent_and_keeps_prefix() {
        let fs = MemoryFs::new();
        let path = segment_with(&fs, 0, 5);
        let before = read_all(&fs, &path);
        // corrupt a payload byte of record 3 (each frame is 26 bytes)
        overwrite_byte(&fs, &path, 3 * 26 + 21);

        let safe = match verify(&fs, &path) {
            Err(LogError::CorruptionDetected {
                safe_byte_offset, ..
            }) => safe_byte_offset,
            other => panic!("expected corruption, got {other:?}"),
        };
        assert_eq!(safe, 78);

        let corrupt = repair(&fs, &path, safe).unwrap();
        assert!(fs.exists(&corrupt));
        assert_eq!(fs.file_size(&corrupt).unwrap(), 130);
        assert_eq!(verify(&fs, &path).unwrap(), 78);
        assert_eq!(read_all(&fs, &path), before[..3].to_vec());
    }

    #[test]
    fn test_check_segment_respects_read_only() {
        let fs = MemoryFs::new();
        let path = segment_with(&fs, 0, 4);
        overwrite_byte(&fs, &path, 2 * 26 + 9);
        let dir = PathBuf::from("/data/topic");

        let (report, check) = check_segment(&fs, &dir, Segment::new(0), true).unwrap();
        assert_eq!(report.corrupt_at, Some(2));
        assert!(!check.repaired);
        assert_eq!(fs.file_size(&path).unwrap(), 104);

        let (_, check) = check_segment(&fs, &dir, Segment::new(0), false).unwrap();
        assert!(check.repaired);
        assert_eq!(fs.file_size(&path).unwrap(), 52);

        // a second repair keeps the first corrupt copy
        overwrite_byte(&fs, &path, 30);
        check_segment(&fs, &dir, Segment::new(0), false).unwrap();
        assert!(fs.exists(&path.with_extension("corrupt")));
        assert!(fs.exists(&path.with_extension("corrupt.1")));
    }
}
