//! Binary framing of a single log record.
//!
//! ```text
//! offset: u64 LE | checksum: u32 LE | length: u64 LE | payload: length bytes
//! ```
//!
//! The checksum is CRC-32C over `length || payload || offset`.

use crate::types::{ByteOffset, IoResultExt, LogError, LogRecord, Offset, Result};
use std::io::{BufReader, Read, Seek, SeekFrom};

pub const FRAME_OVERHEAD: usize = 8 + 4 + 8;

/// Upper bound on the up-front allocation for one payload; larger payloads
/// grow the buffer as bytes actually arrive.
const PAYLOAD_PREALLOC_LIMIT: u64 = 64 * 1024;

pub fn checksum(offset: Offset, payload: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&(payload.len() as u64).to_le_bytes());
    let crc = crc32c::crc32c_append(crc, payload);
    crc32c::crc32c_append(crc, &offset.to_le_bytes())
}

pub fn encode(offset: Offset, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    encode_into(&mut buf, offset, payload);
    buf
}

/// Append the frame for `(offset, payload)` to `buf`.
pub fn encode_into(buf: &mut Vec<u8>, offset: Offset, payload: &[u8]) {
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&checksum(offset, payload).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
}

/// Decode exactly one frame.
///
/// `Ok(None)` means the reader was exhausted on a frame boundary. A partial
/// frame yields [`LogError::Truncated`], a frame whose checksum does not match
/// yields [`LogError::ChecksumMismatch`].
pub fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Option<LogRecord>> {
    let mut header = [0u8; FRAME_OVERHEAD];
    let read = read_full(reader, &mut header).ctx(|| "failed to read record header")?;
    if read == 0 {
        return Ok(None);
    }
    if read < FRAME_OVERHEAD {
        return Err(LogError::Truncated(format!(
            "record header has {read} of {FRAME_OVERHEAD} bytes"
        )));
    }

    let offset = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
    let stored = u32::from_le_bytes(header[8..12].try_into().unwrap_or_default());
    let len = u64::from_le_bytes(header[12..20].try_into().unwrap_or_default());

    let mut payload = Vec::with_capacity(len.min(PAYLOAD_PREALLOC_LIMIT) as usize);
    reader
        .take(len)
        .read_to_end(&mut payload)
        .ctx(|| format!("failed to read payload of record {offset}"))?;
    if (payload.len() as u64) < len {
        return Err(LogError::Truncated(format!(
            "record {offset} has {} of {len} payload bytes",
            payload.len()
        )));
    }

    let computed = checksum(offset, &payload);
    if computed != stored {
        return Err(LogError::ChecksumMismatch {
            offset,
            stored,
            computed,
        });
    }
    Ok(Some(LogRecord { offset, payload }))
}

/// Like `read_exact`, but reports how many bytes were available instead of
/// failing on a short read.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Sequential frame decoder that knows the byte position of every frame.
///
/// After a failed decode the underlying reader is moved back to the start of
/// the failed frame, so a partially written tail can be retried once more
/// bytes have been appended.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    position: ByteOffset,
    fused: bool,
}

impl<R: Read + Seek> FrameReader<R> {
    pub fn new(inner: R, start: ByteOffset) -> Result<Self> {
        let mut inner = BufReader::new(inner);
        inner
            .seek(SeekFrom::Start(start))
            .ctx(|| format!("failed to seek to byte offset {start}"))?;
        Ok(Self {
            inner,
            position: start,
            fused: false,
        })
    }

    /// Byte offset of the next frame to decode.
    pub fn position(&self) -> ByteOffset {
        self.position
    }

    /// Decode the next frame and return it with its starting byte offset.
    pub fn next_frame(&mut self) -> Result<Option<(ByteOffset, LogRecord)>> {
        let start = self.position;
        match decode(&mut self.inner) {
            Ok(Some(record)) => {
                self.position += record.frame_len();
                Ok(Some((start, record)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.inner
                    .seek(SeekFrom::Start(start))
                    .ctx(|| format!("failed to seek back to byte offset {start}"))?;
                Err(e)
            }
        }
    }
}

impl<R: Read + Seek> Iterator for FrameReader<R> {
    type Item = Result<(ByteOffset, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.fused = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_layout() {
        let frame = encode(7, b"dummy1");
        assert_eq!(frame.len(), FRAME_OVERHEAD + 6);
        assert_eq!(&frame[0..8], &7u64.to_le_bytes());
        assert_eq!(&frame[8..12], &checksum(7, b"dummy1").to_le_bytes());
        assert_eq!(&frame[12..20], &6u64.to_le_bytes());
        assert_eq!(&frame[20..], b"dummy1");
    }

    #[test]
    fn test_checksum_covers_length_payload_offset() {
        let mut input = Vec::new();
        input.extend_from_slice(&3u64.to_le_bytes());
        input.extend_from_slice(b"abc");
        input.extend_from_slice(&9u64.to_le_bytes());
        assert_eq!(checksum(9, b"abc"), crc32c::crc32c(&input));
        assert_ne!(checksum(9, b"abc"), checksum(10, b"abc"));
    }

    #[test]
    fn test_decode_round_trip() {
        for (offset, payload) in [(0u64, Vec::new()), (1, b"x".to_vec()), (u64::MAX, vec![7; 5000])] {
            let frame = encode(offset, &payload);
            let record = decode(&mut Cursor::new(frame)).unwrap().unwrap();
            assert_eq!(record, LogRecord::new(offset, payload));
        }
    }

    #[test]
    fn test_decode_end_of_log() {
        assert!(decode(&mut Cursor::new(Vec::<u8>::new())).unwrap().is_none());
    }

    #[test]
    fn test_decode_truncated_header_and_payload() {
        let frame = encode(1, b"payload");
        let err = decode(&mut Cursor::new(frame[..10].to_vec())).unwrap_err();
        assert!(matches!(err, LogError::Truncated(_)));

        let err = decode(&mut Cursor::new(frame[..frame.len() - 1].to_vec())).unwrap_err();
        assert!(matches!(err, LogError::Truncated(_)));
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let mut frame = encode(4, b"payload");
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let err = decode(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, LogError::ChecksumMismatch { offset: 4, .. }));
    }

    #[test]
    fn test_frame_reader_positions_and_retry() {
        let mut bytes = encode(0, b"one");
        bytes.extend(encode(1, b"two"));
        let full = encode(2, b"three");
        bytes.extend_from_slice(&full[..5]);

        let mut reader = FrameReader::new(Cursor::new(bytes.clone()), 0).unwrap();
        let (pos, rec) = reader.next_frame().unwrap().unwrap();
        assert_eq!((pos, rec.offset), (0, 0));
        let (pos, rec) = reader.next_frame().unwrap().unwrap();
        assert_eq!((pos, rec.offset), (23, 1));
        assert!(matches!(reader.next_frame(), Err(LogError::Truncated(_))));
        assert_eq!(reader.position(), 46);

        let mut reader = FrameReader::new(Cursor::new(bytes), 23).unwrap();
        let (pos, rec) = reader.next_frame().unwrap().unwrap();
        assert_eq!((pos, rec.payload.as_slice()), (23, &b"two"[..]));
    }
}
