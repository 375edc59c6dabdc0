use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::reader::BatchStream;

/// Per-topic record sequence number.
pub type Offset = u64;

/// Byte position local to one segment file.
pub type ByteOffset = u64;

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("offset {requested} is out of bounds, next offset is {next_offset}")]
    OutOfBounds { requested: Offset, next_offset: Offset },
    #[error("corruption detected at offset {offset}, last safe byte offset is {safe_byte_offset}")]
    CorruptionDetected {
        offset: Offset,
        safe_byte_offset: ByteOffset,
    },
    #[error("checksum mismatch at offset {offset}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        offset: Offset,
        stored: u32,
        computed: u32,
    },
    #[error("truncated frame: {0}")]
    Truncated(String),
    #[error("index parse error: {0}")]
    Parse(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid topic name: '{0}'")]
    InvalidTopicName(String),
    #[error("log is in read only mode and will not accept changes")]
    ReadOnly,
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub(crate) trait IoResultExt<T> {
    fn ctx<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn ctx<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| LogError::Io {
            context: context().into(),
            source,
        })
    }
}

/// One decoded log record. The checksum is verified on decode and is
/// therefore not carried around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub offset: Offset,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn new(offset: Offset, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            payload: payload.into(),
        }
    }

    /// Size of this record on disk, header included.
    pub fn frame_len(&self) -> u64 {
        crate::codec::FRAME_OVERHEAD as u64 + self.payload.len() as u64
    }
}

/// A batch of records handed to a reader in one step.
pub type RecordBatch = Vec<LogRecord>;

/// How long a read keeps going once it has caught up with the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Stop when everything durable at call time has been delivered.
    Bounded,
    /// Keep polling for new records until `ttl` elapses or the read is cancelled.
    Following { ttl: Duration },
}

impl ReadMode {
    pub fn from_flags(stop_on_completion: bool, ttl: Duration) -> Self {
        if stop_on_completion {
            ReadMode::Bounded
        } else {
            ReadMode::Following { ttl }
        }
    }
}

/// Result of a batched append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub first_offset: Offset,
    pub records_written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStatus {
    pub topic: String,
    pub segment_count: usize,
    /// Offset of the newest record, `None` while the topic is empty.
    pub head_offset: Option<Offset>,
    pub next_offset: Offset,
    pub max_segment_size: u64,
    pub path: String,
}

/// Summary of a single segment file, as produced by a full validated scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub start_offset: Offset,
    pub first_offset: Option<Offset>,
    pub last_offset: Option<Offset>,
    pub records: u64,
    pub size_bytes: u64,
}

/// Outcome of verifying one segment during a maintenance pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCheck {
    pub start_offset: Offset,
    pub safe_byte_offset: ByteOffset,
    /// Offset at which corruption was found, if any.
    pub corrupt_at: Option<Offset>,
    pub repaired: bool,
}

#[async_trait::async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_topic(&self, topic: &str) -> Result<bool>;
    async fn drop_topic(&self, topic: &str) -> Result<bool>;
    async fn list_topics(&self) -> Vec<String>;
    async fn status(&self) -> Vec<TopicStatus>;
}

#[async_trait::async_trait]
pub trait LogWriter: Send + Sync {
    /// Append `payloads` in order. Either the whole batch is acknowledged or an
    /// error is returned.
    async fn write_batch(&self, topic: &str, payloads: &[Vec<u8>]) -> Result<usize>;
}

#[async_trait::async_trait]
pub trait LogReader: Send + Sync {
    /// Stream record batches starting at `from_offset` (inclusive).
    async fn read_batches(
        &self,
        topic: &str,
        from_offset: Offset,
        batch_size: usize,
        stop_on_completion: bool,
        ttl: Duration,
    ) -> Result<BatchStream>;
}

#[async_trait::async_trait]
pub trait LogEngine: TopicAdmin + LogWriter + LogReader + Send + Sync {}
impl<E> LogEngine for E where E: TopicAdmin + LogWriter + LogReader + Send + Sync {}
