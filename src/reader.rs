use crate::{
    codec::FrameReader,
    segment::Segment,
    topic::Topic,
    types::{ByteOffset, IoResultExt, LogError, LogRecord, Offset, ReadMode, RecordBatch, Result},
};
use log::debug;
use std::mem;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A lazily produced sequence of record batches.
///
/// A background task decodes one batch ahead of the consumer. An error is
/// always the last item of the stream. Dropping the stream cancels the read.
pub struct BatchStream {
    rx: mpsc::Receiver<Result<RecordBatch>>,
    cancel: CancellationToken,
}

impl BatchStream {
    /// The next batch, or `None` once the read has finished.
    pub async fn next_batch(&mut self) -> Option<Result<RecordBatch>> {
        self.rx.recv().await
    }

    /// Stop the read. Records decoded so far are still delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream into a flat list of records, stopping at the first error.
    pub async fn collect_records(mut self) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        while let Some(batch) = self.next_batch().await {
            records.extend(batch?);
        }
        Ok(records)
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Topic {
    /// Stream records starting at `from_offset` (inclusive).
    ///
    /// A bounded read ends once every record written before the call has been
    /// delivered. A following read keeps polling for new records until its
    /// TTL runs out or `cancel` fires.
    pub async fn read(
        self: &Arc<Self>,
        from_offset: Offset,
        batch_size: usize,
        mode: ReadMode,
        cancel: CancellationToken,
    ) -> Result<BatchStream> {
        let end = self.next_offset();
        if from_offset >= end {
            return Err(LogError::OutOfBounds {
                requested: from_offset,
                next_offset: end,
            });
        }
        let segment = self.segments().containing_offset(from_offset, end)?;
        let position = self.lookup(segment, from_offset);
        debug!(
            "reading topic '{}' from offset {from_offset}: segment {} byte {position}",
            self.name(),
            segment.start_offset
        );

        let deadline = match mode {
            ReadMode::Bounded => None,
            ReadMode::Following { ttl } => Instant::now().checked_add(ttl),
        };
        let (tx, rx) = mpsc::channel(1);
        let task = ReadTask {
            topic: Arc::clone(self),
            runtime: Handle::current(),
            offsets: self.subscribe(),
            expected: from_offset,
            seeking: true,
            batch_size: batch_size.max(1),
            byte_cap: self.config.batch_byte_cap.max(1),
            mode,
            end,
            deadline,
            cancel: cancel.clone(),
            tx,
            batch: Vec::new(),
            batch_bytes: 0,
        };
        tokio::task::spawn_blocking(move || task.run(segment, position));

        Ok(BatchStream { rx, cancel })
    }
}

struct ReadTask {
    topic: Arc<Topic>,
    runtime: Handle,
    offsets: watch::Receiver<Offset>,
    /// Offset of the next record to deliver.
    expected: Offset,
    /// True until the first record is delivered; records before
    /// `expected` are skipped only while seeking from the index position.
    seeking: bool,
    batch_size: usize,
    byte_cap: usize,
    mode: ReadMode,
    /// Next offset when the read started.
    end: Offset,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<RecordBatch>>,
    batch: RecordBatch,
    batch_bytes: usize,
}

impl ReadTask {
    fn run(mut self, segment: Segment, position: ByteOffset) {
        let outcome = self.scan(segment, position);
        if self.flush()
            && let Err(e) = outcome
        {
            let _ = self.tx.blocking_send(Err(e));
        }
    }

    fn scan(&mut self, mut segment: Segment, mut position: ByteOffset) -> Result<()> {
        let fs = Arc::clone(&self.topic.fs);
        let dir = self.topic.dir().to_path_buf();

        'open: loop {
            let path = segment.log_path(&dir);
            let generation = self.topic.generation();
            let file = fs
                .open_read(&path)
                .ctx(|| format!("failed to open segment '{}' for reading", path.display()))?;
            let mut frames = FrameReader::new(file, position)?;

            loop {
                // Only acknowledged records are read. Anything past the
                // published offset may still be cut by a failed append.
                if self.expected >= self.topic.next_offset() {
                    match self.mode {
                        ReadMode::Bounded => return Ok(()),
                        ReadMode::Following { .. } => {
                            if !self.flush() || !self.wait_for_records()? {
                                return Ok(());
                            }
                            position = frames.position();
                            continue 'open;
                        }
                    }
                }
                if self.topic.generation() != generation {
                    debug!(
                        "segment {} of topic '{}' was cut, reopening at byte {}",
                        segment.start_offset,
                        self.topic.name(),
                        frames.position()
                    );
                    position = frames.position();
                    continue 'open;
                }

                match frames.next_frame() {
                    Ok(Some((byte_offset, record))) => {
                        if self.seeking && record.offset < self.expected {
                            continue;
                        }
                        self.seeking = false;
                        if record.offset != self.expected {
                            return Err(LogError::CorruptionDetected {
                                offset: self.expected,
                                safe_byte_offset: byte_offset,
                            });
                        }
                        self.expected += 1;
                        if !self.push(record) {
                            return Ok(());
                        }
                        if self.mode == ReadMode::Bounded && self.expected >= self.end {
                            return Ok(());
                        }
                    }
                    Ok(None) | Err(LogError::Truncated(_)) => {
                        // `expected` is acknowledged, so it must live in a
                        // later segment or this one is damaged.
                        let newer = self.topic.segments().next_after(segment);
                        match newer {
                            Some(next)
                                if self.expected >= next.start_offset
                                    && fs.exists(&next.log_path(&dir)) =>
                            {
                                debug!(
                                    "topic '{}' read moves from segment {} to {}",
                                    self.topic.name(),
                                    segment.start_offset,
                                    next.start_offset
                                );
                                segment = next;
                                position = 0;
                                self.seeking = false;
                                continue 'open;
                            }
                            _ => {
                                return Err(LogError::CorruptionDetected {
                                    offset: self.expected,
                                    safe_byte_offset: frames.position(),
                                });
                            }
                        }
                    }
                    Err(LogError::ChecksumMismatch { .. }) => {
                        return Err(LogError::CorruptionDetected {
                            offset: self.expected,
                            safe_byte_offset: frames.position(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Add a record to the pending batch, flushing it once full. Returns false
    /// when the read should stop.
    fn push(&mut self, record: LogRecord) -> bool {
        self.batch_bytes += record.payload.len();
        self.batch.push(record);
        if self.batch.len() >= self.batch_size || self.batch_bytes >= self.byte_cap {
            return self.flush() && !self.cancel.is_cancelled();
        }
        true
    }

    /// Hand the pending batch to the consumer. False once the consumer is gone.
    fn flush(&mut self) -> bool {
        if self.batch.is_empty() {
            return true;
        }
        self.batch_bytes = 0;
        let batch = mem::take(&mut self.batch);
        self.tx.blocking_send(Ok(batch)).is_ok()
    }

    /// Wait until the writer has moved past `expected`. Returns false when
    /// the read was cancelled or its TTL ran out.
    fn wait_for_records(&mut self) -> Result<bool> {
        let poll = self.topic.config.poll_interval();
        loop {
            if self.cancel.is_cancelled() || self.tx.is_closed() {
                debug!("read of topic '{}' cancelled", self.topic.name());
                return Ok(false);
            }
            if self.topic.is_dropped() {
                return Err(LogError::NotFound(format!(
                    "topic '{}' was dropped",
                    self.topic.name()
                )));
            }
            if *self.offsets.borrow_and_update() > self.expected {
                return Ok(true);
            }
            let now = Instant::now();
            let nap = match self.deadline {
                Some(deadline) if now >= deadline => {
                    debug!(
                        "read of topic '{}' reached its ttl at offset {}",
                        self.topic.name(),
                        self.expected
                    );
                    return Ok(false);
                }
                Some(deadline) => poll.min(deadline - now),
                None => poll,
            };
            let (offsets, cancel, tx) = (&mut self.offsets, &self.cancel, &self.tx);
            self.runtime.block_on(async {
                tokio::select! {
                    _ = offsets.changed() => {}
                    _ = cancel.cancelled() => {}
                    _ = tx.closed() => {}
                    _ = tokio::time::sleep(nap) => {}
                }
            });
        }
    }
}
