use crate::{
    codec::{self, FRAME_OVERHEAD},
    segment::Segment,
    topic::Topic,
    types::{AppendResult, IoResultExt, LogError, Offset, Result},
};
use log::{error, info};
use std::io::Write;
use std::sync::Arc;

impl Topic {
    /// Append `payloads` as consecutive records.
    ///
    /// The whole batch is encoded into one buffer and handed to the head
    /// segment in a single write. Either every record of the batch is
    /// acknowledged or none is. Once the write lock is released an index
    /// increment is scheduled; indexing failures never reach the caller.
    pub async fn append(self: &Arc<Self>, payloads: &[Vec<u8>]) -> Result<AppendResult> {
        if self.config.read_only {
            return Err(LogError::ReadOnly);
        }

        let guard = self.lock_writes().await;
        if self.is_dropped() {
            return Err(LogError::NotFound(format!("topic '{}'", self.name())));
        }
        let first_offset = self.next_offset();
        if payloads.is_empty() {
            return Ok(AppendResult {
                first_offset,
                records_written: 0,
            });
        }

        let capacity = payloads.iter().map(|p| FRAME_OVERHEAD + p.len()).sum();
        let mut buffer = Vec::with_capacity(capacity);
        for (offset, payload) in (first_offset..).zip(payloads) {
            codec::encode_into(&mut buffer, offset, payload);
        }
        let next_offset = first_offset + payloads.len() as u64;

        self.run_blocking(move |topic| {
            let _guard = guard;
            topic.append_locked(first_offset, next_offset, &buffer)
        })
        .await?;

        self.trigger_index();
        Ok(AppendResult {
            first_offset,
            records_written: payloads.len(),
        })
    }

    /// Write the encoded records `[first_offset, next_offset)`. Caller must
    /// hold `write_lock`.
    fn append_locked(&self, first_offset: Offset, next_offset: Offset, buffer: &[u8]) -> Result<()> {
        let (head, size_before) = {
            let mut segments = self.segments_mut();
            let head = segments.ensure_head(first_offset);
            (head, segments.head_size())
        };
        if let Err(e) = self.write_to_segment(head, buffer) {
            error!("append to topic '{}' failed: {e}", self.name());
            if let Err(cut) = self.discard_tail(head, size_before) {
                error!(
                    "could not cut segment {} of topic '{}' back to {size_before} bytes: {cut}",
                    head.start_offset,
                    self.name()
                );
            }
            return Err(e);
        }

        let rotated = {
            let mut segments = self.segments_mut();
            segments
                .record_append(buffer.len() as u64)
                .then(|| segments.rotate(next_offset))
        };
        self.publish_next_offset(next_offset);

        if let Some(new_head) = rotated {
            info!(
                "topic '{}' rotated segment {} -> {}",
                self.name(),
                head.start_offset,
                new_head.start_offset
            );
        }
        Ok(())
    }

    fn write_to_segment(&self, segment: Segment, buffer: &[u8]) -> Result<()> {
        let path = segment.log_path(self.dir());
        let mut file = self
            .fs
            .open_append(&path)
            .ctx(|| format!("failed to open segment '{}' for append", path.display()))?;
        file.write_all(buffer)
            .ctx(|| format!("failed to append to segment '{}'", path.display()))?;
        if self.config.sync_on_write {
            file.sync_data()
                .ctx(|| format!("failed to sync segment '{}'", path.display()))?;
        }
        Ok(())
    }
}
