//! A segmented, append-only commit log.
//!
//! A [`TopicDirectory`] manages a set of named topics under one root
//! directory. Each topic is an independent stream of records, each record
//! gets a monotonically increasing **offset** starting at 0, and records are
//! stored in size-bounded segment files named after their first offset.
//!
//! # Features
//!
//! - **Batched writes** – a whole batch is encoded into one buffer and written
//!   with a single call; one writer per topic at a time, topics in parallel.
//! - **Segmented** – once the head segment grows past `max_segment_size` a new
//!   segment starting at the next offset is opened (rotation).
//! - **Sparse index** – every Nth record's byte position is kept in a
//!   delta-varint `.index` file built in the background, so reads can seek
//!   close to any offset.
//! - **Checksummed** – every record carries a CRC-32C that is checked on every
//!   read; a torn or corrupted tail is cut off when a topic is opened.
//! - **Streaming reads** – batches are delivered lazily, either up to the end
//!   of the log at call time or following the writer until a TTL runs out.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use seglog::{EngineConfig, LogReader, LogWriter, TopicAdmin, TopicDirectory};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. Open (or create) the log. Existing topics are discovered and the
//!     //    head segment of each is verified.
//!     let mut config = EngineConfig::new("./log_data");
//!     config.max_segment_size = 1024 * 1024; // 1 MB segments
//!     let log = TopicDirectory::open(config).await?;
//!
//!     // 2. Write a batch. The topic is created on first write.
//!     let written = log
//!         .write_batch("orders", &[b"hello".to_vec(), b"world".to_vec()])
//!         .await?;
//!     assert_eq!(written, 2);
//!
//!     // 3. Read everything written so far, two records per batch.
//!     let mut batches = log
//!         .read_batches("orders", 0, 2, true, Duration::ZERO)
//!         .await?;
//!     while let Some(batch) = batches.next_batch().await {
//!         for record in batch? {
//!             println!("{}: {:?}", record.offset, record.payload);
//!         }
//!     }
//!
//!     // 4. Follow the topic for new records for up to ten seconds.
//!     let mut tail = log
//!         .read_batches("orders", 1, 100, false, Duration::from_secs(10))
//!         .await?;
//!     tail.cancel(); // or let the TTL expire
//!
//!     for status in log.status().await {
//!         println!("{status:?}");
//!     }
//!
//!     // 5. Stop background work.
//!     log.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Recovery
//!
//! Reopening a root with [`TopicDirectory::open`] rediscovers every topic.
//! The newest segment of each topic is verified record by record; a partial
//! or corrupted tail is moved aside to a `.corrupt` file and the verified
//! prefix is kept, so writing resumes right after the last good record. Older
//! segments can be checked on demand with [`TopicDirectory::check_topic`].


pub mod codec;
pub mod config;
pub mod directory;
pub mod fs;
pub mod index;
mod reader;
pub mod repair;
pub mod segment;
mod topic;
mod types;
mod writer;

pub use config::EngineConfig;
pub use directory::TopicDirectory;
pub use reader::BatchStream;
pub use topic::Topic;
pub use types::*;
