use crate::{
    config::EngineConfig,
    fs::{LocalFs, MemoryFs, SharedFs},
    index::{IndexEntry, SegmentIndex},
    reader::BatchStream,
    repair,
    segment::Segment,
    topic::Topic,
    types::{
        AppendResult, IoResultExt, LogError, LogReader, LogWriter, Offset, ReadMode, Result,
        SegmentCheck, SegmentInfo, TopicAdmin, TopicStatus,
    },
};
use log::{debug, error, info, warn};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

type TopicMap = Arc<RwLock<HashMap<String, Arc<Topic>>>>;

/// The set of topics under one root directory.
pub struct TopicDirectory {
    config: Arc<EngineConfig>,
    fs: SharedFs,
    topics: TopicMap,
    shutdown: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TopicDirectory {
    /// Open (or create) the log rooted at `config.root_path` on the local filesystem.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_fs(config, Arc::new(LocalFs)).await
    }

    /// Run the engine entirely in memory.
    pub async fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::open_with_fs(config, Arc::new(MemoryFs::new())).await
    }

    pub async fn open_with_fs(config: EngineConfig, fs: SharedFs) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let root = config.root_path.clone();

        let mut topics = HashMap::new();
        if config.read_only && !fs.is_dir(&root) {
            warn!("log root '{}' does not exist, no topics to serve", root.display());
        } else {
            fs.create_dir_all(&root)
                .ctx(|| format!("failed to create log root '{}'", root.display()))?;
            let names = fs
                .list_dir(&root)
                .ctx(|| format!("failed to list log root '{}'", root.display()))?;
            for name in names {
                let dir = root.join(&name);
                if name.starts_with('.') || !fs.is_dir(&dir) {
                    continue;
                }
                let topic = Topic::open(fs.clone(), config.clone(), &name, dir)?;
                topics.insert(name, Arc::new(topic));
            }
        }
        info!(
            "opened log at '{}' with {} topic(s)",
            root.display(),
            topics.len()
        );

        let topics: TopicMap = Arc::new(RwLock::new(topics));
        let shutdown = CancellationToken::new();
        let ticker = match config.index_interval() {
            Some(interval) if !config.read_only => Some(spawn_index_ticker(
                topics.clone(),
                interval,
                shutdown.clone(),
            )),
            _ => None,
        };

        Ok(Self {
            config,
            fs,
            topics,
            shutdown,
            ticker: Mutex::new(ticker),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(LogError::ReadOnly);
        }
        Ok(())
    }

    /// Look up a live topic.
    pub async fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.topics
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LogError::NotFound(format!("topic '{name}'")))
    }

    /// Append a batch to `topic`, creating the topic if needed.
    pub async fn append(&self, topic: &str, payloads: &[Vec<u8>]) -> Result<AppendResult> {
        self.ensure_writable()?;
        let existing = self.topics.read().await.get(topic).cloned();
        let topic = match existing {
            Some(topic) => topic,
            None => {
                self.create_topic(topic).await?;
                self.topic(topic).await?
            }
        };
        topic.append(payloads).await
    }

    /// Decode and validate a single segment file.
    pub fn inspect_segment(&self, path: &Path) -> Result<SegmentInfo> {
        repair::inspect_segment(self.fs.as_ref(), path)
    }

    /// Absolute index entries stored for the segment of `topic` starting at
    /// `segment_start`.
    pub async fn read_index(&self, topic: &str, segment_start: Offset) -> Result<Vec<IndexEntry>> {
        let topic = self.topic(topic).await?;
        let segment = Segment::new(segment_start);
        if !topic.segments().segments().contains(&segment) {
            return Err(LogError::NotFound(format!(
                "segment {segment_start} in topic '{}'",
                topic.name()
            )));
        }
        let index = SegmentIndex::read(self.fs.as_ref(), topic.dir(), segment)?;
        Ok(index.entries().to_vec())
    }

    /// Index whatever `topic` has accumulated since the last increment.
    pub async fn index_now(&self, topic: &str) -> Result<usize> {
        self.ensure_writable()?;
        self.topic(topic).await?.run_blocking(Topic::index_now).await
    }

    /// Throw away every index file of `topic` and build them again.
    pub async fn rebuild_index(&self, topic: &str) -> Result<usize> {
        self.ensure_writable()?;
        self.topic(topic).await?.run_blocking(Topic::rebuild_index).await
    }

    /// Verify every segment of `topic`, repairing corrupt ones when `repair`
    /// is set. Writers to the topic wait until the pass is done.
    pub async fn check_topic(&self, topic: &str, repair: bool) -> Result<Vec<SegmentCheck>> {
        if repair {
            self.ensure_writable()?;
        }
        let topic = self.topic(topic).await?;
        let guard = topic.lock_writes().await;
        let checks = topic
            .run_blocking(move |topic| {
                let _guard = guard;
                topic.check(repair)
            })
            .await?;
        let corrupt = checks.iter().filter(|c| c.corrupt_at.is_some()).count();
        if corrupt > 0 {
            warn!(
                "topic '{}' has {corrupt} corrupt segment(s) of {}",
                topic.name(),
                checks.len()
            );
        } else {
            info!("topic '{}' passed verification", topic.name());
        }
        Ok(checks)
    }

    /// Stop the index ticker and every following read.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = ticker
            && let Err(e) = handle.await
        {
            error!("index ticker ended abnormally: {e}");
        }
        info!("log at '{}' shut down", self.config.root_path.display());
    }

    fn hidden_dir_for(&self, name: &str) -> PathBuf {
        let root = &self.config.root_path;
        let first = root.join(format!(".{name}"));
        if !self.fs.exists(&first) {
            return first;
        }
        (1u32..)
            .map(|n| root.join(format!(".{name}.{n}")))
            .find(|p| !self.fs.exists(p))
            .unwrap_or(first)
    }
}

impl Drop for TopicDirectory {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn validate_topic_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).components().count() != 1;
    if invalid {
        return Err(LogError::InvalidTopicName(name.to_string()));
    }
    Ok(())
}

fn spawn_index_ticker(
    topics: TopicMap,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let topics: Vec<Arc<Topic>> = topics.read().await.values().cloned().collect();
                    for topic in &topics {
                        topic.trigger_index();
                    }
                }
            }
        }
        debug!("index ticker stopped");
    })
}

#[async_trait::async_trait]
impl TopicAdmin for TopicDirectory {
    async fn create_topic(&self, topic: &str) -> Result<bool> {
        self.ensure_writable()?;
        validate_topic_name(topic)?;

        let mut topics = self.topics.write().await;
        if topics.contains_key(topic) {
            return Ok(false);
        }
        let dir = self.config.root_path.join(topic);
        let opened = Topic::open(self.fs.clone(), self.config.clone(), topic, dir)?;
        topics.insert(topic.to_string(), Arc::new(opened));
        info!("created topic '{topic}'");
        Ok(true)
    }

    /// Soft delete: the topic directory is renamed with a leading `.` and
    /// disappears from listings, its files are left in place.
    async fn drop_topic(&self, topic: &str) -> Result<bool> {
        self.ensure_writable()?;
        validate_topic_name(topic)?;

        let mut topics = self.topics.write().await;
        let Some(existing) = topics.get(topic).cloned() else {
            return Ok(false);
        };
        let guard = existing.lock_writes().await;

        let hidden = self.hidden_dir_for(topic);
        let moved_to = hidden.clone();
        existing
            .run_blocking(move |topic| {
                let _guard = guard;
                topic.retire(&moved_to)
            })
            .await?;
        topics.remove(topic);
        info!("dropped topic '{topic}', files kept at '{}'", hidden.display());
        Ok(true)
    }

    async fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn status(&self) -> Vec<TopicStatus> {
        let mut statuses: Vec<TopicStatus> = self
            .topics
            .read()
            .await
            .values()
            .map(|t| t.status())
            .collect();
        statuses.sort_by(|a, b| a.topic.cmp(&b.topic));
        statuses
    }
}

#[async_trait::async_trait]
impl LogWriter for TopicDirectory {
    async fn write_batch(&self, topic: &str, payloads: &[Vec<u8>]) -> Result<usize> {
        self.append(topic, payloads)
            .await
            .map(|result| result.records_written)
    }
}

#[async_trait::async_trait]
impl LogReader for TopicDirectory {
    /// A zero `ttl` on a following read stands for the configured default.
    async fn read_batches(
        &self,
        topic: &str,
        from_offset: Offset,
        batch_size: usize,
        stop_on_completion: bool,
        ttl: Duration,
    ) -> Result<BatchStream> {
        let topic = self.topic(topic).await?;
        let ttl = if ttl.is_zero() {
            self.config.read_ttl()
        } else {
            ttl
        };
        let mode = ReadMode::from_flags(stop_on_completion, ttl);
        topic
            .read(from_offset, batch_size, mode, self.shutdown.child_token())
            .await
    }
}
