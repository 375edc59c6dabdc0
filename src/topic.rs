//! State of one topic: its segments, the published next offset and the
//! background index builder.

use log::{debug, info, warn};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinError;

use crate::config::EngineConfig;
use crate::fs::SharedFs;
use crate::index::{IndexCursor, SegmentIndex, build_increment, remove_index_files, truncate_index};
use crate::repair::{VerifyReport, check_segment, repair};
use crate::segment::{Segment, SegmentStore};
use crate::types::{ByteOffset, IoResultExt, LogError, Offset, Result, SegmentCheck, TopicStatus};

/// At most one runner at a time, with requests made during a run coalesced
/// into a single follow-up run.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    busy: AtomicBool,
    pending: AtomicBool,
}

impl SingleFlight {
    /// Register a request. Returns true when the caller became the runner and
    /// must call [`SingleFlight::run`].
    pub(crate) fn request(&self) -> bool {
        self.pending.store(true, Ordering::SeqCst);
        self.try_begin()
    }

    fn try_begin(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Run `work` until no request is left pending.
    pub(crate) fn run(&self, mut work: impl FnMut()) {
        loop {
            self.pending.store(false, Ordering::SeqCst);
            work();
            self.busy.store(false, Ordering::SeqCst);
            if !self.pending.load(Ordering::SeqCst) || !self.try_begin() {
                break;
            }
        }
    }
}

pub struct Topic {
    name: String,
    dir: PathBuf,
    pub(crate) fs: SharedFs,
    pub(crate) config: Arc<EngineConfig>,
    /// Serializes appends, drops and maintenance passes.
    write_lock: Arc<tokio::sync::Mutex<()>>,
    segments: RwLock<SegmentStore>,
    next_offset: watch::Sender<Offset>,
    dropped: AtomicBool,
    /// Bumped whenever bytes are cut from a segment file.
    generation: AtomicU64,
    indexer: SingleFlight,
    cursor: Mutex<Option<IndexCursor>>,
    /// Every segment starting below this offset is completely indexed.
    indexed_below: AtomicU64,
    index_cache: Mutex<LruCache<Offset, Arc<SegmentIndex>>>,
}

impl Topic {
    fn new(
        name: String,
        dir: PathBuf,
        fs: SharedFs,
        config: Arc<EngineConfig>,
        store: SegmentStore,
        next_offset: Offset,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.index_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let (next_offset, _) = watch::channel(next_offset);
        Self {
            name,
            dir,
            fs,
            config,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            segments: RwLock::new(store),
            next_offset,
            dropped: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            indexer: SingleFlight::default(),
            cursor: Mutex::new(None),
            indexed_below: AtomicU64::new(0),
            index_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Open the topic stored in `dir`, creating the directory if needed.
    ///
    /// The head segment is verified before its size and last offset are
    /// trusted, and repaired unless the engine is read only.
    pub(crate) fn open(fs: SharedFs, config: Arc<EngineConfig>, name: &str, dir: PathBuf) -> Result<Self> {
        if !config.read_only {
            fs.create_dir_all(&dir)
                .ctx(|| format!("failed to create topic directory '{}'", dir.display()))?;
        }
        let mut store = SegmentStore::load(fs.as_ref(), dir.clone(), config.max_segment_size)?;

        let mut next_offset = 0;
        if let Ok(head) = store.head() {
            let (report, _) = check_segment(fs.as_ref(), &dir, head, config.read_only)?;
            next_offset = next_after(head, &report);
            store.set_head_size(report.safe_byte_offset);
            // the segment after a rotation only exists once written to
            if report.safe_byte_offset > config.max_segment_size {
                store.rotate(next_offset);
            }
        }

        info!(
            "opened topic '{name}' with {} segment(s), next offset {next_offset}",
            store.len()
        );
        Ok(Self::new(name.to_string(), dir, fs, config, store, next_offset))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Offset the next appended record will get.
    pub fn next_offset(&self) -> Offset {
        *self.next_offset.borrow()
    }

    /// Watch the next offset advance as records are appended.
    pub fn subscribe(&self) -> watch::Receiver<Offset> {
        self.next_offset.subscribe()
    }

    pub(crate) fn publish_next_offset(&self, offset: Offset) {
        self.next_offset.send_replace(offset);
    }

    pub(crate) fn segments(&self) -> RwLockReadGuard<'_, SegmentStore> {
        self.segments.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn segments_mut(&self) -> RwLockWriteGuard<'_, SegmentStore> {
        self.segments.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive write access. The guard can be moved into a
    /// blocking task.
    pub(crate) async fn lock_writes(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.write_lock).lock_owned().await
    }

    /// Run file work for this topic on the blocking pool.
    pub(crate) async fn run_blocking<T, F>(self: &Arc<Self>, work: F) -> Result<T>
    where
        F: FnOnce(&Topic) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let topic = Arc::clone(self);
        tokio::task::spawn_blocking(move || work(&topic))
            .await
            .map_err(map_join_error)?
    }

    /// Changes whenever a segment file of this topic was cut short, so
    /// readers know to reopen their handles.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Move the topic directory to `hidden` and stop all work on it. The
    /// caller holds the write lock; a running index build finishes first.
    pub(crate) fn retire(&self, hidden: &Path) -> Result<()> {
        let mut cursor = self.cursor();
        self.fs.rename(&self.dir, hidden).ctx(|| {
            format!(
                "failed to move '{}' to '{}'",
                self.dir.display(),
                hidden.display()
            )
        })?;
        self.dropped.store(true, Ordering::SeqCst);
        *cursor = None;
        self.forget_indexes();
        Ok(())
    }

    pub fn status(&self) -> TopicStatus {
        let segments = self.segments();
        let next_offset = self.next_offset();
        TopicStatus {
            topic: self.name.clone(),
            segment_count: segments.len(),
            head_offset: next_offset.checked_sub(1),
            next_offset,
            max_segment_size: segments.max_segment_size(),
            path: self.dir.display().to_string(),
        }
    }

    fn cursor(&self) -> MutexGuard<'_, Option<IndexCursor>> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<Offset, Arc<SegmentIndex>>> {
        self.index_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget_indexes(&self) {
        self.indexed_below.store(0, Ordering::SeqCst);
        self.cache().clear();
    }

    /// Schedule an index increment. A no-op while one is already running;
    /// the running build picks the request up before it finishes.
    pub(crate) fn trigger_index(self: &Arc<Self>) {
        if self.config.read_only || self.is_dropped() || !self.indexer.request() {
            return;
        }
        let topic = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || topic.run_indexer());
            }
            Err(_) => topic.run_indexer(),
        }
    }

    /// True while a background index build is running.
    pub fn is_indexing(&self) -> bool {
        self.indexer.is_busy()
    }

    fn run_indexer(&self) {
        self.indexer.run(|| {
            if let Err(e) = self.index_now() {
                warn!("index build for topic '{}' failed, will retry: {e}", self.name);
            }
        });
    }

    /// Index everything written since the last increment.
    pub(crate) fn index_now(&self) -> Result<usize> {
        let mut cursor = self.cursor();
        self.index_with(&mut cursor)
    }

    fn index_with(&self, cursor: &mut Option<IndexCursor>) -> Result<usize> {
        if self.is_dropped() {
            return Ok(0);
        }
        let segments = self.segments().segments().to_vec();
        if cursor.is_none() {
            *cursor = IndexCursor::restore(self.fs.as_ref(), &self.dir, &segments)?;
        }
        let Some(current) = cursor.as_mut() else {
            return Ok(0);
        };
        let result = build_increment(
            self.fs.as_ref(),
            &self.dir,
            &segments,
            current,
            self.config.one_in_every(),
        );
        self.indexed_below
            .store(current.segment.start_offset, Ordering::SeqCst);
        result
    }

    /// Drop every index file and index the whole topic again.
    pub(crate) fn rebuild_index(&self) -> Result<usize> {
        let mut cursor = self.cursor();
        self.forget_indexes();
        let removed = remove_index_files(self.fs.as_ref(), &self.dir)?;
        debug!("removed {removed} index file(s) of topic '{}'", self.name);
        *cursor = None;
        let written = self.index_with(&mut cursor)?;
        info!("rebuilt index of topic '{}' with {written} entries", self.name);
        Ok(written)
    }

    /// Decoded index of `segment`, cached once the segment is fully indexed.
    pub(crate) fn index_for(&self, segment: Segment) -> Result<Arc<SegmentIndex>> {
        if let Some(index) = self.cache().get(&segment.start_offset) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(SegmentIndex::read(self.fs.as_ref(), &self.dir, segment)?);
        if segment.start_offset < self.indexed_below.load(Ordering::SeqCst) {
            self.cache().put(segment.start_offset, Arc::clone(&index));
        }
        Ok(index)
    }

    /// Byte offset to start scanning `segment` from to reach `offset`. Falls
    /// back to the start of the segment when the index cannot be used.
    pub(crate) fn lookup(&self, segment: Segment, offset: Offset) -> ByteOffset {
        match self.index_for(segment) {
            Ok(index) => index.lookup(offset).byte_offset,
            Err(e) => {
                warn!(
                    "index of segment {} in topic '{}' is unusable, scanning from the start: {e}",
                    segment.start_offset, self.name
                );
                0
            }
        }
    }

    /// Verify every segment, repairing corrupt ones when `repair` is set.
    /// The caller holds `write_lock`.
    pub(crate) fn check(&self, repair: bool) -> Result<Vec<SegmentCheck>> {
        let mut cursor = self.cursor();
        let segments = self.segments().segments().to_vec();
        let mut checks = Vec::with_capacity(segments.len());
        let mut repaired = false;

        for segment in segments {
            if !self.fs.exists(&segment.log_path(&self.dir)) {
                continue;
            }
            let (report, check) = check_segment(self.fs.as_ref(), &self.dir, segment, !repair)?;
            if check.repaired {
                repaired = true;
                let mut store = self.segments_mut();
                if store.is_head(segment) {
                    store.set_head_size(report.safe_byte_offset);
                    self.publish_next_offset(next_after(segment, &report));
                }
            }
            checks.push(check);
        }

        if repaired {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *cursor = None;
            self.forget_indexes();
        }
        Ok(checks)
    }

    /// Cut the head segment back to `size` bytes, throwing away whatever a
    /// failed append left behind. The caller holds `write_lock`.
    pub(crate) fn discard_tail(&self, head: Segment, size: ByteOffset) -> Result<()> {
        let mut cursor = self.cursor();
        let path = head.log_path(&self.dir);
        let written = if self.fs.exists(&path) {
            self.fs
                .file_size(&path)
                .ctx(|| format!("failed to stat segment '{}'", path.display()))?
        } else {
            0
        };
        if written > size {
            repair(self.fs.as_ref(), &path, size)?;
            truncate_index(self.fs.as_ref(), &self.dir, head, size)?;
            self.generation.fetch_add(1, Ordering::SeqCst);
            warn!(
                "cut {} unacknowledged byte(s) from segment {} of topic '{}'",
                written - size,
                head.start_offset,
                self.name
            );
        }
        self.segments_mut().set_head_size(size);
        *cursor = None;
        self.forget_indexes();
        Ok(())
    }
}

fn map_join_error(err: JoinError) -> LogError {
    LogError::Io {
        context: "blocking topic task failed".to_string(),
        source: std::io::Error::other(err.to_string()),
    }
}

fn next_after(segment: Segment, report: &VerifyReport) -> Offset {
    report
        .last_offset
        .map_or(segment.start_offset, |last| last + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use crate::index::IndexEntry;
    use std::io::Write;
    use std::thread;

    fn open_topic(fs: &SharedFs, max_segment_size: u64) -> Arc<Topic> {
        let mut config = EngineConfig::new("/data");
        config.max_segment_size = max_segment_size;
        config.index_density = 0.5;
        Arc::new(Topic::open(fs.clone(), Arc::new(config), "orders", PathBuf::from("/data/orders")).unwrap())
    }

    #[test]
    fn test_single_flight_coalesces_requests() {
        let flight = SingleFlight::default();
        assert!(flight.request());
        assert!(!flight.request());

        let mut runs = 0;
        flight.run(|| runs += 1);
        assert_eq!(runs, 1);
        assert!(!flight.is_busy());
    }

    #[test]
    fn test_single_flight_reruns_for_request_made_during_run() {
        let flight = SingleFlight::default();
        assert!(flight.request());

        let mut runs = 0;
        flight.run(|| {
            runs += 1;
            if runs == 1 {
                assert!(!flight.request());
            }
        });
        assert_eq!(runs, 2);
        assert!(flight.request());
    }

    #[test]
    fn test_single_flight_one_runner_across_threads() {
        let flight = Arc::new(SingleFlight::default());
        let active = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let active = Arc::clone(&active);
                thread::spawn(move || {
                    for _ in 0..100 {
                        if flight.request() {
                            flight.run(|| {
                                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                                active.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!flight.is_busy());
    }

    #[test]
    fn test_open_empty_topic() {
        let fs: SharedFs = Arc::new(MemoryFs::new());
        let topic = open_topic(&fs, 1024);
        assert_eq!(topic.next_offset(), 0);

        let status = topic.status();
        assert_eq!(status.topic, "orders");
        assert_eq!(status.segment_count, 0);
        assert_eq!(status.head_offset, None);
        assert_eq!(status.path, "/data/orders");
        assert!(fs.is_dir(Path::new("/data/orders")));
    }

    #[test]
    fn test_index_is_cached_only_once_sealed() {
        let fs: SharedFs = Arc::new(MemoryFs::new());
        let topic = open_topic(&fs, 100);
        let dir = topic.dir().to_path_buf();

        let mut buf = Vec::new();
        for offset in 0..4 {
            crate::codec::encode_into(&mut buf, offset, &[0u8; 30]);
        }
        fs.open_append(&Segment::new(0).log_path(&dir))
            .unwrap()
            .write_all(&buf)
            .unwrap();
        {
            let mut store = topic.segments_mut();
            store.ensure_head(0);
            store.rotate(4);
        }
        topic.publish_next_offset(4);

        assert_eq!(topic.index_now().unwrap(), 1);
        let index = topic.index_for(Segment::new(0)).unwrap();
        assert_eq!(index.entries(), &[IndexEntry::new(2, 100)]);
        assert_eq!(topic.lookup(Segment::new(0), 3), 100);
        assert!(topic.cache().contains(&0));
        assert!(!topic.cache().contains(&4));
    }
}
