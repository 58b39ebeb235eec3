//! The segmented log: append, read-by-index, segment cache, fsync batching,
//! front-truncation and multi-reader fan-out. See `SPEC_FULL.md` §4.1.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::info;

use crate::wal::error::{Error, Result};
use crate::wal::notify::{self, Notifier, Waiter};
use crate::wal::reader::Reader;
use crate::wal::segment::{self, HEADER_SIZE};
use crate::wal::segment_writer::SegmentWriter;

/// Opaque entry payload. Cheaply clonable so every reader/cache slot shares the
/// same allocation instead of copying on fan-out.
pub type Data = Arc<[u8]>;

#[derive(Debug, Clone)]
pub struct Entry {
    pub index: u64,
    pub data: Data,
}

/// Per-write metrics handed to [`LogOptions::hook`]. Collaborator interface only;
/// the core never interprets these values itself (see `SPEC_FULL.md` §4.9).
#[derive(Debug, Clone, Copy)]
pub struct WriteMetrics {
    pub last_index: u64,
    pub bytes_written: u64,
    pub write_time: Duration,
    pub fsync_called: bool,
    pub fsync_time: Duration,
}

pub type Hook = Arc<dyn Fn(WriteMetrics) + Send + Sync>;

#[derive(Clone)]
pub struct LogOptions {
    pub fsync_threshold_bytes: u64,
    pub segment_cache_size: usize,
    pub segment_size_bytes: u64,
    pub hook: Hook,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            fsync_threshold_bytes: 64 * 1024,
            segment_cache_size: 4,
            segment_size_bytes: 1024 * 1024 * 1024,
            hook: Arc::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for LogOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogOptions")
            .field("fsync_threshold_bytes", &self.fsync_threshold_bytes)
            .field("segment_cache_size", &self.segment_cache_size)
            .field("segment_size_bytes", &self.segment_size_bytes)
            .finish()
    }
}

struct CachedSegment {
    first_index: u64,
    entries: Vec<Data>,
}

impl CachedSegment {
    fn last_index(&self) -> u64 {
        self.first_index + self.entries.len() as u64
            - if self.entries.is_empty() { 0 } else { 1 }
    }

    fn get(&self, index: u64) -> Option<Data> {
        if self.entries.is_empty() || index < self.first_index || index > self.last_index() {
            return None;
        }
        Some(self.entries[(index - self.first_index) as usize].clone())
    }
}

struct WriteState {
    writer: Option<SegmentWriter>,
    unsynced_bytes: u64,
}

pub struct Log {
    dir: PathBuf,
    options: LogOptions,
    write_state: Mutex<WriteState>,
    last_index: AtomicU64,
    first_index: AtomicU64,
    closed: AtomicBool,
    cache: RwLock<VecDeque<CachedSegment>>,
    subscribers: Mutex<HashMap<u64, Notifier>>,
    next_sub_id: AtomicU64,
}

impl Log {
    pub fn open(dir: impl AsRef<Path>, options: LogOptions) -> Result<Arc<Log>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let seg_ids = segment::discover_segments(&dir)?;

        let mut cache: VecDeque<CachedSegment> = VecDeque::new();
        let (writer, last_index, first_index) = if seg_ids.is_empty() {
            (None, 0u64, 0u64)
        } else {
            let last_id = *seg_ids.last().unwrap();
            let writer = SegmentWriter::open_for_recovery(&dir, last_id, options.segment_size_bytes)?;
            let last_index = if writer.count() == 0 {
                last_id.saturating_sub(1)
            } else {
                last_id + writer.count() - 1
            };
            let first_index = seg_ids[0];

            let cached_ids: Vec<u64> = seg_ids
                .iter()
                .rev()
                .take(options.segment_cache_size)
                .rev()
                .copied()
                .collect();
            for id in cached_ids {
                let entries = load_segment_entries(&dir, id)?;
                cache.push_back(CachedSegment {
                    first_index: id,
                    entries,
                });
            }
            (Some(writer), last_index, first_index)
        };

        info!(
            "wal: opened log at {:?}, last_index={}, first_index={}, segments={}",
            dir,
            last_index,
            first_index,
            seg_ids.len()
        );

        Ok(Arc::new(Log {
            dir,
            options,
            write_state: Mutex::new(WriteState {
                writer,
                unsynced_bytes: 0,
            }),
            last_index: AtomicU64::new(last_index),
            first_index: AtomicU64::new(first_index),
            closed: AtomicBool::new(false),
            cache: RwLock::new(cache),
            subscribers: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
        }))
    }

    /// Opens the log for cold, read-only replay: discovers segments and warms
    /// the cache exactly like [`Log::open`], but never creates a writer for the
    /// tail segment. The replication leader's cold path uses this for its
    /// separate handle so a lagging client's catch-up scan never shares a
    /// writer (or its mmap) with the live log. See `SPEC_FULL.md` §4.6.
    pub fn open_read_only(dir: impl AsRef<Path>, options: LogOptions) -> Result<Arc<Log>> {
        let dir = dir.as_ref().to_path_buf();
        let seg_ids = segment::discover_segments(&dir)?;

        let mut cache: VecDeque<CachedSegment> = VecDeque::new();
        let (last_index, first_index) = if seg_ids.is_empty() {
            (0u64, 0u64)
        } else {
            let last_id = *seg_ids.last().unwrap();
            let mut file = segment::open_segment_file(&dir, last_id)?;
            let records = segment::scan_records(&mut file, HEADER_SIZE as u64)?;
            let last_index = if records.is_empty() {
                last_id.saturating_sub(1)
            } else {
                last_id + records.len() as u64 - 1
            };
            let first_index = seg_ids[0];

            let cached_ids: Vec<u64> = seg_ids
                .iter()
                .rev()
                .take(options.segment_cache_size)
                .rev()
                .copied()
                .collect();
            for id in cached_ids {
                let entries = load_segment_entries(&dir, id)?;
                cache.push_back(CachedSegment {
                    first_index: id,
                    entries,
                });
            }
            (last_index, first_index)
        };

        Ok(Arc::new(Log {
            dir,
            options,
            write_state: Mutex::new(WriteState {
                writer: None,
                unsynced_bytes: 0,
            }),
            last_index: AtomicU64::new(last_index),
            first_index: AtomicU64::new(first_index),
            closed: AtomicBool::new(false),
            cache: RwLock::new(cache),
            subscribers: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &LogOptions {
        &self.options
    }

    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    pub fn first_index(&self) -> u64 {
        self.first_index.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_in_memory(&self, index: u64) -> bool {
        let cache = self.cache.read().unwrap();
        cache.iter().any(|seg| seg.get(index).is_some())
    }

    pub fn read_from_cache(&self, index: u64) -> Option<Data> {
        let cache = self.cache.read().unwrap();
        cache.iter().find_map(|seg| seg.get(index))
    }

    /// Returns the `first_index` of the on-disk segment file that owns `index`,
    /// for opening a cold [`crate::wal::segment_cursor::SegmentCursor`].
    pub fn find_segment_on_disk(&self, index: u64) -> Result<Option<u64>> {
        let ids = segment::discover_segments(&self.dir)?;
        Ok(ids.iter().rev().find(|&&id| id <= index).copied())
    }

    /// Writes one record, invoking `on_index` with the assigned index *before*
    /// the physical write — inside the write mutex — so a caller (the state
    /// coordinator) can register a pending future atomically with respect to the
    /// applier. See `SPEC_FULL.md` §4.4.
    pub fn write(&self, data: &[u8], on_index: impl FnOnce(u64)) -> Result<u64> {
        if self.is_closed() {
            return Err(Error::LogClosed);
        }
        let start = Instant::now();
        let mut state = self.write_state.lock().unwrap();
        let index = self.last_index.load(Ordering::Acquire) + 1;
        on_index(index);

        self.ensure_writer(&mut state, data.len())?;
        let bytes_written = {
            let writer = state.writer.as_mut().unwrap();
            writer.append(data)?
        } as u64;
        state.unsynced_bytes += bytes_written;

        let mut fsync_called = false;
        let fsync_start = Instant::now();
        if state.unsynced_bytes >= self.options.fsync_threshold_bytes {
            state.writer.as_ref().unwrap().flush()?;
            state.unsynced_bytes = 0;
            fsync_called = true;
        }
        let fsync_time = fsync_start.elapsed();

        self.push_cache_entry(index, data);
        self.last_index.store(index, Ordering::Release);
        if self.first_index.load(Ordering::Acquire) == 0 {
            self.first_index.store(index, Ordering::Release);
        }
        drop(state);

        self.notify_all();
        (self.options.hook)(WriteMetrics {
            last_index: index,
            bytes_written,
            write_time: start.elapsed(),
            fsync_called,
            fsync_time,
        });
        Ok(index)
    }

    /// Appends several pre-indexed entries from a replication stream in one
    /// segment write and one fsync decision. Rejects a non-contiguous leading
    /// index explicitly (resolves Open Question 3, `SPEC_FULL.md` §9).
    pub fn write_batch(&self, entries: &[(u64, Vec<u8>)]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LogClosed);
        }
        if entries.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let mut state = self.write_state.lock().unwrap();
        let mut expected = self.last_index.load(Ordering::Acquire) + 1;
        for (index, _) in entries {
            if *index != expected {
                return Err(Error::IndexGap {
                    expected,
                    got: *index,
                });
            }
            expected += 1;
        }

        let mut total_bytes = 0u64;
        for (index, data) in entries {
            self.ensure_writer(&mut state, data.len())?;
            let bytes_written = state.writer.as_mut().unwrap().append(data)? as u64;
            total_bytes += bytes_written;
            self.push_cache_entry(*index, data);
        }
        state.unsynced_bytes += total_bytes;
        let mut fsync_called = false;
        let fsync_start = Instant::now();
        if state.unsynced_bytes >= self.options.fsync_threshold_bytes {
            state.writer.as_ref().unwrap().flush()?;
            state.unsynced_bytes = 0;
            fsync_called = true;
        }
        let fsync_time = fsync_start.elapsed();

        let last = entries.last().unwrap().0;
        self.last_index.store(last, Ordering::Release);
        if self.first_index.load(Ordering::Acquire) == 0 {
            self.first_index.store(entries[0].0, Ordering::Release);
        }
        drop(state);
        self.notify_all();
        (self.options.hook)(WriteMetrics {
            last_index: last,
            bytes_written: total_bytes,
            write_time: start.elapsed(),
            fsync_called,
            fsync_time,
        });
        Ok(())
    }

    /// Single-entry convenience wrapper over `write_batch`.
    pub fn write_entry(&self, index: u64, data: Vec<u8>) -> Result<()> {
        self.write_batch(&[(index, data)])
    }

    fn ensure_writer(&self, state: &mut WriteState, record_len: usize) -> Result<()> {
        if state.writer.is_none() {
            state.writer = Some(SegmentWriter::create(&self.dir, 1, self.options.segment_size_bytes)?);
            return Ok(());
        }
        let needs_roll = state.writer.as_ref().unwrap().needs_roll(record_len);
        if needs_roll {
            let writer = state.writer.take().unwrap();
            let next_first_index = writer.next_index();
            writer.roll()?;
            state.writer = Some(SegmentWriter::create(
                &self.dir,
                next_first_index,
                self.options.segment_size_bytes,
            )?);
            self.cache.write().unwrap().push_back(CachedSegment {
                first_index: next_first_index,
                entries: Vec::new(),
            });
            self.evict_cache_if_needed();
            info!("wal: rolled segment at {:?}, next first_index={}", self.dir, next_first_index);
        }
        Ok(())
    }

    fn push_cache_entry(&self, index: u64, data: &[u8]) {
        let mut cache = self.cache.write().unwrap();
        if cache.is_empty() {
            cache.push_back(CachedSegment {
                first_index: index,
                entries: Vec::new(),
            });
        }
        cache.back_mut().unwrap().entries.push(Arc::from(data));
        drop(cache);
        self.evict_cache_if_needed();
    }

    fn evict_cache_if_needed(&self) {
        let mut cache = self.cache.write().unwrap();
        while cache.len() > self.options.segment_cache_size.max(1) {
            cache.pop_front();
        }
    }

    pub fn open_reader(self: &Arc<Self>, after_index: u64) -> Reader {
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (notifier, waiter) = notify::channel();
        self.subscribers.lock().unwrap().insert(sub_id, notifier);
        Reader::new(Arc::clone(self), sub_id, after_index + 1, waiter)
    }

    pub fn unsubscribe(&self, sub_id: u64) {
        self.subscribers.lock().unwrap().remove(&sub_id);
    }

    fn notify_all(&self) {
        for notifier in self.subscribers.lock().unwrap().values() {
            notifier.notify();
        }
    }

    /// Drops segment files strictly below `new_first_index` and evicts them from
    /// the cache. Segments whose entries are not entirely below the new
    /// watermark are left untouched.
    pub fn truncate_front(&self, new_first_index: u64) -> Result<()> {
        let state = self.write_state.lock().unwrap();
        let ids = segment::discover_segments(&self.dir)?;
        for window in ids.windows(2) {
            if window[1] <= new_first_index {
                fs::remove_file(segment::segment_path(&self.dir, window[0]))?;
            }
        }
        drop(state);

        let mut cache = self.cache.write().unwrap();
        cache.retain(|seg| seg.last_index() >= new_first_index);
        drop(cache);

        let remaining = segment::discover_segments(&self.dir)?;
        self.first_index.store(
            remaining.first().copied().unwrap_or(new_first_index),
            Ordering::Release,
        );
        Ok(())
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut state) = self.write_state.lock() {
            if let Some(writer) = state.writer.as_mut() {
                let _ = writer.seal();
            }
        }
        self.notify_all();
    }
}

fn load_segment_entries(dir: &Path, first_index: u64) -> Result<Vec<Data>> {
    let mut file = segment::open_segment_file(dir, first_index)?;
    let records = segment::scan_records(&mut file, HEADER_SIZE as u64)?;
    Ok(records.into_iter().map(|r| Arc::from(r.data)).collect())
}

impl Drop for Log {
    fn drop(&mut self) {
        self.close();
    }
}
