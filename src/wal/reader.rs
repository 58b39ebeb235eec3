//! A cursor over the log starting at a given index. Transparently switches
//! between reading through the log's in-memory cache ("hot") and scanning a
//! sealed segment file by path ("cold") once it falls behind the cache.
//!
//! Modeled as a tagged variant rather than nullable fields so a hot/cold
//! transition can never leak a cold file handle or double-close it
//! (`SPEC_FULL.md` §9, "Hot/cold reader transition").

use std::sync::Arc;

use crate::wal::error::{Error, Result};
use crate::wal::log::{Data, Entry, Log};
use crate::wal::notify::Waiter;
use crate::wal::segment_cursor::SegmentCursor;

enum ReaderState {
    Hot,
    Cold(SegmentCursor),
}

pub struct Reader {
    log: Arc<Log>,
    sub_id: u64,
    next_index: u64,
    closed: bool,
    waiter: Waiter,
    state: ReaderState,
}

impl Reader {
    pub(crate) fn new(log: Arc<Log>, sub_id: u64, next_index: u64, waiter: Waiter) -> Self {
        Self {
            log,
            sub_id,
            next_index,
            closed: false,
            waiter,
            state: ReaderState::Hot,
        }
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn last_index(&self) -> u64 {
        self.next_index.saturating_sub(1)
    }

    /// Non-blocking: returns `Ok(None)` instead of waiting when nothing is ready.
    fn try_read(&mut self) -> Result<Option<Entry>> {
        if self.closed {
            return Err(Error::LogClosed);
        }
        // The index was dropped by `truncate_front` out from under a reader that
        // hadn't caught up yet. No panic-recover bracket (Open Question 2,
        // `SPEC_FULL.md` §9) — just a normal error the caller can act on.
        if self.next_index != 0 && self.next_index < self.log.first_index() {
            return Err(Error::ReplicationLagOverflow);
        }
        match &mut self.state {
            ReaderState::Hot => {
                if let Some(data) = self.log.read_from_cache(self.next_index) {
                    let entry = self.make_entry(self.next_index, data);
                    self.next_index += 1;
                    return Ok(Some(entry));
                }
                if self.next_index <= self.log.last_index() {
                    let seg_id = self
                        .log
                        .find_segment_on_disk(self.next_index)?
                        .ok_or(Error::NotFound)?;
                    let cursor = SegmentCursor::open(self.log.dir(), seg_id, self.next_index)?;
                    self.state = ReaderState::Cold(cursor);
                    return self.try_read();
                }
                if self.log.is_closed() {
                    return Err(Error::LogClosed);
                }
                Ok(None)
            }
            ReaderState::Cold(cursor) => match cursor.next()? {
                Some((idx, data)) => {
                    self.next_index = idx + 1;
                    Ok(Some(Entry {
                        index: idx,
                        data: Data::from(data),
                    }))
                }
                None => {
                    if self.log.is_in_memory(self.next_index) {
                        self.state = ReaderState::Hot;
                        return self.try_read();
                    }
                    match self.log.find_segment_on_disk(self.next_index)? {
                        Some(seg_id) => {
                            let cursor =
                                SegmentCursor::open(self.log.dir(), seg_id, self.next_index)?;
                            self.state = ReaderState::Cold(cursor);
                            self.try_read()
                        }
                        None => Ok(None),
                    }
                }
            },
        }
    }

    fn make_entry(&self, index: u64, data: Data) -> Entry {
        Entry { index, data }
    }

    /// Blocks until an entry at `next_index` is available, or the reader/log is
    /// closed. Advances `next_index` on success.
    pub fn read(&mut self) -> Result<Entry> {
        loop {
            if let Some(entry) = self.try_read()? {
                return Ok(entry);
            }
            if self.log.is_closed() || self.closed {
                return Err(Error::LogClosed);
            }
            self.waiter.wait();
        }
    }

    /// Returns up to `limit` entries. Blocks only while the result would be
    /// empty — waits for the first entry, then drains opportunistically. This
    /// is the unit of fan-out the replication leader sends on the wire.
    pub fn read_at_most(&mut self, limit: usize) -> Result<Vec<Entry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(limit);
        out.push(self.read()?);
        while out.len() < limit {
            match self.try_read()? {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        Ok(out)
    }

    /// Idempotent; unsubscribes from the log and wakes the reader out of any wait.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.log.unsubscribe(self.sub_id);
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}
