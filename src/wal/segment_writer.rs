//! The writer side of a single segment file: mmap-backed, append-only, rolled when full.
//!
//! Grounded on the same `memmap2`-backed create/extend/flush lifecycle the rest of
//! this corpus uses for segment storage, adapted to the varint length-prefixed
//! record format this log uses on disk.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::wal::error::{Error, Result};
use crate::wal::segment::{self, HEADER_SIZE};
use crate::wal::varint;

pub struct SegmentWriter {
    dir: PathBuf,
    first_index: u64,
    segment_size_bytes: u64,
    file: File,
    mmap: MmapMut,
    write_offset: usize,
    count: u64,
}

impl SegmentWriter {
    pub fn create(dir: &Path, first_index: u64, segment_size_bytes: u64) -> Result<Self> {
        let file = segment::create_segment_file(dir, first_index)?;
        file.set_len(segment_size_bytes)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            dir: dir.to_path_buf(),
            first_index,
            segment_size_bytes,
            file,
            mmap,
            write_offset: HEADER_SIZE,
            count: 0,
        })
    }

    /// Reopens an existing segment file for continued appends, recovering
    /// `write_offset`/`count` by scanning its valid records.
    pub fn open_for_recovery(dir: &Path, first_index: u64, segment_size_bytes: u64) -> Result<Self> {
        let file = segment::open_segment_file(dir, first_index)?;
        let current_len = file.metadata()?.len();
        if current_len < segment_size_bytes {
            file.set_len(segment_size_bytes)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let records = segment::scan_records_in_slice(&mmap, HEADER_SIZE as u64);
        let write_offset = records
            .last()
            .map(|r| r.end_offset as usize)
            .unwrap_or(HEADER_SIZE);
        let count = records.len() as u64;
        Ok(Self {
            dir: dir.to_path_buf(),
            first_index,
            segment_size_bytes,
            file,
            mmap,
            write_offset,
            count,
        })
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn next_index(&self) -> u64 {
        self.first_index + self.count
    }

    pub fn needs_roll(&self, record_len: usize) -> bool {
        let framed_len = varint::encoded_len(record_len as u64) + record_len;
        self.write_offset as u64 + framed_len as u64 > self.segment_size_bytes
    }

    /// Appends one record's raw bytes, returning the bytes physically written
    /// (varint prefix + payload) so the caller can track `unsynced_bytes`.
    pub fn append(&mut self, data: &[u8]) -> Result<usize> {
        let mut framed = Vec::with_capacity(varint::MAX_VARINT_LEN + data.len());
        varint::encode(data.len() as u64, &mut framed);
        framed.extend_from_slice(data);
        if self.write_offset + framed.len() > self.mmap.len() {
            return Err(Error::WriteFailure("segment full".into()));
        }
        self.mmap[self.write_offset..self.write_offset + framed.len()].copy_from_slice(&framed);
        self.write_offset += framed.len();
        self.count += 1;
        Ok(framed.len())
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| Error::FsyncFailure(e.to_string()))
    }

    /// Truncates the file to the actually-used length and flushes. Called when
    /// rolling to a new segment or closing the log.
    pub fn seal(&mut self) -> Result<()> {
        self.flush()?;
        self.file.set_len(self.write_offset as u64)?;
        Ok(())
    }

    pub fn roll(mut self) -> Result<Self> {
        self.seal()?;
        Self::create(&self.dir, self.next_index(), self.segment_size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_reopen_recovers_offset() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), 1, 4096).unwrap();
        writer.append(b"hello").unwrap();
        writer.append(b"world").unwrap();
        assert_eq!(writer.count(), 2);
        writer.seal().unwrap();
        drop(writer);

        let reopened = SegmentWriter::open_for_recovery(dir.path(), 1, 4096).unwrap();
        assert_eq!(reopened.count(), 2);
        assert_eq!(reopened.next_index(), 3);
    }

    #[test]
    fn needs_roll_accounts_for_varint_prefix() {
        let writer = SegmentWriter::create(dir_fixture().path(), 1, HEADER_SIZE as u64 + 4).unwrap();
        assert!(writer.needs_roll(10));
        assert!(!writer.needs_roll(2));
    }

    fn dir_fixture() -> tempfile::TempDir {
        tempdir().unwrap()
    }

    #[test]
    fn roll_creates_new_segment_at_next_index() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), 1, 4096).unwrap();
        writer.append(b"a").unwrap();
        writer.append(b"b").unwrap();
        let rolled = writer.roll().unwrap();
        assert_eq!(rolled.first_index(), 3);
        assert_eq!(rolled.count(), 0);
    }
}
