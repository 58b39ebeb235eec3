//! Cold-path disk scanner: reads a sealed segment file sequentially with a
//! buffered reader, used by [`crate::wal::reader::Reader`] once it falls out of
//! the in-memory cache, by recovery, and by the replication leader's cold path.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::wal::error::{Error, Result};
use crate::wal::segment::{self, HEADER_SIZE, MAX_RECORD_LEN};
use crate::wal::varint;

/// Matches the spec's 64 MiB cold-scan buffer.
const SCAN_BUFFER_SIZE: usize = 64 * 1024 * 1024;

pub struct SegmentCursor {
    reader: BufReader<File>,
    next_index: u64,
}

impl SegmentCursor {
    /// Opens the segment owning `first_index` and fast-forwards to `start_index`
    /// (which must be `>= first_index`).
    pub fn open(dir: &Path, first_index: u64, start_index: u64) -> Result<Self> {
        let file = segment::open_segment_file(dir, first_index)?;
        let reader = BufReader::with_capacity(SCAN_BUFFER_SIZE, file);
        let mut cursor = Self {
            reader,
            next_index: first_index,
        };
        cursor.seek_to(HEADER_SIZE as u64)?;
        while cursor.next_index < start_index {
            if cursor.next_raw()?.is_none() {
                break;
            }
        }
        Ok(cursor)
    }

    fn seek_to(&mut self, offset: u64) -> Result<()> {
        use std::io::Seek;
        self.reader.seek(std::io::SeekFrom::Start(offset))?;
        Ok(())
    }

    fn next_raw(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = Vec::with_capacity(varint::MAX_VARINT_LEN);
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    len_buf.push(byte[0]);
                    if byte[0] & 0x80 == 0 {
                        break;
                    }
                    if len_buf.len() > varint::MAX_VARINT_LEN {
                        return Err(Error::Corrupt("varint longer than 10 bytes"));
                    }
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        let (len, _) = varint::decode(&len_buf)?.ok_or(Error::Corrupt("truncated varint"))?;
        let len = len as usize;
        if len == 0 || len > MAX_RECORD_LEN {
            return Ok(None);
        }
        let mut data = vec![0u8; len];
        if self.reader.read_exact(&mut data).is_err() {
            return Ok(None);
        }
        self.next_index += 1;
        Ok(Some(data))
    }

    /// Returns the next `(index, data)` pair, or `None` at end of this segment's
    /// valid data (the caller decides whether to open the next segment or switch
    /// back to hot mode).
    pub fn next(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        let index = self.next_index;
        Ok(self.next_raw()?.map(|data| (index, data)))
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}
