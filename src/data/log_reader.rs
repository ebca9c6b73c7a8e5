//! Paged, memory-mapped reader over a growing log file.
//!
//! The log can be far larger than memory, so the reader maps one window of the
//! file at a time. A window starts on a chunk boundary and spans `pages_per_map`
//! chunks plus one extra chunk, so a record that straddles the last chunk
//! boundary of a page is still fully inside the mapping.
//!
//! Positions are global record indices. Every operation returns a [`Cursor`]
//! holding a decoded copy of the record, so nothing handed out refers into a
//! mapping that a later remap replaces. At most one mapping is alive per reader;
//! the old one is released before the next is created.
//!
//! The reader runs against a file that the capture worker may still be
//! appending to. Anything that goes wrong on the storage side (a short file, a
//! failed mapping, metadata that cannot be read) is reported as "no more data"
//! (`None`) and logged at debug level. A later call retries.
//!
//! # Safety
//!
//! Memory mapping is only sound while no one truncates the file. The log is
//! append-only for its whole life; a reader must be reset before a file it
//! maps is replaced.

use crate::config::ReaderSettings;
use crate::data::sample::{LogSample, SampleValue};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A record together with its position in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor<T: SampleValue> {
    /// Global record index.
    pub index: u64,
    /// The decoded record.
    pub sample: LogSample<T>,
}

/// One mapped window of the file.
struct Page {
    map: Mmap,
    offset: u64,
    /// First fully contained record index
    first: u64,
    /// One past the last fully contained record index
    end: u64,
}

impl Page {
    fn contains(&self, index: u64) -> bool {
        index >= self.first && index < self.end
    }

    fn sample<T: SampleValue>(&self, index: u64) -> Option<LogSample<T>> {
        if !self.contains(index) {
            return None;
        }
        let size = LogSample::<T>::SIZE;
        let start = usize::try_from(index * size as u64 - self.offset).ok()?;
        LogSample::decode(self.map.get(start..start + size)?)
    }
}

/// Bidirectional cursor over the records of a log file.
pub struct PagedLogReader<T: SampleValue> {
    file: File,
    path: PathBuf,
    chunk_size: u64,
    pages_per_map: u64,
    limit: Option<u64>,
    page: Option<Page>,
    position: Option<u64>,
    remaps: u64,
    _marker: PhantomData<T>,
}

impl<T: SampleValue> PagedLogReader<T> {
    /// Opens `path` for reading. Nothing is mapped until the first access.
    pub fn open<P: AsRef<Path>>(path: P, settings: ReaderSettings) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            file,
            path,
            chunk_size: settings.chunk_size.max(LogSample::<T>::SIZE as u64),
            pages_per_map: settings.pages_per_map.max(1),
            limit: None,
            page: None,
            position: None,
            remaps: 0,
            _marker: PhantomData,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Restricts reading to the first `limit` bytes (the data end of a finalized log).
    pub fn set_limit(&mut self, limit: Option<u64>) {
        self.limit = limit;
        self.reset();
    }

    /// Current byte limit, if any.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Number of complete records currently readable.
    pub fn record_count(&self) -> u64 {
        self.data_len() / LogSample::<T>::SIZE as u64
    }

    /// Number of mappings created so far.
    pub fn remap_count(&self) -> u64 {
        self.remaps
    }

    /// Index of the record the cursor is on.
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    /// Releases the mapping and forgets the position.
    pub fn reset(&mut self) {
        self.page = None;
        self.position = None;
    }

    /// Steps to the next record. Without a position this is the first record.
    ///
    /// At the end of the readable data the position is kept, so a later call
    /// picks up records appended in the meantime.
    pub fn next(&mut self) -> Option<Cursor<T>> {
        let target = self.position.map_or(0, |p| p + 1);
        let sample = self.load(target, false)?;
        self.position = Some(target);
        Some(Cursor {
            index: target,
            sample,
        })
    }

    /// Steps to the previous record. Returns `None` at the start of the log.
    pub fn prev(&mut self) -> Option<Cursor<T>> {
        let target = self.position?.checked_sub(1)?;
        let sample = self.load(target, true)?;
        self.position = Some(target);
        Some(Cursor {
            index: target,
            sample,
        })
    }

    /// The record under the cursor.
    pub fn current(&mut self) -> Option<Cursor<T>> {
        let index = self.position?;
        let sample = self.load(index, false)?;
        Some(Cursor { index, sample })
    }

    /// Moves to record `index`.
    pub fn seek(&mut self, index: u64) -> Option<Cursor<T>> {
        let sample = self.load(index, false)?;
        self.position = Some(index);
        Some(Cursor { index, sample })
    }

    /// Moves to the last complete record.
    pub fn last(&mut self) -> Option<Cursor<T>> {
        let index = self.record_count().checked_sub(1)?;
        let sample = self.load(index, true)?;
        self.position = Some(index);
        Some(Cursor { index, sample })
    }

    /// Moves to the first record with `timestamp >= t`.
    ///
    /// Returns the first record of the log if `t` precedes it, and `None` if `t`
    /// is past the last record. Steps linearly from the current position; a
    /// reader without a position probes from the start of the file.
    pub fn first_at_or_after(&mut self, t: u64) -> Option<Cursor<T>> {
        let current = match self.position {
            Some(_) => self.current(),
            None => None,
        };

        match current {
            Some(cursor) if t <= cursor.sample.timestamp => loop {
                match self.prev() {
                    Some(c) if c.sample.timestamp < t => return self.next(),
                    Some(_) => continue,
                    None => return self.seek(0),
                }
            },
            Some(_) => self.scan_forward(t),
            None => {
                self.position = None;
                self.scan_forward(t)
            }
        }
    }

    fn scan_forward(&mut self, t: u64) -> Option<Cursor<T>> {
        loop {
            let cursor = self.next()?;
            if cursor.sample.timestamp >= t {
                return Some(cursor);
            }
        }
    }

    /// Readable byte length: the file length, capped at the limit.
    fn data_len(&self) -> u64 {
        let len = match self.file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "cannot stat log file");
                0
            }
        };
        match self.limit {
            Some(limit) => len.min(limit),
            None => len,
        }
    }

    /// Decodes record `index`, remapping if the current page does not hold it.
    ///
    /// Backward loads place the record near the end of the new window so that
    /// further backward steps stay inside it.
    fn load(&mut self, index: u64, backward: bool) -> Option<LogSample<T>> {
        if let Some(page) = &self.page {
            if page.contains(index) {
                return page.sample(index);
            }
        }

        let size = LogSample::<T>::SIZE as u64;
        let record_end = (index + 1) * size;
        if record_end > self.data_len() {
            return None;
        }

        let anchor = if backward {
            record_end.saturating_sub(self.chunk_size * self.pages_per_map)
        } else {
            index * size
        };
        let offset = anchor - anchor % self.chunk_size;
        if !self.map_window(offset) {
            return None;
        }
        self.page.as_ref()?.sample(index)
    }

    fn map_window(&mut self, offset: u64) -> bool {
        self.page = None;

        let data_len = self.data_len();
        if offset >= data_len {
            return false;
        }
        let window = self.chunk_size * (self.pages_per_map + 1);
        let Ok(len) = usize::try_from(window.min(data_len - offset)) else {
            return false;
        };

        // SAFETY: the log file is append-only while any reader is open; the mapped
        // range lies within the length observed above.
        #[allow(unsafe_code)]
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map(&self.file) };
        let map = match map {
            Ok(map) => map,
            Err(e) => {
                debug!(offset, len, error = %e, "mapping log window failed");
                return false;
            }
        };

        let size = LogSample::<T>::SIZE as u64;
        let first = offset.div_ceil(size);
        let end = (offset + len as u64) / size;
        if first >= end {
            return false;
        }

        self.remaps += 1;
        debug!(offset, len, first, end, "mapped log window");
        self.page = Some(Page {
            map,
            offset,
            first,
            end,
        });
        true
    }
}
