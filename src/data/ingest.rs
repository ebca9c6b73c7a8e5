//! Bounded, order-correcting buffer between the capture loop and the log file.
//!
//! Records from different device channels can arrive slightly out of timestamp
//! order. The buffer keeps a fixed-capacity ring sorted by timestamp using a
//! backward insertion scan from the tail, which is O(1) for ordered input and
//! O(k) for a record that is k positions late. Records leave the ring, oldest
//! first, once they are older than the retention delay relative to the newest
//! timestamp seen, or when room has to be made.
//!
//! The ring is index based: `head` is the slot of the oldest record and `len`
//! the number of buffered records. A flush that crosses the end of the backing
//! vector is encoded into one scratch buffer and written with a single call.
//!
//! A failed write may leave part of a batch on disk, so it poisons the buffer:
//! every later write fails without touching the sink.

use crate::data::sample::{LogSample, SampleValue};
use std::io::{self, Write};
use tracing::{debug, trace};

/// Ordered eviction FIFO in front of an append-only sink.
pub struct IngestionBuffer<T: SampleValue, W: Write> {
    slots: Vec<LogSample<T>>,
    head: usize,
    len: usize,
    current_max: u64,
    retention_delay: u64,
    sink: W,
    scratch: Vec<u8>,
    pushed: u64,
    written: u64,
    last_written: Option<u64>,
    poisoned: bool,
}

impl<T: SampleValue, W: Write> IngestionBuffer<T, W> {
    /// Creates a buffer holding up to `capacity` records (at least one).
    pub fn new(sink: W, capacity: usize, retention_delay: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![LogSample::new(0, T::default(), 0); capacity],
            head: 0,
            len: 0,
            current_max: 0,
            retention_delay,
            sink,
            scratch: Vec::with_capacity(capacity * LogSample::<T>::SIZE),
            pushed: 0,
            written: 0,
            last_written: None,
            poisoned: false,
        }
    }

    /// Inserts a record in timestamp order.
    ///
    /// A full buffer first writes at least its oldest record, so nothing is dropped.
    /// An error means that write failed; the record was not accepted.
    pub fn push(&mut self, sample: LogSample<T>) -> io::Result<()> {
        if self.len == self.slots.len() {
            trace!(capacity = self.slots.len(), "ingestion buffer full");
            self.flush(1)?;
        }

        if let Some(last) = self.last_written {
            if sample.timestamp < last {
                debug!(
                    channel = sample.channel,
                    timestamp = sample.timestamp,
                    last_written = last,
                    "record older than data already on disk"
                );
            }
        }

        let mut pos = self.len;
        while pos > 0 {
            let prev = self.slot(pos - 1);
            if self.slots[prev].timestamp <= sample.timestamp {
                break;
            }
            let to = self.slot(pos);
            self.slots[to] = self.slots[prev];
            pos -= 1;
        }
        let at = self.slot(pos);
        self.slots[at] = sample;
        self.len += 1;
        self.pushed += 1;
        if sample.timestamp > self.current_max {
            self.current_max = sample.timestamp;
        }
        Ok(())
    }

    /// Writes at least `min_batch` of the oldest records, plus every record that has
    /// aged past the retention delay. Returns the number of records written.
    pub fn flush(&mut self, min_batch: usize) -> io::Result<usize> {
        let mut count = min_batch.min(self.len);
        while count < self.len {
            let ts = self.slots[self.slot(count)].timestamp;
            if self.current_max.saturating_sub(ts) < self.retention_delay {
                break;
            }
            count += 1;
        }
        self.write_oldest(count)
    }

    /// Writes every buffered record regardless of age.
    pub fn flush_all(&mut self) -> io::Result<usize> {
        let count = self.len;
        let written = self.write_oldest(count)?;
        self.sink.flush()?;
        Ok(written)
    }

    fn write_oldest(&mut self, count: usize) -> io::Result<usize> {
        if self.poisoned {
            return Err(io::Error::other("log sink failed earlier; records withheld"));
        }
        if count == 0 {
            return Ok(0);
        }
        let size = LogSample::<T>::SIZE;
        self.scratch.clear();
        self.scratch.resize(count * size, 0);
        for i in 0..count {
            let sample = &self.slots[self.slot(i)];
            sample.encode_into(&mut self.scratch[i * size..(i + 1) * size]);
        }
        if let Err(e) = self.sink.write_all(&self.scratch) {
            self.poisoned = true;
            debug!(count, error = %e, "log write failed, buffer poisoned");
            return Err(e);
        }

        self.last_written = Some(self.slots[self.slot(count - 1)].timestamp);
        self.head = self.slot(count);
        self.len -= count;
        self.written += count as u64;
        trace!(count, buffered = self.len, "flushed records");
        Ok(count)
    }

    fn slot(&self, i: usize) -> usize {
        (self.head + i) % self.slots.len()
    }

    /// Buffered records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogSample<T>> + '_ {
        (0..self.len).map(move |i| &self.slots[self.slot(i)])
    }

    /// Number of records currently buffered.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of buffered records.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// True once a write to the sink has failed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Total records accepted by `push`.
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Total records written to the sink.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Newest timestamp seen so far.
    pub fn current_max(&self) -> u64 {
        self.current_max
    }

    /// Changes the retention delay; zero makes every record eligible.
    pub fn set_retention_delay(&mut self, retention_delay: u64) {
        self.retention_delay = retention_delay;
    }

    /// Gives back the sink. Buffered records are discarded; call `flush_all` first.
    pub fn into_inner(self) -> W {
        self.sink
    }
}
