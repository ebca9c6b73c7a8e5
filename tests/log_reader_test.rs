//! Paged reader properties over generated logs.

use daq_scope::config::ReaderSettings;
use daq_scope::data::{IngestionBuffer, LogSample, PagedLogReader};
use proptest::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

const SMALL_PAGES: ReaderSettings = ReaderSettings {
    chunk_size: 4096,
    pages_per_map: 2,
};

/// Writes records with the given timestamp gaps, channels cycling over four.
fn write_log(gaps: &[u64]) -> (NamedTempFile, Vec<LogSample<u16>>) {
    let mut tmp = NamedTempFile::new().expect("temp file");
    let mut records = Vec::with_capacity(gaps.len());
    let mut ts = 1_000u64;
    let mut bytes = Vec::new();
    for (i, gap) in gaps.iter().enumerate() {
        ts += gap;
        let record = LogSample::<u16>::new((i % 4) as i8, (i % 1024) as u16, ts);
        bytes.extend(record.to_bytes());
        records.push(record);
    }
    tmp.write_all(&bytes).expect("write log");
    tmp.flush().expect("flush log");
    (tmp, records)
}

#[test]
fn test_forward_read_spans_several_remaps() {
    let gaps = vec![3u64; 6_000];
    let (tmp, records) = write_log(&gaps);
    let mut reader = PagedLogReader::<u16>::open(tmp.path(), SMALL_PAGES).unwrap();

    let mut read = Vec::new();
    while let Some(cursor) = reader.next() {
        read.push(cursor.sample);
    }
    assert_eq!(read, records);
    assert!(reader.remap_count() >= 3, "remaps: {}", reader.remap_count());
}

#[test]
fn test_ingested_log_reads_back_in_order() {
    let tmp = NamedTempFile::new().unwrap();
    let sink = tmp.reopen().unwrap();
    let mut buffer = IngestionBuffer::<u8, _>::new(sink, 16, 50);
    // blocks of four channels arriving slightly out of order
    for block in 0..500u64 {
        for ch in [2i8, 0, 3, 1] {
            buffer
                .push(LogSample::new(ch, 1, block * 100 + ch as u64 * 10))
                .unwrap();
        }
    }
    buffer.flush_all().unwrap();
    assert_eq!(buffer.written(), 2_000);

    let mut reader = PagedLogReader::<u8>::open(tmp.path(), SMALL_PAGES).unwrap();
    let mut last = 0;
    let mut count = 0;
    while let Some(cursor) = reader.next() {
        assert!(cursor.sample.timestamp >= last);
        last = cursor.sample.timestamp;
        count += 1;
    }
    assert_eq!(count, 2_000);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// k steps forward then k steps back return to the start.
    #[test]
    fn next_then_prev_returns_to_start(
        gaps in proptest::collection::vec(0u64..50, 1..4_000),
        k in 1usize..4_000,
    ) {
        let (tmp, records) = write_log(&gaps);
        let k = k.min(records.len());
        let mut reader = PagedLogReader::<u16>::open(tmp.path(), SMALL_PAGES).unwrap();

        for i in 0..k {
            let cursor = reader.next().unwrap();
            prop_assert_eq!(cursor.index, i as u64);
            prop_assert_eq!(cursor.sample, records[i]);
        }
        for i in (0..k - 1).rev() {
            let cursor = reader.prev().unwrap();
            prop_assert_eq!(cursor.sample, records[i]);
        }
        prop_assert_eq!(reader.position(), Some(0));
        prop_assert!(reader.prev().is_none());
    }

    /// `first_at_or_after` finds the first record at or past `t`.
    #[test]
    fn first_at_or_after_is_exact(
        gaps in proptest::collection::vec(0u64..50, 1..3_000),
        start in 0usize..3_000,
        probe in 0u64..200_000,
    ) {
        let (tmp, records) = write_log(&gaps);
        let mut reader = PagedLogReader::<u16>::open(tmp.path(), SMALL_PAGES).unwrap();
        // start the search from an arbitrary position
        reader.seek((start % records.len()) as u64);

        let expected = records.iter().position(|r| r.timestamp >= probe);
        let found = reader.first_at_or_after(probe);
        match expected {
            Some(i) => {
                let cursor = found.unwrap();
                prop_assert_eq!(cursor.index, i as u64);
                prop_assert_eq!(cursor.sample, records[i]);
            }
            None => prop_assert!(found.is_none()),
        }
    }
}
