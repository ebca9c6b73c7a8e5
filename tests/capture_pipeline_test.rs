//! Device stream to finalized log, through the capture worker thread.

use daq_scope::adapters::{MockAdapter, CMD_STOP};
use daq_scope::capture::{CaptureOptions, CaptureState, CaptureWorker, EndReason};
use daq_scope::config::ReaderSettings;
use daq_scope::data::sample::{CONTROL_CHANNEL, END_CODE, TICK_CODE};
use daq_scope::data::{LogSample, PagedLogReader, ValueWidth, WireSample};
use daq_scope::error::ScopeError;
use daq_scope::metadata::{LogInfo, PinDefinition, PinType, SessionMetadata};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

fn options(channels: usize) -> CaptureOptions {
    CaptureOptions {
        sync_timeout: Duration::from_millis(200),
        read_timeout: Duration::from_millis(2),
        quiesce_timeout: Duration::from_millis(200),
        retention_delay: 1_000,
        buffer_capacity: 64,
        tick_unit: 10,
        max_transport_faults: 5,
        read_buffer_records: 16,
        channel_count: channels,
    }
}

fn wire16(channel: i8, value: u16, tick: u32) -> Vec<u8> {
    WireSample::<u16>::new(channel, value, tick).to_bytes()
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_16_bit_session_across_counter_wrap() {
    let mock = MockAdapter::new();
    let start = u32::MAX - 40;
    let mut stream = wire16(CONTROL_CHANNEL, TICK_CODE, start);
    stream.extend(wire16(0, 1023, start + 5));
    stream.extend(wire16(1, 17, start + 10));
    stream.extend(wire16(CONTROL_CHANNEL, TICK_CODE, start + 20));
    // the counter wraps here
    stream.extend(wire16(0, 0, 3));
    stream.extend(wire16(CONTROL_CHANNEL, END_CODE, 9));
    // split mid-record
    let (a, b) = stream.split_at(10);
    mock.push_bytes(a.to_vec()).push_silence().push_bytes(b.to_vec());

    let tmp = NamedTempFile::new().unwrap();
    let handle = CaptureWorker::<u16, _, _>::new(mock, tmp.reopen().unwrap(), options(2))
        .spawn()
        .unwrap();
    let summary = handle.join().unwrap();
    assert_eq!(summary.end_reason, EndReason::EndMarker);
    assert_eq!(summary.wire_records, 5);
    assert_eq!(summary.records_written, 5);

    let mut reader = PagedLogReader::<u16>::open(tmp.path(), ReaderSettings::default()).unwrap();
    let records: Vec<LogSample<u16>> = std::iter::from_fn(|| reader.next().map(|c| c.sample)).collect();
    assert_eq!(records.len(), 5);
    for pair in records.windows(2) {
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }
    assert_eq!(records[0].value, 1023);
    assert!(records[2].is_tick() && records[3].is_tick());
    assert_eq!(records[2].source_channel(), 0);
    assert_eq!(records[3].source_channel(), 1);
    assert_eq!(records[3].value, 17);
    // 24 ticks from the broadcast to the record after the wrap
    assert_eq!(records[4].timestamp - records[2].timestamp, 240);
}

#[test]
fn test_reader_follows_live_capture() {
    let mock = MockAdapter::new();
    mock.push_bytes(WireSample::<u8>::new(CONTROL_CHANNEL, TICK_CODE as u8, 0).to_bytes());

    let tmp = NamedTempFile::new().unwrap();
    let handle = CaptureWorker::<u8, _, _>::new(mock.clone(), tmp.reopen().unwrap(), options(1))
        .spawn()
        .unwrap();
    wait_for(|| handle.state() == CaptureState::Streaming);

    let mut reader = PagedLogReader::<u8>::open(tmp.path(), ReaderSettings::default()).unwrap();
    assert!(reader.next().is_none());

    // each batch ages the previous one past the retention delay
    let mut seen = 0;
    for batch in 0..5u32 {
        let mut bytes = Vec::new();
        for i in 0..10u32 {
            let tick = batch * 1_000 + i * 10;
            bytes.extend(WireSample::<u8>::new(0, (i % 2) as u8, tick).to_bytes());
        }
        mock.push_bytes(bytes);
        wait_for(|| mock.pending() == 0);
        while reader.next().is_some() {
            seen += 1;
        }
    }

    mock.reply_to(
        CMD_STOP.to_vec(),
        WireSample::<u8>::new(CONTROL_CHANNEL, END_CODE as u8, 9_000).to_bytes(),
    );
    let summary = handle.stop().unwrap();
    assert_eq!(summary.end_reason, EndReason::StopRequested);
    assert_eq!(summary.records_written, 50);
    assert_eq!(mock.written(), CMD_STOP.to_vec());

    while reader.next().is_some() {
        seen += 1;
    }
    assert_eq!(seen, 50);
}

#[test]
fn test_garbled_sync_fails_the_session() {
    let mock = MockAdapter::new();
    mock.push_bytes(WireSample::<u8>::new(3, 1, 100).to_bytes());
    let tmp = NamedTempFile::new().unwrap();
    let handle = CaptureWorker::<u8, _, _>::new(mock, tmp.reopen().unwrap(), options(4))
        .spawn()
        .unwrap();
    let err = handle.join().unwrap_err();
    assert!(matches!(err, ScopeError::SyncMalformed { channel: 3, value: 1 }));
    assert!(err.is_sync_failure());
    assert_eq!(std::fs::metadata(tmp.path()).unwrap().len(), 0);
}

#[test]
fn test_finalized_capture_reports_metadata() {
    let mock = MockAdapter::new();
    let mut stream = WireSample::<u8>::new(CONTROL_CHANNEL, TICK_CODE as u8, 10).to_bytes();
    stream.extend(WireSample::<u8>::new(0, 1, 11).to_bytes());
    stream.extend(WireSample::<u8>::new(1, 1, 12).to_bytes());
    stream.extend(WireSample::<u8>::new(CONTROL_CHANNEL, END_CODE as u8, 13).to_bytes());
    mock.push_bytes(stream);

    let mut tmp = NamedTempFile::new().unwrap();
    let summary = CaptureWorker::<u8, _, _>::new(mock, tmp.reopen().unwrap(), options(2))
        .run()
        .unwrap();
    assert_eq!(summary.records_written, 2);

    let metadata = SessionMetadata::new(
        vec![
            PinDefinition::new(1, "gate", PinType::Input),
            PinDefinition::new(0, "clock", PinType::Output),
        ],
        ValueWidth::Bits8,
    );
    let data_end = metadata.append_to(tmp.as_file_mut()).unwrap();
    assert_eq!(data_end, 20);

    let info = LogInfo::inspect(tmp.path(), ValueWidth::Bits8).unwrap();
    assert_eq!(info.metadata, metadata);
    assert_eq!(info.data_end, Some(20));

    let mut reader = PagedLogReader::<u8>::open(tmp.path(), ReaderSettings::default()).unwrap();
    reader.set_limit(info.data_end);
    assert_eq!(reader.record_count(), 2);
}
