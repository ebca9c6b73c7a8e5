//! Metadata block written at finalize and recovered on reopen.

use daq_scope::config::ReaderSettings;
use daq_scope::data::{LogSample, PagedLogReader, ValueWidth};
use daq_scope::metadata::{LogInfo, PinDefinition, PinType, SessionMetadata};
use std::fs::OpenOptions;
use std::io::Write;
use tempfile::NamedTempFile;

fn pins() -> Vec<PinDefinition> {
    vec![
        PinDefinition::new(0, "trigger in", PinType::Input),
        PinDefinition::new(1, "shutter", PinType::Output),
        PinDefinition::new(2, "laser", PinType::Pwm),
        PinDefinition::new(4, "photodiode", PinType::Adc),
    ]
}

#[test]
fn test_metadata_roundtrip_16_bit() {
    let mut tmp = NamedTempFile::new().unwrap();
    for i in 0..100u64 {
        tmp.write_all(&LogSample::<u16>::new((i % 5) as i8, (i * 37 % 1024) as u16, i * 1_000).to_bytes())
            .unwrap();
    }
    let metadata = SessionMetadata::new(pins(), ValueWidth::Bits16);
    let data_end = metadata.append_to(tmp.as_file_mut()).unwrap();
    assert_eq!(data_end, 100 * 11);

    // width fallback is ignored when the block is present
    let info = LogInfo::inspect(tmp.path(), ValueWidth::Bits8).unwrap();
    assert!(!info.inferred);
    assert_eq!(info.metadata, metadata);
    assert_eq!(info.metadata.channel_count(), 5);
    assert_eq!(info.metadata.pin(4).map(|p| p.name.as_str()), Some("photodiode"));
    assert!(info.metadata.pin(3).is_none());

    let mut reader = PagedLogReader::<u16>::open(tmp.path(), ReaderSettings::default()).unwrap();
    reader.set_limit(info.data_end);
    assert_eq!(reader.last().unwrap().index, 99);
}

#[test]
fn test_unfinalized_log_infers_channels() {
    let mut tmp = NamedTempFile::new().unwrap();
    // the opening report: channels 0..3 in order
    for ch in 0..3i8 {
        tmp.write_all(&LogSample::<u8>::new(ch, 0, 5).to_bytes()).unwrap();
    }
    tmp.write_all(&LogSample::<u8>::new(1, 1, 9).to_bytes()).unwrap();
    tmp.flush().unwrap();

    let info = LogInfo::inspect(tmp.path(), ValueWidth::Bits8).unwrap();
    assert!(info.inferred);
    assert_eq!(info.data_end, None);
    let names: Vec<&str> = info.metadata.pins.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["1", "2", "3"]);
}

#[test]
fn test_trailing_garbage_is_not_metadata() {
    let mut tmp = NamedTempFile::new().unwrap();
    for i in 0..10u64 {
        tmp.write_all(&LogSample::<u8>::new(0, 1, i).to_bytes()).unwrap();
    }
    tmp.flush().unwrap();

    // a pointer that lands mid-record
    let mut file = OpenOptions::new().append(true).open(tmp.path()).unwrap();
    file.write_all(b"bits\t8\n").unwrap();
    file.write_all(&95u64.to_le_bytes()).unwrap();

    assert!(SessionMetadata::read_from(tmp.path()).unwrap().is_none());
}
