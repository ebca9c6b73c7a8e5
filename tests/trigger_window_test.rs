//! Trigger window behaviour against logs that grow between ticks.

use daq_scope::config::ReaderSettings;
use daq_scope::data::{LogSample, PagedLogReader};
use daq_scope::view::{
    TriggerMode, TriggerPolarity, TriggerSettings, TriggerWindow, ViewEvent, ViewPoller,
};
use std::io::Write;
use std::time::Instant;
use tempfile::NamedTempFile;

const PERIOD: u64 = 1_000;

fn append(tmp: &mut NamedTempFile, records: &[LogSample<u8>]) {
    for r in records {
        tmp.write_all(&r.to_bytes()).unwrap();
    }
    tmp.flush().unwrap();
}

fn poller(tmp: &NamedTempFile, mode: TriggerMode) -> ViewPoller<u8> {
    let reader = PagedLogReader::open(tmp.path(), ReaderSettings::default()).unwrap();
    let trigger = TriggerSettings {
        enabled: true,
        channel: 1,
        polarity: TriggerPolarity::Up,
        mode,
    };
    ViewPoller::new(TriggerWindow::new(reader, 2, PERIOD, trigger))
}

/// A pulse on channel 1 at `at`, with channel 0 toggling around it.
fn pulse(at: u64) -> Vec<LogSample<u8>> {
    vec![
        LogSample::new(0, 1, at - 50),
        LogSample::new(1, 1, at),
        LogSample::new(1, 0, at + 20),
        LogSample::new(0, 0, at + 300),
    ]
}

#[test]
fn test_single_shot_ignores_later_edges() {
    let mut tmp = NamedTempFile::new().unwrap();
    let mut p = poller(&tmp, TriggerMode::Single);

    append(&mut tmp, &pulse(10_000));
    let events = p.tick(Instant::now());
    assert_eq!(events, vec![ViewEvent::Triggered { at: 10_000 }]);
    let window = (p.window().first(), p.window().last());
    assert_eq!(window, (9_900, 10_900));

    // data past the window end completes the shot
    append(&mut tmp, &[LogSample::new(0, 1, 12_000)]);
    let events = p.tick(Instant::now());
    assert_eq!(events, vec![ViewEvent::Disarmed]);
    assert!(!p.window().is_armed());

    // further matching edges do not move the window
    for at in [20_000, 30_000, 40_000] {
        append(&mut tmp, &pulse(at));
        assert!(p.tick(Instant::now()).is_empty());
        assert_eq!((p.window().first(), p.window().last()), window);
    }

    // re-arming catches the next edge
    p.window_mut().set_arm(true);
    append(&mut tmp, &pulse(50_000));
    assert_eq!(p.tick(Instant::now()), vec![ViewEvent::Triggered { at: 50_000 }]);
    assert_eq!(p.window().first(), 49_900);
}

#[test]
fn test_normal_mode_retriggers() {
    let mut tmp = NamedTempFile::new().unwrap();
    let mut p = poller(&tmp, TriggerMode::Normal);

    let mut records = pulse(10_000);
    records.extend(pulse(20_000));
    append(&mut tmp, &records);

    assert_eq!(p.tick(Instant::now()), vec![ViewEvent::Triggered { at: 10_000 }]);
    // the first record past the window is also the start of the next pulse
    assert!(p.tick(Instant::now()).is_empty());
    assert!(!p.window().is_triggered());
    assert_eq!(p.tick(Instant::now()), vec![ViewEvent::Triggered { at: 20_000 }]);
    assert!(p.window().is_armed());
}

#[test]
fn test_channel_values_at_window_start() {
    let mut tmp = NamedTempFile::new().unwrap();
    let mut p = poller(&tmp, TriggerMode::Normal);
    append(
        &mut tmp,
        &[
            LogSample::new(0, 1, 100),
            LogSample::tick(0, 1, 5_000),
            LogSample::new(1, 1, 10_000),
        ],
    );
    p.tick(Instant::now());
    let channels = p.window().channels();
    // channel 0 from the tick record, channel 1 never seen before the window
    assert_eq!(channels[0].value, Some(1));
    assert_eq!(channels[0].since, 5_000);
    assert_eq!(channels[1].value, None);

    let samples = p.window_mut().samples_in_window(16);
    assert_eq!(samples, vec![LogSample::new(1, 1, 10_000)]);
}
