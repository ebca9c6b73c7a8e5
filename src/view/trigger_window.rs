//! Oscilloscope-style window over the log: which slice of time is "current".
//!
//! The window `[first, last)` of width `period` either rolls along with the
//! newest data or locks onto a trigger event on one channel. `armed`,
//! `frozen` and `triggered` are independent flags:
//!
//! - `frozen` is set by pan and zoom. A frozen window ignores poll ticks.
//! - `triggered` means the window is showing data up to `last`. Once the data
//!   passes `last`, a rolling window slides on; a triggered window starts
//!   waiting for the next trigger.
//! - `armed` only matters in single mode, where the window disarms after one
//!   trigger and stays put until re-armed.
//!
//! After a trigger the reader is rewound with [`TriggerWindow::wind_back`] so
//! that every channel has a known value at the start of the window. Channels
//! with no record before that point stay unknown (`None`) and must be shown
//! as such.
//!
//! The window is owned by a single consumer and driven by explicit calls to
//! [`TriggerWindow::tick`].

use crate::data::log_reader::{Cursor, PagedLogReader};
use crate::data::sample::{LogSample, SampleValue};
use crate::view::periods::{find_period, period_at};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Level that counts as a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerPolarity {
    /// Value zero
    Down,
    /// Any non-zero value
    #[default]
    Up,
}

impl TriggerPolarity {
    /// Whether `value` matches this polarity.
    pub fn matches<T: SampleValue>(self, value: T) -> bool {
        match self {
            TriggerPolarity::Down => !value.is_high(),
            TriggerPolarity::Up => value.is_high(),
        }
    }
}

/// What happens after a triggered window has been shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Wait for the next trigger, but force one after a timeout
    #[default]
    Auto,
    /// Wait for the next trigger indefinitely
    Normal,
    /// Disarm after one trigger
    Single,
}

/// Trigger configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    /// Lock the window onto trigger events; otherwise it rolls
    pub enabled: bool,
    /// Channel watched for the trigger
    pub channel: usize,
    /// Level that fires the trigger
    pub polarity: TriggerPolarity,
    /// Behaviour after a trigger
    pub mode: TriggerMode,
}

/// Notifications for the view layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewEvent {
    /// A matching record fired the trigger
    Triggered {
        /// Timestamp of the trigger record
        at: u64,
    },
    /// Auto mode timed out and forced the window onto the newest data
    AutoTriggered {
        /// Start of the new window
        at: u64,
    },
    /// A single-shot trigger fired; the window is no longer armed
    Disarmed,
}

/// Last known value of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState<T: SampleValue> {
    /// Value, or `None` while unknown
    pub value: Option<T>,
    /// Timestamp the value was seen at
    pub since: u64,
}

impl<T: SampleValue> Default for ChannelState<T> {
    fn default() -> Self {
        Self {
            value: None,
            since: 0,
        }
    }
}

/// Persistable snapshot of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    /// Window start
    pub first: u64,
    /// Window end
    pub last: u64,
    /// Window width
    pub period: u64,
    /// Armed flag
    pub armed: bool,
    /// Frozen flag
    pub frozen: bool,
    /// Triggered flag
    pub triggered: bool,
    /// Trigger configuration
    pub trigger: TriggerSettings,
}

/// The view state machine, owning the reader it pages through.
pub struct TriggerWindow<T: SampleValue> {
    reader: PagedLogReader<T>,
    first: u64,
    last: u64,
    period: u64,
    current: u64,
    armed: bool,
    frozen: bool,
    triggered: bool,
    trigger: TriggerSettings,
    delay: Duration,
    timeout_started: Option<Instant>,
    channels: Vec<ChannelState<T>>,
    events: Vec<ViewEvent>,
}

fn auto_delay(period: u64) -> Duration {
    Duration::from_millis(period / 10_000)
}

impl<T: SampleValue> TriggerWindow<T> {
    /// Creates a window of width `period` over `reader`.
    pub fn new(
        reader: PagedLogReader<T>,
        channel_count: usize,
        period: u64,
        trigger: TriggerSettings,
    ) -> Self {
        let period = period.max(1);
        Self {
            reader,
            first: 0,
            last: period,
            period,
            current: 0,
            armed: true,
            frozen: false,
            triggered: !trigger.enabled,
            trigger,
            delay: auto_delay(period),
            timeout_started: None,
            channels: vec![ChannelState::default(); channel_count],
            events: Vec::new(),
        }
    }

    /// Restarts from the beginning of the log, armed and waiting.
    pub fn start(&mut self) {
        self.reader.reset();
        self.current = 0;
        self.first = 0;
        self.last = self.period;
        self.channels.fill(ChannelState::default());
        self.armed = true;
        self.triggered = !self.trigger.enabled;
        self.timeout_started = None;
    }

    /// Advances the state machine by one poll.
    pub fn tick(&mut self, now: Instant) {
        if self.frozen {
            return;
        }

        if self.triggered {
            self.advance();
            if self.current > self.last {
                if !self.trigger.enabled {
                    self.roll();
                } else {
                    self.triggered = false;
                    match self.trigger.mode {
                        TriggerMode::Auto => self.timeout_started = Some(now),
                        TriggerMode::Normal => {}
                        TriggerMode::Single => {
                            self.armed = false;
                            self.events.push(ViewEvent::Disarmed);
                            debug!("single-shot trigger disarmed");
                        }
                    }
                }
            }
            return;
        }

        self.scan_for_trigger();

        if !self.triggered && self.trigger.mode == TriggerMode::Auto {
            let started = *self.timeout_started.get_or_insert(now);
            if now.saturating_duration_since(started) > self.delay {
                self.triggered = true;
                self.armed = true;
                self.first = self.current;
                self.last = self.first + self.period;
                self.events.push(ViewEvent::AutoTriggered { at: self.first });
                trace!(first = self.first, "auto trigger");
            }
        }
    }

    /// Reads up to the first record past the window end.
    fn advance(&mut self) {
        while let Some(cursor) = self.reader.next() {
            self.observe(&cursor.sample);
            if cursor.sample.timestamp > self.last {
                if self.trigger.enabled {
                    // leave it for the trigger scan
                    self.reader.prev();
                }
                break;
            }
        }
    }

    /// Slides a rolling window forward.
    fn roll(&mut self) {
        if self.current - self.last > self.period {
            self.first = self.current;
        } else {
            self.first += self.period;
        }
        self.last = self.first + self.period;
        trace!(first = self.first, last = self.last, "window rolled");
    }

    fn scan_for_trigger(&mut self) {
        while let Some(cursor) = self.reader.next() {
            let sample = cursor.sample;
            self.current = sample.timestamp;
            if self.trigger.mode == TriggerMode::Single && !self.armed {
                continue;
            }
            self.observe(&sample);
            if self.is_trigger(&sample) {
                self.triggered = true;
                self.events.push(ViewEvent::Triggered {
                    at: sample.timestamp,
                });
                debug!(at = sample.timestamp, channel = sample.channel, "trigger");
                self.wind_back(sample.timestamp.saturating_sub(self.period / 10));
                break;
            }
        }
    }

    fn is_trigger(&self, sample: &LogSample<T>) -> bool {
        !sample.is_tick()
            && sample.channel as usize == self.trigger.channel
            && self.trigger.polarity.matches(sample.value)
    }

    fn observe(&mut self, sample: &LogSample<T>) {
        self.current = sample.timestamp;
        if let Some(state) = self.channels.get_mut(sample.source_channel()) {
            state.value = Some(sample.value);
            state.since = sample.timestamp;
        }
    }

    /// Moves the window to start at `first`, rewinding the reader so every
    /// channel's value at `first` is known where the log allows.
    pub fn wind_back(&mut self, first: u64) {
        self.first = first;
        self.last = first + self.period;

        let mut cursor = self.reader.current();
        while let Some(c) = cursor {
            self.current = c.sample.timestamp;
            if c.sample.timestamp < first {
                break;
            }
            cursor = self.reader.prev();
        }

        for state in &mut self.channels {
            *state = ChannelState {
                value: None,
                since: self.current,
            };
        }

        match cursor {
            Some(boundary) => {
                self.resolve_channels(boundary);
                // continue reading right after the boundary record
                self.reader.seek(boundary.index);
            }
            None => self.reader.reset(),
        }
    }

    fn resolve_channels(&mut self, boundary: Cursor<T>) {
        let mut unresolved = self.channels.len();
        let mut cursor = Some(boundary);
        // timestamp of the tick group being walked through
        let mut group = None;
        while unresolved > 0 {
            let Some(c) = cursor else {
                break;
            };
            if let Some(ts) = group {
                if !c.sample.is_tick() || c.sample.timestamp != ts {
                    // a tick group repeats every channel known at that time,
                    // so nothing older can resolve the rest
                    trace!(unresolved, group = ts, "channels unknown before last tick");
                    return;
                }
            }
            if c.sample.is_tick() {
                group = Some(c.sample.timestamp);
            }
            if let Some(state) = self.channels.get_mut(c.sample.source_channel()) {
                if state.value.is_none() {
                    state.value = Some(c.sample.value);
                    state.since = c.sample.timestamp;
                    unresolved -= 1;
                }
            }
            cursor = self.reader.prev();
        }
        if unresolved > 0 {
            debug!(unresolved, "start of log reached with channels unknown");
        }
    }

    fn wind_to(&mut self, first: u64) {
        if first < self.current {
            self.wind_back(first);
        } else {
            self.first = first;
            self.last = first + self.period;
        }
    }

    /// Changes the window width. Keeping the center freezes the window.
    pub fn set_period(&mut self, period: u64, keep_center: bool) {
        let period = period.max(1);
        if !keep_center {
            self.first = self.current;
        } else {
            self.frozen = true;
            let shift = (self.period as i64 - period as i64) / 2;
            self.wind_to(self.first.saturating_add_signed(shift));
        }
        self.period = period;
        self.last = self.first + period;
        self.delay = auto_delay(period);
    }

    /// Shows `[first, last)`, or `[first, first + period)` without `last`.
    pub fn set_range(&mut self, first: u64, last: Option<u64>) {
        self.first = first;
        match last {
            Some(last) if last > first => {
                self.last = last;
                self.period = last - first;
            }
            _ => self.last = first + self.period,
        }
        if self.last < self.current {
            self.frozen = true;
        }
        self.wind_to(first);
        self.delay = auto_delay(self.period);
    }

    /// Pans by `amount` periods, rounded to tenths, and freezes.
    pub fn move_by(&mut self, amount: f64) {
        self.frozen = true;
        let tenths = (amount * 10.0).round() as i64;
        let shift = (self.period / 10) as i64 * tenths;
        self.wind_to(self.first.saturating_add_signed(shift));
    }

    /// Arming unfreezes; in single mode it also re-arms the trigger.
    pub fn set_arm(&mut self, on: bool) {
        self.frozen = !on;
        if on && self.trigger.mode == TriggerMode::Single {
            self.set_trigger_mode(TriggerMode::Single);
        }
    }

    /// Switches between triggered and rolling display.
    pub fn set_trigger_enabled(&mut self, enabled: bool) {
        self.trigger.enabled = enabled;
        self.triggered = !enabled;
    }

    /// Sets the trigger level.
    pub fn set_trigger_polarity(&mut self, polarity: TriggerPolarity) {
        self.trigger.polarity = polarity;
    }

    /// Sets the trigger channel.
    pub fn set_trigger_channel(&mut self, channel: usize) {
        self.trigger.channel = channel;
    }

    /// Sets the trigger mode; unfreezes and re-arms.
    pub fn set_trigger_mode(&mut self, mode: TriggerMode) {
        self.frozen = false;
        self.armed = true;
        self.trigger.mode = mode;
        if self.trigger.enabled {
            self.triggered = false;
        }
    }

    /// Fits the whole log: the shortest period covering first to last record.
    pub fn zoom_all(&mut self) -> bool {
        let Some(first) = self.reader.seek(0) else {
            return false;
        };
        let last = self.reader.last().map_or(first.sample.timestamp, |c| c.sample.timestamp);
        self.current = last;
        let start = first.sample.timestamp;
        let period = period_at(find_period(last.saturating_sub(start)));
        self.set_range(start, Some(start + period));
        true
    }

    /// Records inside the window, at most `max`. The reader position is kept.
    pub fn samples_in_window(&mut self, max: usize) -> Vec<LogSample<T>> {
        let saved = self.reader.position();
        let mut samples = Vec::new();
        let mut cursor = self.reader.first_at_or_after(self.first);
        while let Some(c) = cursor {
            if c.sample.timestamp >= self.last || samples.len() >= max {
                break;
            }
            samples.push(c.sample);
            cursor = self.reader.next();
        }
        match saved {
            Some(index) => {
                self.reader.seek(index);
            }
            None => self.reader.reset(),
        }
        samples
    }

    /// Snapshot for persistence.
    pub fn state(&self) -> ViewState {
        ViewState {
            first: self.first,
            last: self.last,
            period: self.period,
            armed: self.armed,
            frozen: self.frozen,
            triggered: self.triggered,
            trigger: self.trigger,
        }
    }

    /// Restores a snapshot. The reader starts over from the beginning of the log.
    pub fn restore(&mut self, state: &ViewState) {
        self.first = state.first;
        self.period = state.period.max(1);
        self.last = state.last.max(state.first);
        self.armed = state.armed;
        self.frozen = state.frozen;
        self.triggered = state.triggered;
        self.trigger = state.trigger;
        self.delay = auto_delay(self.period);
        self.timeout_started = None;
        self.current = 0;
        self.reader.reset();
    }

    /// Takes the notifications raised since the last call.
    pub fn drain_events(&mut self) -> Vec<ViewEvent> {
        std::mem::take(&mut self.events)
    }

    /// Window start.
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Window end.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Window width.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Timestamp of the newest record read.
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Armed flag.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Frozen flag.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Triggered flag.
    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Trigger configuration.
    pub fn trigger(&self) -> TriggerSettings {
        self.trigger
    }

    /// Auto-trigger timeout.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Last known value per channel.
    pub fn channels(&self) -> &[ChannelState<T>] {
        &self.channels
    }

    /// The underlying reader.
    pub fn reader_mut(&mut self) -> &mut PagedLogReader<T> {
        &mut self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderSettings;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SETTINGS: ReaderSettings = ReaderSettings {
        chunk_size: 4096,
        pages_per_map: 2,
    };

    fn log_of(records: &[LogSample<u8>]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        for r in records {
            tmp.write_all(&r.to_bytes()).unwrap();
        }
        tmp.flush().unwrap();
        tmp
    }

    fn window(tmp: &NamedTempFile, period: u64, trigger: TriggerSettings) -> TriggerWindow<u8> {
        let reader = PagedLogReader::open(tmp.path(), SETTINGS).unwrap();
        TriggerWindow::new(reader, 2, period, trigger)
    }

    fn normal_trigger(mode: TriggerMode) -> TriggerSettings {
        TriggerSettings {
            enabled: true,
            channel: 1,
            polarity: TriggerPolarity::Up,
            mode,
        }
    }

    #[test]
    fn test_polarity() {
        assert!(TriggerPolarity::Up.matches(1u8));
        assert!(TriggerPolarity::Up.matches(512u16));
        assert!(!TriggerPolarity::Up.matches(0u8));
        assert!(TriggerPolarity::Down.matches(0u16));
    }

    #[test]
    fn test_rolling_window_slides_one_period() {
        let records: Vec<_> = (0..30u64).map(|i| LogSample::new(0, 1, i * 10)).collect();
        let tmp = log_of(&records);
        let mut w = window(&tmp, 100, TriggerSettings::default());
        assert!(w.is_triggered());
        w.tick(Instant::now());
        // read up to 110, the first record past the window
        assert_eq!(w.current(), 110);
        assert_eq!((w.first(), w.last()), (100, 200));
        w.tick(Instant::now());
        assert_eq!((w.first(), w.last()), (200, 300));
    }

    #[test]
    fn test_trigger_winds_back_and_resolves_channels() {
        let records = vec![
            LogSample::new(0, 1, 100),
            LogSample::new(1, 0, 150),
            LogSample::tick(0, 1, 500),
            LogSample::tick(1, 0, 500),
            LogSample::new(1, 1, 1000),
            LogSample::new(0, 0, 1010),
        ];
        let tmp = log_of(&records);
        let mut w = window(&tmp, 200, normal_trigger(TriggerMode::Normal));
        assert!(!w.is_triggered());

        w.tick(Instant::now());
        assert!(w.is_triggered());
        assert_eq!(w.drain_events(), vec![ViewEvent::Triggered { at: 1000 }]);
        assert_eq!(w.first(), 980);
        assert_eq!(w.last(), 1180);
        // values just before the window start, tick records included
        assert_eq!(w.channels()[0].value, Some(1));
        assert_eq!(w.channels()[0].since, 500);
        assert_eq!(w.channels()[1].value, Some(0));

        // reading resumes inside the window
        let next = w.reader_mut().next().unwrap();
        assert_eq!(next.sample.timestamp, 1000);
    }

    #[test]
    fn test_silent_channel_stops_wind_back_at_last_tick_group() {
        let mut records = Vec::new();
        for i in 0..20_000u64 {
            let value = (i % 2) as u8;
            records.push(LogSample::new(0, value, i * 10));
            if i % 100 == 0 {
                records.push(LogSample::tick(0, value, i * 10 + 5));
            }
        }
        let tmp = log_of(&records);
        let mut w = window(&tmp, 1_000, TriggerSettings::default());
        let end = w.reader_mut().last().unwrap();
        assert_eq!(end.sample.timestamp, 199_990);
        let remaps = w.reader_mut().remap_count();

        w.wind_back(199_000);
        assert_eq!(w.channels()[0].value, Some(1));
        assert_eq!(w.channels()[0].since, 198_990);
        assert_eq!(w.channels()[1].value, None);
        // only the tail of the log was touched
        assert!(w.reader_mut().remap_count() - remaps <= 2);
        assert_eq!(w.reader_mut().next().unwrap().sample.timestamp, 199_000);
    }

    #[test]
    fn test_unresolved_channel_stays_unknown() {
        let records = vec![
            LogSample::new(0, 1, 100),
            LogSample::new(1, 1, 1000),
        ];
        let tmp = log_of(&records);
        let mut w = window(&tmp, 200, normal_trigger(TriggerMode::Normal));
        w.tick(Instant::now());
        assert!(w.is_triggered());
        assert_eq!(w.channels()[0].value, Some(1));
        assert_eq!(w.channels()[1].value, None);
    }

    #[test]
    fn test_single_shot_disarms() {
        let mut records = vec![LogSample::new(1, 1, 1000)];
        records.extend((1..50u64).map(|i| LogSample::new(0, (i % 2) as u8, 1000 + i * 20)));
        records.push(LogSample::new(1, 0, 2500));
        records.push(LogSample::new(1, 1, 3000));
        let tmp = log_of(&records);
        let mut w = window(&tmp, 200, normal_trigger(TriggerMode::Single));

        w.tick(Instant::now());
        assert!(w.is_triggered());
        w.tick(Instant::now());
        assert!(!w.is_triggered());
        assert!(!w.is_armed());
        let events = w.drain_events();
        assert_eq!(events.last(), Some(&ViewEvent::Disarmed));

        let (first, last) = (w.first(), w.last());
        for _ in 0..3 {
            w.tick(Instant::now());
        }
        assert_eq!((w.first(), w.last()), (first, last));
        assert!(w.drain_events().is_empty());

        w.set_arm(true);
        assert!(w.is_armed());
        assert!(!w.is_frozen());
    }

    #[test]
    fn test_auto_mode_forces_trigger() {
        let records: Vec<_> = (0..10u64).map(|i| LogSample::new(0, 0, i * 10)).collect();
        let tmp = log_of(&records);
        let mut w = window(&tmp, 100_000, normal_trigger(TriggerMode::Auto));
        assert_eq!(w.delay(), Duration::from_millis(10));

        let t0 = Instant::now();
        w.tick(t0);
        assert!(!w.is_triggered());
        w.tick(t0 + Duration::from_millis(20));
        assert!(w.is_triggered());
        assert_eq!(w.first(), 90);
        assert_eq!(
            w.drain_events(),
            vec![ViewEvent::AutoTriggered { at: 90 }]
        );
    }

    #[test]
    fn test_pan_and_zoom_freeze() {
        let records: Vec<_> = (0..100u64).map(|i| LogSample::new(0, 1, i * 10)).collect();
        let tmp = log_of(&records);
        let mut w = window(&tmp, 100, TriggerSettings::default());
        w.tick(Instant::now());

        w.move_by(-0.25);
        assert!(w.is_frozen());
        // -2.5 tenths rounds to -3, a tenth being 10
        assert_eq!(w.first(), 70);

        w.set_period(200, true);
        assert_eq!(w.period(), 200);
        assert_eq!(w.first(), 20);
        assert_eq!(w.last(), 220);

        let before = w.state();
        w.tick(Instant::now());
        assert_eq!(w.state(), before);

        w.set_trigger_mode(TriggerMode::Normal);
        assert!(!w.is_frozen());
    }

    #[test]
    fn test_zoom_all() {
        let records: Vec<_> = (0..100u64).map(|i| LogSample::new(0, 1, i * 1_000)).collect();
        let tmp = log_of(&records);
        let mut w = window(&tmp, 10, TriggerSettings::default());
        assert!(w.zoom_all());
        assert_eq!(w.first(), 0);
        // span 99_000 fits in 10 ms (100_000)
        assert_eq!(w.period(), 100_000);
        assert_eq!(w.samples_in_window(1000).len(), 100);
    }

    #[test]
    fn test_view_state_roundtrip() {
        let records = vec![LogSample::new(0, 1, 10)];
        let tmp = log_of(&records);
        let mut w = window(&tmp, 100, normal_trigger(TriggerMode::Single));
        w.set_range(5, Some(55));
        let json = serde_json::to_string(&w.state()).unwrap();
        let state: ViewState = serde_json::from_str(&json).unwrap();

        let mut other = window(&tmp, 1, TriggerSettings::default());
        other.restore(&state);
        assert_eq!(other.state(), w.state());
        assert_eq!(other.period(), 50);
    }
}
