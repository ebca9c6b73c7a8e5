//! Explicit poll tick for the consumer side.

use crate::adapters::{Adapter, CMD_POLL};
use crate::data::sample::SampleValue;
use crate::view::trigger_window::{TriggerWindow, ViewEvent};
use std::time::Instant;
use tracing::warn;

/// Drives a [`TriggerWindow`] and, while a capture is live, pokes the device.
///
/// Single-threaded: the caller decides when to tick, typically from a timer.
pub struct ViewPoller<T: SampleValue> {
    window: TriggerWindow<T>,
    device: Option<Box<dyn Adapter>>,
    ticks: u64,
}

impl<T: SampleValue> ViewPoller<T> {
    /// Wraps `window` with no device attached.
    pub fn new(window: TriggerWindow<T>) -> Self {
        Self {
            window,
            device: None,
            ticks: 0,
        }
    }

    /// Sends the poll command through `device` on every tick.
    pub fn with_device(mut self, device: Box<dyn Adapter>) -> Self {
        self.device = Some(device);
        self
    }

    /// Stops polling, e.g. once the capture has ended.
    pub fn detach_device(&mut self) -> Option<Box<dyn Adapter>> {
        self.device.take()
    }

    /// True while a device handle is attached.
    pub fn is_polling(&self) -> bool {
        self.device.is_some()
    }

    /// One poll: command the device, then advance the window.
    pub fn tick(&mut self, now: Instant) -> Vec<ViewEvent> {
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.write(CMD_POLL) {
                warn!(device = device.name(), error = %e, "poll command failed, polling stopped");
                self.device = None;
            }
        }
        self.ticks += 1;
        self.window.tick(now);
        self.window.drain_events()
    }

    /// Ticks performed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The window.
    pub fn window(&self) -> &TriggerWindow<T> {
        &self.window
    }

    /// The window, for pan/zoom and trigger changes.
    pub fn window_mut(&mut self) -> &mut TriggerWindow<T> {
        &mut self.window
    }

    /// Releases the window.
    pub fn into_window(self) -> TriggerWindow<T> {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::config::ReaderSettings;
    use crate::data::log_reader::PagedLogReader;
    use crate::data::sample::LogSample;
    use crate::view::trigger_window::{TriggerMode, TriggerPolarity, TriggerSettings};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn poller(tmp: &NamedTempFile) -> ViewPoller<u8> {
        let reader = PagedLogReader::open(tmp.path(), ReaderSettings::default()).unwrap();
        let trigger = TriggerSettings {
            enabled: true,
            channel: 0,
            polarity: TriggerPolarity::Up,
            mode: TriggerMode::Normal,
        };
        ViewPoller::new(TriggerWindow::new(reader, 1, 100, trigger))
    }

    #[test]
    fn test_tick_polls_device_and_reports_events() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&LogSample::<u8>::new(0, 0, 10).to_bytes()).unwrap();
        tmp.flush().unwrap();

        let mock = MockAdapter::new();
        let mut p = poller(&tmp).with_device(Box::new(mock.clone()));
        assert!(p.tick(Instant::now()).is_empty());

        // the log grows between ticks
        tmp.write_all(&LogSample::<u8>::new(0, 1, 500).to_bytes()).unwrap();
        tmp.flush().unwrap();
        let events = p.tick(Instant::now());
        assert_eq!(events, vec![ViewEvent::Triggered { at: 500 }]);
        assert_eq!(mock.written(), b"??".to_vec());
        assert_eq!(p.ticks(), 2);
    }

    #[test]
    fn test_failed_poll_detaches_device() {
        let tmp = NamedTempFile::new().unwrap();
        let mock = MockAdapter::new();
        mock.push_disconnect();
        let mut link = mock.clone();
        assert!(link.read(&mut [0u8; 1], Duration::ZERO).is_err());

        let mut p = poller(&tmp).with_device(Box::new(mock));
        p.tick(Instant::now());
        assert!(!p.is_polling());
        assert!(p.detach_device().is_none());
    }
}
