//! Capture worker: device bytes in, ordered log records out.
//!
//! The worker runs on a dedicated thread and owns the transport read side, the
//! time reconciler and the ingestion buffer. Nothing else touches them. The
//! outside world sees only two atomics: the stop request and the state.
//!
//! ```text
//! WaitingForSync --sync record--> Streaming --end record / stop / link lost--> Stopped
//!       |
//!       +--missing or malformed sync--> Failed
//! ```
//!
//! A session that never synchronised is an error (`SyncMissing` or
//! `SyncMalformed`), never an empty success.
//!
//! Stopping is cooperative. The stop flag is checked once per read iteration;
//! the worker then sends the device its stop command and keeps draining until
//! the end record arrives or the quiesce timeout expires, so `join` is bounded.

use crate::adapters::{Adapter, CMD_STOP};
use crate::config::CaptureSettings;
use crate::data::ingest::IngestionBuffer;
use crate::data::sample::{ControlCode, LogSample, SampleValue, WireSample};
use crate::data::time_reconciler::{now_timestamp, TimeReconciler};
use crate::error::{AppResult, ScopeError};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    /// Waiting for the initial sync record
    WaitingForSync = 0,
    /// Records are being captured
    Streaming = 1,
    /// Finished normally; everything buffered was written
    Stopped = 2,
    /// Never synchronised, or the log could not be written
    Failed = 3,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CaptureState::WaitingForSync,
            1 => CaptureState::Streaming,
            2 => CaptureState::Stopped,
            _ => CaptureState::Failed,
        }
    }

    /// True for `Stopped` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, CaptureState::Stopped | CaptureState::Failed)
    }
}

/// Why a successful session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The device sent its end record
    EndMarker,
    /// A stop was requested
    StopRequested,
    /// The transport kept failing or went away
    Disconnected,
}

/// Outcome of a session that synchronised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Records written to the log, synthetic tick records included
    pub records_written: u64,
    /// Wire records decoded after the sync record
    pub wire_records: u64,
    /// Why the session ended
    pub end_reason: EndReason,
}

/// Tuning of one capture session.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Budget for the initial sync record
    pub sync_timeout: Duration,
    /// Per-call transport read timeout
    pub read_timeout: Duration,
    /// Drain time after the stop command
    pub quiesce_timeout: Duration,
    /// Minimum record age before it is written, in log units
    pub retention_delay: u64,
    /// Ingestion ring capacity
    pub buffer_capacity: usize,
    /// Log units per device tick
    pub tick_unit: u64,
    /// Consecutive transport errors tolerated
    pub max_transport_faults: u32,
    /// Raw read buffer size, in wire records
    pub read_buffer_records: usize,
    /// Channels known up front; more are added as they show up
    pub channel_count: usize,
}

impl CaptureOptions {
    /// Options from configuration.
    pub fn from_settings(settings: &CaptureSettings, channel_count: usize) -> Self {
        Self {
            sync_timeout: settings.sync_timeout,
            read_timeout: settings.read_timeout,
            quiesce_timeout: settings.quiesce_timeout,
            retention_delay: settings.retention_delay,
            buffer_capacity: settings.buffer_capacity,
            tick_unit: settings.tick_unit,
            max_transport_faults: settings.max_transport_faults,
            read_buffer_records: settings.read_buffer_records,
            channel_count,
        }
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self::from_settings(&CaptureSettings::default(), 0)
    }
}

enum Flow {
    Continue,
    End,
}

/// The capture loop of one session.
pub struct CaptureWorker<T: SampleValue, A: Adapter, W: Write> {
    adapter: A,
    buffer: IngestionBuffer<T, W>,
    options: CaptureOptions,
    states: Vec<Option<T>>,
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    clock: fn() -> u64,
    wire_records: u64,
}

impl<T, A, W> CaptureWorker<T, A, W>
where
    T: SampleValue,
    A: Adapter,
    W: Write,
{
    /// Creates a worker reading from `adapter` and appending to `sink`.
    pub fn new(adapter: A, sink: W, options: CaptureOptions) -> Self {
        let buffer = IngestionBuffer::new(sink, options.buffer_capacity, options.retention_delay);
        Self {
            adapter,
            buffer,
            states: vec![None; options.channel_count],
            options,
            stop: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(CaptureState::WaitingForSync as u8)),
            clock: now_timestamp,
            wire_records: 0,
        }
    }

    /// Replaces the wall clock used to anchor the session.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Flag that asks the worker to stop.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Current state.
    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Runs the session on the calling thread until it ends.
    pub fn run(mut self) -> AppResult<CaptureSummary> {
        self.set_state(CaptureState::WaitingForSync);
        let mut reconciler = match self.sync() {
            Ok(reconciler) => reconciler,
            Err(e) => {
                error!(error = %e, "capture failed to synchronise");
                self.set_state(CaptureState::Failed);
                return Err(e);
            }
        };

        self.set_state(CaptureState::Streaming);
        info!(adapter = self.adapter.name(), "capture streaming");

        match self.stream(&mut reconciler) {
            Ok(end_reason) => {
                self.set_state(CaptureState::Stopped);
                let summary = CaptureSummary {
                    records_written: self.buffer.written(),
                    wire_records: self.wire_records,
                    end_reason,
                };
                info!(
                    records = summary.records_written,
                    reason = ?summary.end_reason,
                    "capture stopped"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "capture aborted");
                // keep what can still be kept
                if let Err(flush_err) = self.buffer.flush_all() {
                    warn!(error = %flush_err, "final flush failed");
                }
                self.set_state(CaptureState::Failed);
                Err(e)
            }
        }
    }

    /// Reads exactly one record within the sync timeout; it must be the sync record.
    fn sync(&mut self) -> AppResult<TimeReconciler> {
        let size = WireSample::<T>::SIZE;
        let mut raw = vec![0u8; size];
        let mut got = 0;
        let timeout = self.options.sync_timeout;
        let deadline = Instant::now() + timeout;

        while got < size {
            let now = Instant::now();
            if now >= deadline {
                return Err(ScopeError::SyncMissing {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let wait = (deadline - now).min(self.options.read_timeout);
            got += self
                .adapter
                .read(&mut raw[got..], wait)
                .map_err(|e| ScopeError::Transport(format!("{e:#}")))?;
        }

        let record = WireSample::<T>::decode(&raw).ok_or(ScopeError::SyncMissing {
            timeout_ms: timeout.as_millis() as u64,
        })?;
        if !record.is_sync() {
            return Err(ScopeError::SyncMalformed {
                channel: record.channel,
                value: record.value.to_u16(),
            });
        }

        debug!(tick = record.tick, "sync record received");
        Ok(TimeReconciler::synced(
            (self.clock)(),
            record.tick,
            self.options.tick_unit,
        ))
    }

    fn stream(&mut self, reconciler: &mut TimeReconciler) -> AppResult<EndReason> {
        let size = WireSample::<T>::SIZE;
        let mut raw = vec![0u8; size * self.options.read_buffer_records.max(1)];
        let mut carry = 0usize;
        let mut faults = 0u32;
        let mut stop_deadline: Option<Instant> = None;

        let end_reason = loop {
            if stop_deadline.is_none() && self.stop.load(Ordering::Acquire) {
                info!("capture stop requested");
                if let Err(e) = self.adapter.write(CMD_STOP) {
                    warn!(error = %e, "stop command not delivered");
                }
                stop_deadline = Some(Instant::now() + self.options.quiesce_timeout);
            }
            if let Some(deadline) = stop_deadline {
                if Instant::now() >= deadline {
                    debug!("device did not confirm stop in time");
                    break EndReason::StopRequested;
                }
            }

            let n = match self.adapter.read(&mut raw[carry..], self.options.read_timeout) {
                Ok(n) => {
                    faults = 0;
                    n
                }
                Err(e) => {
                    faults += 1;
                    warn!(error = %e, faults, "transport read failed");
                    if faults >= self.options.max_transport_faults
                        || !self.adapter.is_connected()
                    {
                        break EndReason::Disconnected;
                    }
                    continue;
                }
            };
            if n == 0 {
                continue;
            }

            let total = carry + n;
            let whole = total - total % size;
            let mut ended = false;
            for chunk in raw[..whole].chunks_exact(size) {
                let Some(wire) = WireSample::<T>::decode(chunk) else {
                    continue;
                };
                self.wire_records += 1;
                if let Flow::End = self.handle(reconciler, wire)? {
                    ended = true;
                    break;
                }
            }
            if ended {
                break match stop_deadline {
                    Some(_) => EndReason::StopRequested,
                    None => EndReason::EndMarker,
                };
            }

            raw.copy_within(whole..total, 0);
            carry = total - whole;
            self.buffer.flush(0)?;
        };

        self.buffer.flush_all()?;
        Ok(end_reason)
    }

    fn handle(&mut self, reconciler: &mut TimeReconciler, wire: WireSample<T>) -> io::Result<Flow> {
        let timestamp = reconciler.reconcile(wire.tick);

        match wire.control_code() {
            Some(ControlCode::Tick) => {
                for (channel, value) in self.states.iter().enumerate() {
                    if let Some(value) = value {
                        self.buffer.push(LogSample::tick(channel, *value, timestamp))?;
                    }
                }
                self.buffer.flush(0)?;
                Ok(Flow::Continue)
            }
            Some(ControlCode::End) => {
                debug!("end record received");
                Ok(Flow::End)
            }
            None if wire.channel < 0 => {
                trace!(
                    channel = wire.channel,
                    value = wire.value.to_u16(),
                    "unknown control record ignored"
                );
                Ok(Flow::Continue)
            }
            None => {
                let channel = wire.channel as usize;
                if channel >= self.states.len() {
                    self.states.resize(channel + 1, None);
                }
                self.states[channel] = Some(wire.value);
                self.buffer
                    .push(LogSample::new(wire.channel, wire.value, timestamp))?;
                Ok(Flow::Continue)
            }
        }
    }
}

impl<T, A, W> CaptureWorker<T, A, W>
where
    T: SampleValue,
    A: Adapter + 'static,
    W: Write + Send + 'static,
{
    /// Starts the session on a dedicated thread.
    pub fn spawn(self) -> io::Result<CaptureHandle> {
        let stop = Arc::clone(&self.stop);
        let state = Arc::clone(&self.state);
        let thread = thread::Builder::new()
            .name("capture-worker".to_string())
            .spawn(move || self.run())?;
        Ok(CaptureHandle {
            stop,
            state,
            thread: Some(thread),
        })
    }
}

/// Control side of a running capture worker.
///
/// Dropping the handle stops and joins the worker.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    thread: Option<JoinHandle<AppResult<CaptureSummary>>>,
}

impl CaptureHandle {
    /// Current worker state.
    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Asks the worker to stop without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// True once the worker thread has returned.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Waits for the worker to end on its own.
    pub fn join(mut self) -> AppResult<CaptureSummary> {
        self.join_inner()
    }

    /// Requests a stop and waits for the worker.
    pub fn stop(mut self) -> AppResult<CaptureSummary> {
        self.request_stop();
        self.join_inner()
    }

    fn join_inner(&mut self) -> AppResult<CaptureSummary> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ScopeError::WorkerPanicked)?,
            None => Err(ScopeError::WorkerPanicked),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.request_stop();
            if thread.join().is_err() {
                error!("capture worker panicked");
            }
        }
    }
}
