//! Recording sessions: the log file, the device hand-shake and the capture worker.
//!
//! A live session runs in three steps:
//!
//! 1. [`RecordingFile::create`] opens the log, either a temporary file that is
//!    deleted when dropped or a named `.sclog` file that never overwrites an
//!    existing recording.
//! 2. [`LiveSession::start`] switches the device into scope mode and spawns the
//!    capture worker on the file.
//! 3. [`LiveSession::stop`] stops the worker and appends the metadata block,
//!    producing a [`FinishedRecording`] whose readers stop at the data end.

use crate::adapters::Adapter;
use crate::capture::{CaptureHandle, CaptureOptions, CaptureState, CaptureSummary, CaptureWorker};
use crate::config::{ReaderSettings, ScopeConfig, ViewSettings};
use crate::data::log_reader::PagedLogReader;
use crate::data::sample::{SampleValue, ValueWidth};
use crate::metadata::SessionMetadata;
use crate::view::trigger_window::TriggerWindow;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info, warn};

/// Extension of recordings.
pub const LOG_EXTENSION: &str = "sclog";

fn trailing_number() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?)(\d+)$").ok()).as_ref()
}

/// Bumps the number at the end of the file stem: `run` to `run1`, `run9` to `run10`.
pub fn increment_file_name(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let caps = trailing_number().and_then(|re| re.captures(&stem));
    let next = match caps {
        Some(caps) => {
            let prefix = caps.get(1).map_or("", |m| m.as_str());
            let digits = caps.get(2).map_or("", |m| m.as_str());
            match digits.parse::<u64>() {
                Ok(n) => format!("{prefix}{:0width$}", n + 1, width = digits.len()),
                Err(_) => format!("{stem}1"),
            }
        }
        None => format!("{stem}1"),
    };

    let mut renamed = path.with_file_name(next);
    if let Some(ext) = path.extension() {
        renamed.set_extension(ext);
    }
    renamed
}

/// First name derived from `path` that does not hold a non-empty file.
pub fn unused_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while fs::metadata(&candidate).map(|m| m.len() > 0).unwrap_or(false) {
        candidate = increment_file_name(&candidate);
    }
    candidate
}

/// The command that switches the device into scope mode.
pub fn scope_command(width: ValueWidth) -> &'static [u8] {
    match width {
        ValueWidth::Bits8 => b"scope\n",
        ValueWidth::Bits16 => b"scope 16\n",
    }
}

/// Sends the scope command and consumes the device's response line.
pub fn enter_scope_mode<A: Adapter>(
    adapter: &mut A,
    width: ValueWidth,
    timeout: Duration,
) -> Result<String> {
    adapter
        .write(scope_command(width))
        .with_context(|| format!("Failed to send scope command to {}", adapter.name()))?;
    let response = adapter
        .read_line(timeout)
        .with_context(|| format!("{} did not acknowledge scope mode", adapter.name()))?;
    debug!(device = adapter.name(), response = %response, "scope mode entered");
    Ok(response)
}

/// Where a recording goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Temporary file, deleted when the recording is dropped
    Temporary,
    /// Named file; the extension is forced to `.sclog`
    Named(PathBuf),
}

/// The open log of a recording.
#[derive(Debug)]
pub struct RecordingFile {
    path: PathBuf,
    file: File,
    temp: Option<TempPath>,
}

impl RecordingFile {
    /// Creates the log file for `target`.
    pub fn create(target: &LogTarget) -> Result<Self> {
        match target {
            LogTarget::Temporary => {
                let named = tempfile::Builder::new()
                    .prefix("daq_scope-")
                    .suffix(&format!(".{LOG_EXTENSION}"))
                    .tempfile()
                    .context("Failed to create temporary recording")?;
                let (file, temp) = named.into_parts();
                let path = temp.to_path_buf();
                debug!(path = %path.display(), "temporary recording created");
                Ok(Self {
                    path,
                    file,
                    temp: Some(temp),
                })
            }
            LogTarget::Named(path) => {
                let path = unused_path(&path.with_extension(LOG_EXTENSION));
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .with_context(|| format!("Failed to create recording {}", path.display()))?;
                info!(path = %path.display(), "recording to file");
                Ok(Self {
                    path,
                    file,
                    temp: None,
                })
            }
        }
    }

    /// Path of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True for a temporary log.
    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// A second handle for the capture worker to append through.
    pub fn writer(&self) -> Result<File> {
        self.file
            .try_clone()
            .with_context(|| format!("Failed to reopen {}", self.path.display()))
    }

    /// Appends the metadata block. Returns the data end offset.
    pub fn finalize(&mut self, metadata: &SessionMetadata) -> Result<u64> {
        let data_end = metadata
            .append_to(&mut self.file)
            .with_context(|| format!("Failed to write metadata to {}", self.path.display()))?;
        info!(path = %self.path.display(), data_end, "recording finalized");
        Ok(data_end)
    }

    /// Copies the log to an unused name derived from `dest`. Returns the name used.
    pub fn save_as(&self, dest: &Path) -> Result<PathBuf> {
        let dest = unused_path(&dest.with_extension(LOG_EXTENSION));
        fs::copy(&self.path, &dest).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                self.path.display(),
                dest.display()
            )
        })?;
        info!(from = %self.path.display(), to = %dest.display(), "recording saved");
        Ok(dest)
    }
}

/// A capture in progress.
pub struct LiveSession<T: SampleValue> {
    file: RecordingFile,
    handle: CaptureHandle,
    device: Box<dyn Adapter>,
    metadata: SessionMetadata,
    _marker: PhantomData<T>,
}

impl<T: SampleValue> LiveSession<T> {
    /// Puts the device in scope mode and starts capturing into a new log.
    pub fn start<A>(mut adapter: A, target: &LogTarget, config: &ScopeConfig) -> Result<Self>
    where
        A: Adapter + 'static,
    {
        if !adapter.is_connected() {
            return Err(anyhow!("{} is not connected", adapter.name()));
        }
        if config.value_width() != T::WIDTH {
            return Err(anyhow!(
                "configured {} does not match a {} session",
                config.value_width(),
                T::WIDTH
            ));
        }

        let file = RecordingFile::create(target)?;
        let response = enter_scope_mode(&mut adapter, T::WIDTH, config.capture.sync_timeout)?;
        let device = adapter.try_clone().context("Failed to clone device handle")?;

        let options = CaptureOptions::from_settings(&config.capture, config.channel_count());
        let worker = CaptureWorker::<T, _, _>::new(adapter, file.writer()?, options);
        let handle = worker.spawn().context("Failed to start capture thread")?;
        let width = T::WIDTH;
        info!(
            path = %file.path().display(),
            width = %width,
            response = %response,
            "capture session started"
        );

        Ok(Self {
            file,
            handle,
            device,
            metadata: SessionMetadata::new(config.pins.clone(), T::WIDTH),
            _marker: PhantomData,
        })
    }

    /// Worker state.
    pub fn state(&self) -> CaptureState {
        self.handle.state()
    }

    /// True once the worker has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Path of the log being written.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Another handle on the device, for the view's poll command.
    pub fn device(&self) -> Result<Box<dyn Adapter>> {
        self.device.try_clone()
    }

    /// A reader on the live log.
    pub fn open_reader(&self, settings: ReaderSettings) -> Result<PagedLogReader<T>> {
        PagedLogReader::open(self.file.path(), settings)
            .with_context(|| format!("Failed to open {}", self.file.path().display()))
    }

    /// Stops the capture and finalizes the log.
    ///
    /// A session that never synchronised is an error; the log is left without
    /// metadata.
    pub fn stop(self) -> Result<FinishedRecording> {
        let Self {
            mut file,
            handle,
            metadata,
            ..
        } = self;

        let summary = handle.stop().context("Capture session failed")?;
        let data_end = file.finalize(&metadata)?;
        if summary.records_written * T::WIDTH.log_record_size() as u64 != data_end {
            warn!(
                records = summary.records_written,
                data_end, "log length does not match the records written"
            );
        }

        Ok(FinishedRecording {
            file,
            summary,
            metadata,
            data_end,
        })
    }
}

/// A stopped and finalized recording.
#[derive(Debug)]
pub struct FinishedRecording {
    file: RecordingFile,
    summary: CaptureSummary,
    metadata: SessionMetadata,
    data_end: u64,
}

impl FinishedRecording {
    /// The log file.
    pub fn file(&self) -> &RecordingFile {
        &self.file
    }

    /// Outcome of the capture.
    pub fn summary(&self) -> &CaptureSummary {
        &self.summary
    }

    /// The metadata block written.
    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Byte offset where sample data ends.
    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    /// A reader limited to the sample data.
    pub fn open_reader<T: SampleValue>(&self, settings: ReaderSettings) -> Result<PagedLogReader<T>> {
        let mut reader = PagedLogReader::open(self.file.path(), settings)
            .with_context(|| format!("Failed to open {}", self.file.path().display()))?;
        reader.set_limit(Some(self.data_end));
        Ok(reader)
    }

    /// A window showing the whole recording.
    pub fn zoom_all<T: SampleValue>(
        &self,
        reader: ReaderSettings,
        view: &ViewSettings,
    ) -> Result<TriggerWindow<T>> {
        let mut window = TriggerWindow::new(
            self.open_reader(reader)?,
            self.metadata.channel_count(),
            view.period,
            view.trigger,
        );
        if !window.zoom_all() {
            debug!("empty recording, window left at its defaults");
        }
        Ok(window)
    }

    /// Releases the file; a temporary log is deleted.
    pub fn close(self) {
        debug!(path = %self.file.path().display(), "recording closed");
    }
}
