//! Tab-separated text export of a log.
//!
//! ```text
//! pin	0	clock
//! pin	1	gate
//! time	pin	state
//! 2024-05-01 12:00:00.000005	0	1
//! ```
//!
//! Synthetic tick records and channels without a pin definition are left out.

use crate::data::log_reader::PagedLogReader;
use crate::data::sample::SampleValue;
use crate::data::time_reconciler::to_datetime;
use crate::metadata::PinDefinition;
use chrono::Local;
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use tracing::debug;

/// How the time column is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeFormat {
    /// Local wall-clock time with microseconds
    #[default]
    Absolute,
    /// Microseconds since the first record
    Relative,
}

impl FromStr for TimeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "absolute" | "abs" => Ok(TimeFormat::Absolute),
            "relative" | "rel" => Ok(TimeFormat::Relative),
            other => Err(format!("unknown time format '{other}'")),
        }
    }
}

/// Local wall-clock rendering of a log timestamp, `YYYY-MM-DD HH:MM:SS.ffffff`.
pub fn format_local(timestamp: u64) -> String {
    match to_datetime(timestamp) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S%.6f")
            .to_string(),
        None => timestamp.to_string(),
    }
}

/// Signed microseconds from `start`; records flushed out of order may precede it.
fn relative_micros(timestamp: u64, start: u64) -> i64 {
    (timestamp as i128 - start as i128).div_euclid(10) as i64
}

/// Writes the whole readable log to `out`. Returns the number of record lines.
pub fn export_text<T, W>(
    reader: &mut PagedLogReader<T>,
    pins: &[PinDefinition],
    format: TimeFormat,
    mut out: W,
) -> io::Result<u64>
where
    T: SampleValue,
    W: Write,
{
    for pin in pins {
        writeln!(out, "pin\t{}\t{}", pin.index, pin.name)?;
    }
    let defined: HashSet<usize> = pins.iter().map(|p| p.index).collect();
    writeln!(out, "time\tpin\tstate")?;

    reader.reset();
    let Some(first) = reader.next() else {
        out.flush()?;
        return Ok(0);
    };
    let start = first.sample.timestamp;

    let mut lines = 0u64;
    let mut cursor = Some(first);
    while let Some(c) = cursor {
        let sample = c.sample;
        if !sample.is_tick() && defined.contains(&(sample.channel as usize)) {
            match format {
                TimeFormat::Absolute => writeln!(
                    out,
                    "{}\t{}\t{}",
                    format_local(sample.timestamp),
                    sample.channel,
                    sample.value
                )?,
                TimeFormat::Relative => writeln!(
                    out,
                    "{}\t{}\t{}",
                    relative_micros(sample.timestamp, start),
                    sample.channel,
                    sample.value
                )?,
            }
            lines += 1;
        }
        cursor = reader.next();
    }
    out.flush()?;
    debug!(lines, path = %reader.path().display(), "log exported");
    Ok(lines)
}

/// First and last timestamps of a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Timestamp of the first record
    pub first: u64,
    /// Timestamp of the last record
    pub last: u64,
    /// Number of records
    pub records: u64,
}

impl TimeRange {
    /// Reads the range of the readable part of the log; `None` when it is empty.
    pub fn of<T: SampleValue>(reader: &mut PagedLogReader<T>) -> Option<Self> {
        let first = reader.seek(0)?;
        let last = reader.last()?;
        reader.reset();
        Some(Self {
            first: first.sample.timestamp,
            last: last.sample.timestamp,
            records: last.index + 1,
        })
    }

    /// Span in log units.
    pub fn span(&self) -> u64 {
        self.last.saturating_sub(self.first)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} .. {} ({:.6} s, {} records)",
            format_local(self.first),
            format_local(self.last),
            self.span() as f64 / 1e7,
            self.records
        )
    }
}
