//! Record codecs, time reconciliation and log file I/O.

pub mod export;
pub mod ingest;
pub mod log_reader;
pub mod sample;
pub mod time_reconciler;

pub use ingest::IngestionBuffer;
pub use log_reader::{Cursor, PagedLogReader};
pub use sample::{LogSample, SampleValue, ValueWidth, WireSample};
pub use time_reconciler::TimeReconciler;
