//! Capture and replay of multi-channel event streams from a serial timer device.
//!
//! The device reports every input change as a small binary record stamped
//! with a rolling 32-bit tick counter. A capture session turns that stream
//! into an append-only log of absolutely timestamped records, in time order,
//! with a metadata block appended when the session stops. The log can be
//! read back, page by page, while it is still being written, and viewed
//! through an oscilloscope-style trigger window.
//!
//! - [`capture`]: the worker thread from device bytes to log records
//! - [`data`]: record codecs, time reconciliation, ordered ingestion, paged reading, export
//! - [`metadata`]: the channel table stored at the end of a log
//! - [`view`]: the trigger window and its poll tick
//! - [`session`]: recording files and the device hand-shake
//! - [`adapters`]: byte transports (serial port, scripted mock)

pub mod adapters;
pub mod capture;
pub mod config;
pub mod data;
pub mod error;
pub mod metadata;
pub mod session;
pub mod view;
