//! Custom error types for the capture-and-replay engine.
//!
//! This module defines the primary error type, `ScopeError`, shared by the capture
//! worker, the metadata codec and the configuration layer. It is built with the
//! `thiserror` crate so every variant carries a readable message and underlying
//! errors convert through `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: configuration could not be loaded or failed validation.
//! - **`Io`**: wraps `std::io::Error` for log file and metadata I/O.
//! - **`Transport`**: the byte link to the device reported a fault.
//! - **`SyncMissing` / `SyncMalformed`**: the device did not open the stream with a
//!   valid sync record. These are fatal to a capture session, which must never be
//!   reported as an empty success.
//! - **`InvalidMetadata`**: the trailing metadata block of a log file is unusable.
//! - **`UnsupportedBits`**: a value width other than 8 or 16 bits was requested.
//! - **`FeatureNotEnabled`**: functionality that was compiled out (e.g. serial support).
//!
//! Storage faults of the paged reader have no variant: a reader racing a live
//! writer treats them as "no more data" instead of an error.

use crate::config::ConfigError;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, ScopeError>;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("No sync record received within {timeout_ms} ms")]
    SyncMissing { timeout_ms: u64 },

    #[error("Malformed sync record (channel {channel}, value {value:#x})")]
    SyncMalformed { channel: i8, value: u16 },

    #[error("Invalid metadata block: {0}")]
    InvalidMetadata(String),

    #[error("Unsupported sample width: {0} bits (expected 8 or 16)")]
    UnsupportedBits(u32),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Capture worker thread panicked")]
    WorkerPanicked,
}

impl ScopeError {
    /// True for the errors that mean a capture session never started streaming.
    pub fn is_sync_failure(&self) -> bool {
        matches!(
            self,
            ScopeError::SyncMissing { .. } | ScopeError::SyncMalformed { .. }
        )
    }
}
