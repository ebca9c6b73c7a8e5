//! Byte transports to the timer device.
//!
//! The capture worker reads from an [`Adapter`] on its own thread with short
//! blocking timeouts, so the trait is synchronous. A read that times out is
//! `Ok(0)`, never an error. Partial records are the caller's concern.

pub mod mock;
pub mod serial_adapter;

pub use mock::MockAdapter;
pub use serial_adapter::SerialAdapter;

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

/// Single-byte command: poll the device while a view is live.
pub const CMD_POLL: &[u8] = b"?";
/// Single-byte command: leave scope mode.
pub const CMD_STOP: &[u8] = b"s";
/// Single-byte command: keep-alive.
pub const CMD_NOOP: &[u8] = b".";

/// Duplex byte stream to the device.
pub trait Adapter: Send {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Reads up to `buf.len()` bytes, waiting at most `timeout`. `Ok(0)` on timeout.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Writes all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// False once the link is known to be gone.
    fn is_connected(&self) -> bool;

    /// A second handle on the same link, used to send commands from another thread.
    fn try_clone(&self) -> Result<Box<dyn Adapter>>;

    /// Reads one `\n`-terminated line, without the terminator.
    fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(anyhow!("no response line within {:?}", timeout));
            }
            if self.read(&mut byte, deadline - now)? == 1 {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
        }
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }
}

impl Adapter for Box<dyn Adapter> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn try_clone(&self) -> Result<Box<dyn Adapter>> {
        (**self).try_clone()
    }
}
