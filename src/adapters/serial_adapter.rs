use super::Adapter;
use crate::error::ScopeError;
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Serial transport for the timer device
///
/// Wraps the serialport crate with blocking reads. The port timeout is only
/// changed when a caller asks for a different one.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 115200)
    baud_rate: u32,

    /// Timeout currently set on the port
    timeout: Duration,

    connected: bool,

    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn SerialPort>>,
}

impl SerialAdapter {
    /// Create an unopened serial adapter
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 115200)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_millis(100),
            connected: false,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Port name this adapter talks to.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Open the port.
    pub fn open(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(self.timeout)
                .open()
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        self.port_name, self.baud_rate
                    )
                })?;
            self.port = Some(port);
            self.connected = true;
            debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(ScopeError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }

    /// Names of the serial ports present on this machine.
    pub fn available_ports() -> Result<Vec<String>> {
        #[cfg(feature = "instrument_serial")]
        {
            let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
            Ok(ports.into_iter().map(|p| p.port_name).collect())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(ScopeError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or(ScopeError::SerialPortNotConnected)
            .map_err(anyhow::Error::from)
    }

    #[cfg(feature = "instrument_serial")]
    fn lost(&mut self, e: &std::io::Error) {
        use std::io::ErrorKind;
        if matches!(
            e.kind(),
            ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof
        ) {
            warn!(port = %self.port_name, error = %e, "serial link lost");
            self.connected = false;
        }
    }
}

impl Adapter for SerialAdapter {
    fn name(&self) -> &str {
        "serial"
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        #[cfg(feature = "instrument_serial")]
        {
            use std::io::{ErrorKind, Read};

            if timeout != self.timeout {
                self.port_mut()?
                    .set_timeout(timeout)
                    .context("Failed to set serial timeout")?;
                self.timeout = timeout;
            }
            let result = self.port_mut()?.read(buf);
            match result {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
                Err(e) => {
                    self.lost(&e);
                    Err(anyhow::Error::new(e).context("Serial read error"))
                }
            }
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (buf, timeout);
            Err(ScopeError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            use std::io::Write;

            let port = self.port_mut()?;
            let result = port.write_all(bytes).and_then(|_| port.flush());
            if let Err(e) = result {
                self.lost(&e);
                return Err(anyhow::Error::new(e).context("Failed to write to serial port"));
            }
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = bytes;
            Err(ScopeError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn try_clone(&self) -> Result<Box<dyn Adapter>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or(ScopeError::SerialPortNotConnected)?
                .try_clone()
                .context("Failed to clone serial port handle")?;
            Ok(Box::new(SerialAdapter {
                port_name: self.port_name.clone(),
                baud_rate: self.baud_rate,
                timeout: self.timeout,
                connected: self.connected,
                port: Some(port),
            }))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(ScopeError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }
}
