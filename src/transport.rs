//! Serial transport: a `serialport` port exposed through the `embedded_io` traits
//! the codecs are written against.

use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info};

use crate::{
    config::ModuleConfig,
    error::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Bound on every single read.
    pub timeout: Duration,
}

impl From<&ModuleConfig> for SerialConfig {
    fn from(config: &ModuleConfig) -> Self {
        Self {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            timeout: config.serial_timeout(),
        }
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            // A read returning nothing within the port timeout.
            std::io::ErrorKind::WouldBlock => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl SerialTransport {
    /// Open the port. A missing device and a device held by another process
    /// are reported separately.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(config.timeout)
            .open()
            .map_err(|e| open_error(&config.port, e))?;
        info!(port = %config.port, baud = config.baud_rate, "serial port opened");
        Ok(Self {
            port,
            name: config.port.clone(),
        })
    }

    /// Discard anything left in the buffers by an aborted exchange.
    pub fn clear(&self) -> Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| Error::Io(e.into()))
    }
}

/// The port is closed when the transport goes away.
impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!(port = %self.name, "serial port closed");
    }
}

fn open_error(port: &str, err: serialport::Error) -> Error {
    match err.kind() {
        serialport::ErrorKind::NoDevice if err.description.contains("busy") => {
            Error::PortBusy(port.to_string())
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::ResourceBusy) => {
            Error::PortBusy(port.to_string())
        }
        _ => Error::PortUnavailable(format!("{port}: {}", err.description)),
    }
}

impl embedded_io::ErrorType for SerialTransport {
    type Error = IoError;
}

impl embedded_io::Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Read::read(&mut self.port, buf).map_err(IoError)
    }
}

impl embedded_io::Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Write::write(&mut self.port, buf).map_err(IoError)
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        std::io::Write::flush(&mut self.port).map_err(IoError)
    }
}
