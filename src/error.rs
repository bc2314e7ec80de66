//! Our error types for the HV modules.

use thiserror::Error;

use crate::{config::ConfigError, register::Family};

pub type Result<T> = core::result::Result<T, Error>;

/// Custom error type for HV module communications and supervision.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial communication error: {0:?}")]
    Serial(embedded_io::ErrorKind),
    #[error("Communication timeout")]
    Timeout,
    #[error("Echo mismatch: sent {sent:?}, received {received:?}")]
    EchoMismatch { sent: String, received: String },
    #[error("Invalid response received: {0:?}")]
    InvalidResponse(String),
    #[error("Device rejected command: {0}")]
    DeviceRejected(String),
    #[error("Operation rejected: {0}")]
    Rejected(String),
    #[error("{operation} is not supported by {family} modules")]
    Unsupported {
        family: Family,
        operation: &'static str,
    },
    #[error("Invalid channel {0}")]
    InvalidChannel(u8),
    #[error("Module {0} is not connected")]
    NotConnected(String),
    #[error("Timed out waiting for module {0} to become free")]
    OccupancyTimeout(String),
    #[error("Serial port {0} is unavailable")]
    PortUnavailable(String),
    #[error("Serial port {0} is already in use")]
    PortBusy(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Wrap a link-level error from any `embedded_io` interface.
    pub(crate) fn serial<E: embedded_io::Error>(err: E) -> Self {
        match err.kind() {
            embedded_io::ErrorKind::TimedOut => Error::Timeout,
            kind => Error::Serial(kind),
        }
    }

    /// True for errors raised by the link or the wire protocol, as opposed to
    /// refusals and local preconditions.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            Error::Serial(_)
                | Error::Timeout
                | Error::EchoMismatch { .. }
                | Error::InvalidResponse(_)
        )
    }
}
