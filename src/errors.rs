use std::io;
use thiserror::Error;

/// Coarse error classes used to decide how far a failure propagates.
///
/// Transport and timeout failures are scoped to a single channel; invalid
/// arguments are caller bugs; not-ready means the telemetry sink had nobody
/// to deliver to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    TransportFailure,
    Timeout,
    NotReady,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
}

impl DriverError {
    /// Map the error onto the propagation taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DriverError::Transport(_) | DriverError::Io(_) | DriverError::Protocol(_) => {
                ErrorKind::TransportFailure
            }
            DriverError::Timeout(_) => ErrorKind::Timeout,
            DriverError::NotReady(_) | DriverError::Bluetooth(_) => ErrorKind::NotReady,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        DriverError::InvalidArgument(msg.into())
    }
}

#[cfg_attr(not(feature = "bluez"), allow(dead_code))]
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("adapter unavailable: {0}")]
    Adapter(String),
    #[error("advertising failed: {0}")]
    Advertising(String),
    #[error("gatt application failed: {0}")]
    Gatt(String),
    #[error("notification failed: {0}")]
    Notify(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
