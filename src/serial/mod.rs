pub mod config;
pub mod interface;
pub mod session;
pub mod stream;

pub use config::{Parity, SerialConfig, StopBits};
pub use interface::{SerialLink, SerialportHost, UsbConnection, UsbHost};
pub use session::PortSession;

use std::io;

use crate::device::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open connection: {0}")]
    ConnectionRefused(#[source] io::Error),

    #[error("Failed to open device: {0}")]
    IoFailure(#[source] io::Error),

    #[error(transparent)]
    Enumeration(#[from] RegistryError),

    /// Issued from a delivery callback while the session is being torn down
    #[error("Session transition in progress")]
    Busy,
}

impl ConnectError {
    /// Stable code reported over the command channel
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            ConnectError::ConnectionRefused(_) => "CONNECTION_FAILED",
            ConnectError::IoFailure(_) => "DEVICE_OPEN",
            ConnectError::Enumeration(_) => "ENUMERATION_FAILED",
            ConnectError::Busy => "DEVICE_BUSY",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Serial port not connected")]
    NotConnected,

    #[error("Failed to write data (timeout {timeout_ms} ms): {source}")]
    IoFailure {
        timeout_ms: u64,
        #[source]
        source: io::Error,
    },

    #[error("Implicit connect failed: {0}")]
    Connect(#[from] ConnectError),
}

impl WriteError {
    pub fn code(&self) -> &'static str {
        match self {
            WriteError::NotConnected => "SERIAL_PORT_NOT_FOUND",
            WriteError::IoFailure { .. } => "DEVICE_WRITE",
            WriteError::Connect(e) => e.code(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Failed to read data: {0}")]
    IoFailure(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DisconnectError {
    #[error("Failed to disconnect: {0}")]
    IoFailure(#[source] io::Error),
}

impl DisconnectError {
    pub fn code(&self) -> &'static str {
        "DISCONNECT_FAILED"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_distinct_per_connect_failure() {
        let not_found = ConnectError::DeviceNotFound("2fb8:21d5".into());
        let refused = ConnectError::ConnectionRefused(io::Error::from(io::ErrorKind::PermissionDenied));
        let io_fault = ConnectError::IoFailure(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(not_found.code(), "DEVICE_NOT_FOUND");
        assert_eq!(refused.code(), "CONNECTION_FAILED");
        assert_eq!(io_fault.code(), "DEVICE_OPEN");
    }

    #[test]
    fn write_error_surfaces_connect_code() {
        let err = WriteError::from(ConnectError::DeviceNotFound("A80".into()));
        assert_eq!(err.code(), "DEVICE_NOT_FOUND");
        let err = WriteError::IoFailure { timeout_ms: 2000, source: io::Error::from(io::ErrorKind::TimedOut) };
        assert!(err.to_string().contains("2000 ms"));
    }
}
