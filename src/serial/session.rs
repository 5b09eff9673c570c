use std::io;
use std::time::Duration;

use uuid::Uuid;

use super::{ConnectError, DisconnectError, ReadError, SerialConfig, SerialLink, WriteError};
use crate::device::{DeviceDescriptor, DeviceRegistry, SessionState, UsbDevice};

/// Only the first port of a multi-port device is ever opened.
pub const PORT_INDEX: usize = 0;

/// Read once, mapping "nothing arrived before the timeout" to an empty read
pub(crate) fn read_chunk(link: &mut dyn SerialLink, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
    match link.read(buf, timeout) {
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(0),
        Err(e) => Err(e),
    }
}

/// A single open serial port
pub struct PortSession {
    id: Uuid,
    descriptor: DeviceDescriptor,
    link: Option<Box<dyn SerialLink>>,
}

impl PortSession {
    /// Connect to `device`, resolve its driver the same way the registry does,
    /// open port 0 and apply `config`.
    pub fn open(
        registry: &DeviceRegistry,
        device: &UsbDevice,
        config: &SerialConfig,
    ) -> Result<Self, ConnectError> {
        let connection = registry
            .host()
            .open_device(device)
            .map_err(ConnectError::ConnectionRefused)?;

        let descriptor = registry
            .describe(device)
            .ok_or_else(|| ConnectError::DeviceNotFound(device.name.clone()))?;

        let link = connection
            .open_port(descriptor.driver, PORT_INDEX, config)
            .map_err(ConnectError::IoFailure)?;

        let id = Uuid::new_v4();
        log::info!("Session {} opened on {} ({})", id, descriptor.name, config);

        Ok(Self { id, descriptor, link: Some(link) })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SessionState {
        if self.link.is_some() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), WriteError> {
        let link = self.link.as_mut().ok_or(WriteError::NotConnected)?;
        link.write_all(data, timeout).map_err(|source| WriteError::IoFailure {
            timeout_ms: timeout.as_millis() as u64,
            source,
        })?;
        log::debug!("Session {}: wrote {} bytes", self.id, data.len());
        Ok(())
    }

    /// Blocking read of at most `buffer_size` bytes. Empty on timeout.
    pub fn read(&mut self, buffer_size: usize, timeout: Duration) -> Result<Vec<u8>, ReadError> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session is closed"))?;
        let mut buffer = vec![0u8; buffer_size];
        let n = read_chunk(link.as_mut(), &mut buffer, timeout)?;
        buffer.truncate(n);
        Ok(buffer)
    }

    /// Independent reader handle for the streaming loop
    pub fn reader(&self) -> io::Result<Box<dyn SerialLink>> {
        match &self.link {
            Some(link) => link.try_clone_link(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "session is closed")),
        }
    }

    /// Release the port. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<(), DisconnectError> {
        if let Some(mut link) = self.link.take() {
            log::info!("Session {} closing {}", self.id, self.descriptor.name);
            link.close().map_err(DisconnectError::IoFailure)?;
        }
        Ok(())
    }
}

impl Drop for PortSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Session {} close on drop failed: {}", self.id, e);
        }
    }
}
