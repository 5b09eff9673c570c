use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{FlowControl, SerialPort, SerialPortType};

use super::config::{to_serialport_data_bits, to_serialport_parity, to_serialport_stop_bits, SerialConfig};
use crate::device::{DriverFamily, UsbDevice};

/// An open serial port, or a cloned handle onto one.
///
/// `read` may fail with `ErrorKind::TimedOut` when nothing arrived in time;
/// callers treat that as an empty read, not a fault.
pub trait SerialLink: Send {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8], timeout: Duration) -> io::Result<()>;

    /// Independent handle onto the same port, used by the streaming reader so
    /// writes never wait behind a blocking read.
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Platform USB access: enumeration, per-driver port layout and raw connections.
pub trait UsbHost: Send + Sync {
    fn enumerate(&self) -> io::Result<Vec<UsbDevice>>;

    /// Number of serial ports the given driver exposes on this device.
    fn port_count(&self, device: &UsbDevice, driver: DriverFamily) -> usize;

    fn open_device(&self, device: &UsbDevice) -> io::Result<Box<dyn UsbConnection>>;
}

/// A platform connection to one device, before any port has been configured.
pub trait UsbConnection: Send {
    fn open_port(
        self: Box<Self>,
        driver: DriverFamily,
        port_index: usize,
        config: &SerialConfig,
    ) -> io::Result<Box<dyn SerialLink>>;
}

/// Desktop host backed by the `serialport` crate. Each USB serial node is
/// reported as its own device with a single port.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialportHost;

impl SerialportHost {
    pub fn new() -> Self {
        Self
    }

    fn is_cdc_acm(port_name: &str) -> bool {
        port_name.contains("ttyACM") || port_name.contains("usbmodem")
    }
}

impl UsbHost for SerialportHost {
    fn enumerate(&self) -> io::Result<Vec<UsbDevice>> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                devices.push(UsbDevice {
                    system_id: crc32fast::hash(port.port_name.as_bytes()),
                    cdc_acm: Self::is_cdc_acm(&port.port_name),
                    name: port.port_name,
                    product_name: usb_info.product,
                    manufacturer: usb_info.manufacturer,
                    vendor_id: usb_info.vid,
                    product_id: usb_info.pid,
                    serial_number: usb_info.serial_number,
                });
            }
        }

        Ok(devices)
    }

    fn port_count(&self, _device: &UsbDevice, _driver: DriverFamily) -> usize {
        1
    }

    fn open_device(&self, device: &UsbDevice) -> io::Result<Box<dyn UsbConnection>> {
        let port = serialport::new(&device.name, crate::serial::config::DEFAULT_BAUD_RATE)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(io::Error::from)?;
        log::debug!("Opened platform connection to {}", device.name);
        Ok(Box::new(SerialportConnection { port }))
    }
}

struct SerialportConnection {
    port: Box<dyn SerialPort>,
}

impl UsbConnection for SerialportConnection {
    fn open_port(
        self: Box<Self>,
        _driver: DriverFamily,
        port_index: usize,
        config: &SerialConfig,
    ) -> io::Result<Box<dyn SerialLink>> {
        if port_index != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("port index {} out of range (1 port)", port_index),
            ));
        }

        let mut port = self.port;
        port.set_baud_rate(config.baud_rate)?;
        port.set_data_bits(to_serialport_data_bits(config.data_bits)?)?;
        port.set_stop_bits(to_serialport_stop_bits(config.stop_bits)?)?;
        port.set_parity(to_serialport_parity(config.parity)?)?;
        port.set_flow_control(FlowControl::None)?;

        Ok(Box::new(SerialportLink { port }))
    }
}

struct SerialportLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for SerialportLink {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port.set_timeout(timeout)?;
        self.port.read(buf)
    }

    fn write_all(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout)?;
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        let port = self.port.try_clone()?;
        Ok(Box::new(SerialportLink { port }))
    }

    fn close(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
