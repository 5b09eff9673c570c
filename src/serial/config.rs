use std::io;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, StopBits as SpStopBits};

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_DATA_BITS: u8 = 8;

/// Parity setting for serial port configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Stop bit setting for serial port configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

/// Line parameters applied to the port when a session opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

impl std::fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        };
        let stop = match self.stop_bits {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        };
        write!(f, "{} {}{}{}", self.baud_rate, self.data_bits, parity, stop)
    }
}

// The serialport crate only knows None/Odd/Even and 1/2 stop bits. Anything else
// is rejected when the port is configured rather than silently approximated.

pub fn to_serialport_parity(p: Parity) -> io::Result<SpParity> {
    match p {
        Parity::None => Ok(SpParity::None),
        Parity::Odd => Ok(SpParity::Odd),
        Parity::Even => Ok(SpParity::Even),
        Parity::Mark | Parity::Space => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("parity {:?} is not supported by this backend", p),
        )),
    }
}

pub fn to_serialport_data_bits(bits: u8) -> io::Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported data bits: {}", other),
        )),
    }
}

pub fn to_serialport_stop_bits(bits: StopBits) -> io::Result<SpStopBits> {
    match bits {
        StopBits::One => Ok(SpStopBits::One),
        StopBits::Two => Ok(SpStopBits::Two),
        StopBits::OnePointFive => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "1.5 stop bits are not supported by this backend",
        )),
    }
}
