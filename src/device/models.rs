use serde::{Deserialize, Serialize};

/// How a device's serial driver was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverKind {
    StandardProbed,
    ManualOverride,
}

/// USB-serial driver families known to the prober
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverFamily {
    CdcAcm,
    Ftdi,
    Cp21xx,
    Ch34x,
    Prolific,
}

/// Raw device as reported by the platform, before driver resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub name: String,
    pub product_name: Option<String>,
    pub manufacturer: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub system_id: u32,
    pub serial_number: Option<String>,
    /// Device exposes a CDC-ACM communication interface
    pub cdc_acm: bool,
}

/// Immutable snapshot of a discovered, usable serial device.
///
/// Recomputed on every enumeration. Only `(vendor_id, product_id, system_id)`
/// identifies a device across calls; list positions do not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub name: String,
    pub product_name: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub system_id: u32,
    pub serial_number: Option<String>,
    pub driver_kind: DriverKind,
    pub driver: DriverFamily,
    pub port_count: usize,
}

impl DeviceDescriptor {
    pub fn identity(&self) -> (u16, u16, u32) {
        (self.vendor_id, self.product_id, self.system_id)
    }
}

/// Selects the target device among enumerated descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMatcher {
    Identity { vendor_id: u16, product_id: u16 },
    /// Legacy matching on the human-readable product name
    ProductName(String),
}

impl DeviceMatcher {
    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        match self {
            DeviceMatcher::Identity { vendor_id, product_id } => {
                descriptor.vendor_id == *vendor_id && descriptor.product_id == *product_id
            }
            DeviceMatcher::ProductName(name) => descriptor.product_name.as_deref() == Some(name.as_str()),
        }
    }
}

impl std::fmt::Display for DeviceMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMatcher::Identity { vendor_id, product_id } => write!(f, "{:04x}:{:04x}", vendor_id, product_id),
            DeviceMatcher::ProductName(name) => write!(f, "product \"{}\"", name),
        }
    }
}

/// Session connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Failed(String),
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Open)
    }
}
