use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{DeviceDescriptor, DeviceMatcher, DriverFamily, DriverKind, Result, UsbDevice};
use crate::serial::UsbHost;

// Vendor ids of the standard USB-serial bridge chips
pub const FTDI_VID: u16 = 0x0403;
pub const SILABS_VID: u16 = 0x10C4;
pub const WCH_VID: u16 = 0x1A86;
pub const PROLIFIC_VID: u16 = 0x067B;

/// Forces a driver for a vendor/product pair the standard prober does not know
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub vendor_id: u16,
    pub product_id: u16,
    pub driver: DriverFamily,
}

/// Standard driver probing by bridge-chip vendor or CDC-ACM class
pub fn probe_standard(device: &UsbDevice) -> Option<DriverFamily> {
    match device.vendor_id {
        FTDI_VID => Some(DriverFamily::Ftdi),
        SILABS_VID => Some(DriverFamily::Cp21xx),
        WCH_VID => Some(DriverFamily::Ch34x),
        PROLIFIC_VID => Some(DriverFamily::Prolific),
        _ if device.cdc_acm => Some(DriverFamily::CdcAcm),
        _ => None,
    }
}

/// Enumerates USB devices and classifies them against known serial drivers
pub struct DeviceRegistry {
    host: Arc<dyn UsbHost>,
    overrides: Vec<ManualOverride>,
}

impl DeviceRegistry {
    pub fn new(host: Arc<dyn UsbHost>, overrides: Vec<ManualOverride>) -> Self {
        Self { host, overrides }
    }

    pub fn host(&self) -> &dyn UsbHost {
        self.host.as_ref()
    }

    /// Resolve the serial driver for a device: standard probing first, then
    /// the manual override table.
    pub fn resolve_driver(&self, device: &UsbDevice) -> Option<(DriverKind, DriverFamily)> {
        if let Some(family) = probe_standard(device) {
            return Some((DriverKind::StandardProbed, family));
        }
        self.overrides
            .iter()
            .find(|o| o.vendor_id == device.vendor_id && o.product_id == device.product_id)
            .map(|o| (DriverKind::ManualOverride, o.driver))
    }

    /// Build a descriptor, or `None` when the device has no usable serial port
    pub fn describe(&self, device: &UsbDevice) -> Option<DeviceDescriptor> {
        let label = device.product_name.as_deref().unwrap_or(&device.name);

        let Some((driver_kind, driver)) = self.resolve_driver(device) else {
            log::warn!("No driver found for device: {}", label);
            return None;
        };

        let port_count = self.host.port_count(device, driver);
        if port_count == 0 {
            log::warn!("No ports found for device: {}", label);
            return None;
        }

        Some(DeviceDescriptor {
            name: device.name.clone(),
            product_name: device.product_name.clone(),
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            system_id: device.system_id,
            serial_number: device.serial_number.clone(),
            driver_kind,
            driver,
            port_count,
        })
    }

    /// List usable serial devices in platform enumeration order
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.host.enumerate()?;
        Ok(devices.iter().filter_map(|d| self.describe(d)).collect())
    }

    pub fn find_device(&self, matcher: &DeviceMatcher) -> Result<Option<DeviceDescriptor>> {
        Ok(self.locate(matcher)?.map(|(_, descriptor)| descriptor))
    }

    /// Like `find_device`, also returning the raw platform device for opening
    pub fn locate(&self, matcher: &DeviceMatcher) -> Result<Option<(UsbDevice, DeviceDescriptor)>> {
        for device in self.host.enumerate()? {
            if let Some(descriptor) = self.describe(&device) {
                if matcher.matches(&descriptor) {
                    return Ok(Some((device, descriptor)));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{usb_device, LoopbackHost};

    fn registry(host: &Arc<LoopbackHost>) -> DeviceRegistry {
        let overrides = vec![ManualOverride { vendor_id: 12216, product_id: 8661, driver: DriverFamily::CdcAcm }];
        DeviceRegistry::new(host.clone(), overrides)
    }

    #[test]
    fn standard_probe_wins_over_override() {
        let host = Arc::new(LoopbackHost::new(vec![usb_device("/dev/ttyUSB0", FTDI_VID, 0x6001, 1)]));
        let listed = registry(&host).list_devices().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].driver_kind, DriverKind::StandardProbed);
        assert_eq!(listed[0].driver, DriverFamily::Ftdi);
    }

    #[test]
    fn manual_override_applies_when_probe_fails() {
        let host = Arc::new(LoopbackHost::new(vec![usb_device("a80", 12216, 8661, 2)]));
        let listed = registry(&host).list_devices().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].driver_kind, DriverKind::ManualOverride);
        assert_eq!(listed[0].driver, DriverFamily::CdcAcm);
    }

    #[test]
    fn unknown_devices_are_excluded() {
        let host = Arc::new(LoopbackHost::new(vec![usb_device("mouse", 0x046D, 0xC077, 3)]));
        assert!(registry(&host).list_devices().unwrap().is_empty());
    }

    #[test]
    fn devices_without_ports_are_excluded() {
        let host = Arc::new(LoopbackHost::new(vec![usb_device("/dev/ttyUSB0", SILABS_VID, 0xEA60, 4)]));
        host.set_port_count(0);
        assert!(registry(&host).list_devices().unwrap().is_empty());
    }

    #[test]
    fn find_device_by_identity() {
        let host = Arc::new(LoopbackHost::new(vec![
            usb_device("/dev/ttyUSB0", FTDI_VID, 0x6001, 1),
            usb_device("a80", 12216, 8661, 2),
        ]));
        let found = registry(&host)
            .find_device(&DeviceMatcher::Identity { vendor_id: 12216, product_id: 8661 })
            .unwrap()
            .expect("device");
        assert_eq!(found.system_id, 2);

        let missing = registry(&host)
            .find_device(&DeviceMatcher::Identity { vendor_id: 1, product_id: 1 })
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn enumeration_failure_is_reported() {
        let host = Arc::new(LoopbackHost::new(Vec::new()));
        host.fail_enumeration(true);
        assert!(registry(&host).list_devices().is_err());
    }
}
