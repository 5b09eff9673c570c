use std::collections::HashSet;
use std::sync::Arc;

use connectusb_lib::device::{DriverFamily, DriverKind};
use connectusb_lib::serial::{ConnectError, WriteError};
use connectusb_lib::testing::{usb_device, LoopbackHost};
use connectusb_lib::{BridgeConfig, SessionManager, SessionState};

fn a80() -> connectusb_lib::device::UsbDevice {
    usb_device("A80", 12216, 8661, 7)
}

fn manager(host: &Arc<LoopbackHost>) -> SessionManager {
    let config = BridgeConfig { read_timeout_ms: 10, ..BridgeConfig::default() };
    SessionManager::new(host.clone(), config)
}

#[test]
fn list_devices_is_stable_and_skips_unknown_hardware() {
    let host = Arc::new(LoopbackHost::new(vec![
        a80(),
        usb_device("ftdi", 0x0403, 0x6001, 3),
        usb_device("keyboard", 0x046d, 0xc31c, 4),
    ]));
    let manager = manager(&host);

    let first = manager.list_devices().unwrap();
    let second = manager.list_devices().unwrap();
    let ids = |list: &[connectusb_lib::DeviceDescriptor]| list.iter().map(|d| d.identity()).collect::<HashSet<_>>();
    assert_eq!(ids(&first[..]), ids(&second[..]));
    assert_eq!(first.len(), 2);

    let target = first.iter().find(|d| d.vendor_id == 12216).unwrap();
    assert_eq!(target.driver_kind, DriverKind::ManualOverride);
    assert_eq!(target.driver, DriverFamily::CdcAcm);
    assert_eq!(target.port_count, 1);
}

#[test]
fn connect_without_match_reports_not_found() {
    let host = Arc::new(LoopbackHost::new(vec![usb_device("ftdi", 0x0403, 0x6001, 3)]));
    let manager = manager(&host);

    let err = manager.connect().unwrap_err();
    assert!(matches!(err, ConnectError::DeviceNotFound(_)), "got {:?}", err);
    assert_eq!(err.code(), "DEVICE_NOT_FOUND");
    assert_eq!(manager.session_state(), SessionState::Closed);
    assert_eq!(host.open_attempts(), 0);
}

#[test]
fn connect_opens_first_port_with_configured_parameters() {
    let host = Arc::new(LoopbackHost::new(vec![a80()]));
    let manager = manager(&host);

    let descriptor = manager.connect().unwrap();
    assert_eq!(descriptor.identity(), (12216, 8661, 7));
    assert_eq!(manager.session_state(), SessionState::Open);
    assert_eq!(manager.connected_device(), Some(descriptor));
    assert_eq!(host.last_port_index(), Some(0));
    assert_eq!(host.last_config().unwrap().to_string(), "9600 8N1");
}

#[test]
fn refused_connection_surfaces_as_connection_error() {
    let host = Arc::new(LoopbackHost::new(vec![a80()]));
    host.refuse_connections(true);
    let manager = manager(&host);

    let err = manager.connect().unwrap_err();
    assert!(matches!(err, ConnectError::ConnectionRefused(_)), "got {:?}", err);
    assert!(matches!(manager.session_state(), SessionState::Failed(_)));
    assert_eq!(host.bus().live_links(), 0);
}

#[test]
fn send_while_closed_connects_once() {
    let host = Arc::new(LoopbackHost::new(vec![a80()]));
    let manager = manager(&host);

    manager.send(b"AT\r\n").unwrap();
    assert_eq!(host.open_attempts(), 1);
    assert_eq!(host.bus().written(), b"AT\r\n");
    assert_eq!(manager.session_state(), SessionState::Open);

    manager.send(b"ID").unwrap();
    assert_eq!(host.open_attempts(), 1);
}

#[test]
fn send_surfaces_implicit_connect_failure() {
    let host = Arc::new(LoopbackHost::new(vec![a80()]));
    host.refuse_connections(true);
    let manager = manager(&host);

    let err = manager.send(b"AT").unwrap_err();
    assert!(matches!(err, WriteError::Connect(ConnectError::ConnectionRefused(_))), "got {:?}", err);
    assert_eq!(err.code(), "CONNECTION_FAILED");
    assert_eq!(host.open_attempts(), 1);
    assert!(host.bus().written().is_empty());
}

#[test]
fn write_failure_keeps_session_open() {
    let host = Arc::new(LoopbackHost::new(vec![a80()]));
    let manager = manager(&host);
    manager.connect().unwrap();

    host.bus().fail_writes(true);
    let err = manager.send(b"AT").unwrap_err();
    assert!(matches!(err, WriteError::IoFailure { .. }), "got {:?}", err);
    assert_eq!(err.code(), "DEVICE_WRITE");
    assert_eq!(manager.session_state(), SessionState::Open);

    host.bus().fail_writes(false);
    manager.send(b"AT").unwrap();
    assert_eq!(host.open_attempts(), 1);
}

#[test]
fn disconnect_is_idempotent() {
    let host = Arc::new(LoopbackHost::new(vec![a80()]));
    let manager = manager(&host);

    manager.disconnect().unwrap();
    manager.connect().unwrap();
    manager.disconnect().unwrap();
    manager.disconnect().unwrap();

    assert_eq!(manager.session_state(), SessionState::Closed);
    assert!(manager.connected_device().is_none());
    assert_eq!(host.bus().live_links(), 0);
    assert_eq!(host.bus().trace().iter().filter(|e| *e == "close").count(), 1);
}

#[test]
fn device_plugged_in_later_is_found_on_next_connect() {
    let host = Arc::new(LoopbackHost::new(Vec::new()));
    let manager = manager(&host);

    assert!(manager.list_devices().unwrap().is_empty());
    assert!(matches!(manager.connect(), Err(ConnectError::DeviceNotFound(_))));

    host.set_devices(vec![a80()]);
    assert_eq!(manager.list_devices().unwrap().len(), 1);
    manager.connect().unwrap();
    assert_eq!(manager.session_state(), SessionState::Open);
}
