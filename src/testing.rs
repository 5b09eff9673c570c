//! In-memory USB host and loopback serial port for exercising the session
//! manager without hardware.
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::device::{DriverFamily, UsbDevice};
use crate::serial::stream::{SinkError, StreamEvent, StreamSink};
use crate::serial::{SerialConfig, SerialLink, UsbConnection, UsbHost};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn usb_device(name: &str, vendor_id: u16, product_id: u16, system_id: u32) -> UsbDevice {
    UsbDevice {
        name: name.to_string(),
        product_name: Some(name.to_string()),
        manufacturer: None,
        vendor_id,
        product_id,
        system_id,
        serial_number: None,
        cdc_acm: false,
    }
}

#[derive(Default)]
struct BusInner {
    queue: Mutex<VecDeque<u8>>,
    ready: Condvar,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    live_links: AtomicUsize,
    active_readers: AtomicUsize,
    max_active_readers: AtomicUsize,
    written: Mutex<Vec<u8>>,
    trace: Mutex<Vec<String>>,
    last_open: Mutex<Option<(usize, SerialConfig)>>,
}

/// Shared wire behind every link opened on a `LoopbackHost`. Written bytes are
/// echoed back to readers; `inject` simulates device-originated data.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self) -> Box<dyn SerialLink> {
        Box::new(LoopbackLink::new(self.clone(), "primary"))
    }

    pub fn inject(&self, data: &[u8]) {
        lock(&self.inner.queue).extend(data.iter().copied());
        self.inner.ready.notify_all();
    }

    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
        self.inner.ready.notify_all();
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.inner.written).clone()
    }

    /// Links currently alive (primary plus cloned readers)
    pub fn live_links(&self) -> usize {
        self.inner.live_links.load(Ordering::SeqCst)
    }

    /// Highest number of reads ever in flight at the same time
    pub fn max_concurrent_reads(&self) -> usize {
        self.inner.max_active_readers.load(Ordering::SeqCst)
    }

    /// Ordered record of link lifecycle events ("close", "reader released", ...)
    pub fn trace(&self) -> Vec<String> {
        lock(&self.inner.trace).clone()
    }

    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if lock(&self.inner.queue).is_empty() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn record(&self, entry: String) {
        lock(&self.inner.trace).push(entry);
    }
}

struct LoopbackLink {
    bus: LoopbackBus,
    role: &'static str,
}

impl LoopbackLink {
    fn new(bus: LoopbackBus, role: &'static str) -> Self {
        bus.inner.live_links.fetch_add(1, Ordering::SeqCst);
        Self { bus, role }
    }
}

impl SerialLink for LoopbackLink {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let inner = &self.bus.inner;
        let active = inner.active_readers.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_active_readers.fetch_max(active, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        let mut queue = lock(&inner.queue);
        let result = loop {
            if inner.fail_reads.load(Ordering::SeqCst) {
                break Err(io::Error::new(io::ErrorKind::BrokenPipe, "device detached"));
            }
            if !queue.is_empty() {
                let n = buf.len().min(queue.len());
                for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
                    *slot = byte;
                }
                break Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            queue = inner
                .ready
                .wait_timeout(queue, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        };
        drop(queue);

        inner.active_readers.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn write_all(&mut self, data: &[u8], _timeout: Duration) -> io::Result<()> {
        if self.bus.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write rejected"));
        }
        lock(&self.bus.inner.written).extend_from_slice(data);
        self.bus.inject(data);
        Ok(())
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(LoopbackLink::new(self.bus.clone(), "reader")))
    }

    fn close(&mut self) -> io::Result<()> {
        self.bus.record("close".to_string());
        Ok(())
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.bus.inner.live_links.fetch_sub(1, Ordering::SeqCst);
        self.bus.record(format!("{} released", self.role));
    }
}

struct LoopbackConnection {
    bus: LoopbackBus,
    fail_configure: bool,
}

impl UsbConnection for LoopbackConnection {
    fn open_port(
        self: Box<Self>,
        _driver: DriverFamily,
        port_index: usize,
        config: &SerialConfig,
    ) -> io::Result<Box<dyn SerialLink>> {
        if self.fail_configure {
            return Err(io::Error::new(io::ErrorKind::Other, "setParameters failed"));
        }
        *lock(&self.bus.inner.last_open) = Some((port_index, config.clone()));
        self.bus.record("open".to_string());
        Ok(self.bus.link())
    }
}

/// Scriptable `UsbHost` whose devices all share one `LoopbackBus`
pub struct LoopbackHost {
    devices: Mutex<Vec<UsbDevice>>,
    bus: LoopbackBus,
    port_count: AtomicUsize,
    fail_enumeration: AtomicBool,
    refuse_connections: AtomicBool,
    fail_configure: AtomicBool,
    open_attempts: AtomicUsize,
}

impl LoopbackHost {
    pub fn new(devices: Vec<UsbDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            bus: LoopbackBus::new(),
            port_count: AtomicUsize::new(1),
            fail_enumeration: AtomicBool::new(false),
            refuse_connections: AtomicBool::new(false),
            fail_configure: AtomicBool::new(false),
            open_attempts: AtomicUsize::new(0),
        }
    }

    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    pub fn set_devices(&self, devices: Vec<UsbDevice>) {
        *lock(&self.devices) = devices;
    }

    pub fn set_port_count(&self, count: usize) {
        self.port_count.store(count, Ordering::SeqCst);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_configure(&self, fail: bool) {
        self.fail_configure.store(fail, Ordering::SeqCst);
    }

    /// Number of `open_device` calls so far
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn last_port_index(&self) -> Option<usize> {
        lock(&self.bus.inner.last_open).as_ref().map(|(index, _)| *index)
    }

    pub fn last_config(&self) -> Option<SerialConfig> {
        lock(&self.bus.inner.last_open).as_ref().map(|(_, config)| config.clone())
    }
}

impl UsbHost for LoopbackHost {
    fn enumerate(&self) -> io::Result<Vec<UsbDevice>> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "usb service unavailable"));
        }
        Ok(lock(&self.devices).clone())
    }

    fn port_count(&self, _device: &UsbDevice, _driver: DriverFamily) -> usize {
        self.port_count.load(Ordering::SeqCst)
    }

    fn open_device(&self, _device: &UsbDevice) -> io::Result<Box<dyn UsbConnection>> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "openDevice returned null"));
        }
        Ok(Box::new(LoopbackConnection {
            bus: self.bus.clone(),
            fail_configure: self.fail_configure.load(Ordering::SeqCst),
        }))
    }
}

/// Sink that records every event it receives
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        lock(&self.events).clone()
    }

    pub fn data(&self) -> Vec<u8> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Data { bytes } => Some(bytes.as_slice()),
                StreamEvent::Terminated { .. } => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Poll until at least `len` data bytes arrived or `timeout` elapses
    pub fn wait_for_data(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        loop {
            let data = self.data();
            if data.len() >= len || Instant::now() >= deadline {
                return data;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl StreamSink for RecordingSink {
    fn send(&self, event: StreamEvent) -> Result<(), SinkError> {
        lock(&self.events).push(event);
        Ok(())
    }
}
