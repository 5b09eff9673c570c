use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use super::{DeviceDescriptor, DeviceRegistry, RegistryError, SessionState};
use crate::config::BridgeConfig;
use crate::serial::stream::{
    DeliveryContext, InlineDelivery, Publisher, StreamDiagnostic, StreamError, StreamHandle, StreamMetrics,
    StreamSink, StreamState, StreamingLoop, Subscriber,
};
use crate::serial::{ConnectError, DisconnectError, PortSession, UsbHost, WriteError};

const DIAGNOSTICS_CAPACITY: usize = 64;

/// Returned by a successful `start_streaming`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub session_id: Uuid,
    pub buffer_size: usize,
    pub read_timeout_ms: u64,
    pub started_at: DateTime<Utc>,
}

struct ManagerState {
    state: SessionState,
    session: Option<PortSession>,
    stream: StreamHandle,
    /// Reader thread being joined by an in-flight lifecycle call
    joining: Option<ThreadId>,
}

/// Central session management.
///
/// Lifecycle calls (connect, disconnect, send, start/stop streaming) are
/// serialized, so there is at most one open session and at most one reader
/// thread at any time. Shutdown order is always: stop the reader, then close
/// the port.
///
/// The reader is joined with the state lock released. While a join is in
/// flight other lifecycle callers wait on `settled`; the reader thread itself
/// (a sink calling back in) never waits, and gets `Busy` for calls that would
/// reopen or restart.
pub struct SessionManager {
    registry: DeviceRegistry,
    config: BridgeConfig,
    inner: Mutex<ManagerState>,
    settled: Condvar,
    subscriber: Subscriber,
    context: Arc<dyn DeliveryContext>,
    diagnostics_tx: broadcast::Sender<StreamDiagnostic>,
    metrics_tx: Arc<watch::Sender<StreamMetrics>>,
}

impl SessionManager {
    pub fn new(host: Arc<dyn UsbHost>, config: BridgeConfig) -> Self {
        let registry = DeviceRegistry::new(host, config.manual_overrides.clone());
        let (diagnostics_tx, _) = broadcast::channel(DIAGNOSTICS_CAPACITY);
        let (metrics_tx, _) = watch::channel(StreamMetrics::default());
        Self {
            registry,
            config,
            inner: Mutex::new(ManagerState {
                state: SessionState::Closed,
                session: None,
                stream: StreamHandle::idle(),
                joining: None,
            }),
            settled: Condvar::new(),
            subscriber: Subscriber::default(),
            context: Arc::new(InlineDelivery),
            diagnostics_tx,
            metrics_tx: Arc::new(metrics_tx),
        }
    }

    /// Run subscriber callbacks on `context` instead of the reader thread
    pub fn with_delivery(mut self, context: Arc<dyn DeliveryContext>) -> Self {
        self.context = context;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock for a lifecycle call. Waits out an in-flight join unless the
    /// caller is the reader being joined, which is reported as reentrant.
    fn lock_settled(&self) -> (MutexGuard<'_, ManagerState>, bool) {
        let me = thread::current().id();
        let mut inner = self.lock();
        loop {
            let joining = inner.joining;
            match joining {
                None => return (inner, false),
                Some(reader) if reader == me => return (inner, true),
                Some(_) => inner = self.settled.wait(inner).unwrap_or_else(|e| e.into_inner()),
            }
        }
    }

    /// Stop the reader, joining it with the lock released.
    ///
    /// From the reader thread itself only the cancel flag is raised; the
    /// handle stays in place and a later lifecycle call joins it.
    fn halt_stream<'a>(&'a self, mut inner: MutexGuard<'a, ManagerState>) -> MutexGuard<'a, ManagerState> {
        let Some(reader) = inner.stream.thread_id() else {
            return inner;
        };
        inner.stream.cancel();
        if reader == thread::current().id() {
            log::debug!("Streaming stop requested from a delivery callback");
            return inner;
        }

        let mut handle = std::mem::take(&mut inner.stream);
        inner.joining = Some(reader);
        drop(inner);

        handle.stop();

        let mut inner = self.lock();
        inner.joining = None;
        self.settled.notify_all();
        log::info!("Data streaming stopped");
        inner
    }

    /// Enumerate usable serial devices
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, RegistryError> {
        self.registry.list_devices()
    }

    /// Connect to the configured target, replacing any open session
    pub fn connect(&self) -> Result<DeviceDescriptor, ConnectError> {
        let (mut inner, reentrant) = self.lock_settled();
        if reentrant {
            return Err(ConnectError::Busy);
        }
        self.reap_locked(&mut inner);
        let mut inner = self.halt_stream(inner);
        self.open_locked(&mut inner)
    }

    /// Open a new session; the stream must already be halted
    fn open_locked(&self, inner: &mut ManagerState) -> Result<DeviceDescriptor, ConnectError> {
        if inner.session.is_some() {
            log::info!("Closing current session before reconnecting");
            if let Err(e) = Self::close_session(inner) {
                log::warn!("Previous session did not close cleanly: {}", e);
            }
        }
        inner.state = SessionState::Closed;

        let matcher = self.config.target.matcher();
        let Some((device, descriptor)) = self.registry.locate(&matcher)? else {
            log::warn!("Target device {} not found", matcher);
            return Err(ConnectError::DeviceNotFound(matcher.to_string()));
        };

        inner.state = SessionState::Opening;
        log::info!("Attempting to connect to {} ({})", descriptor.name, matcher);

        match PortSession::open(&self.registry, &device, &self.config.serial) {
            Ok(session) => {
                let descriptor = session.descriptor().clone();
                inner.session = Some(session);
                inner.state = SessionState::Open;
                log::info!("Successfully connected to device: {}", descriptor.name);
                Ok(descriptor)
            }
            Err(e) => {
                log::error!("Connection failed: {}", e);
                inner.state = SessionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Stop streaming (if running), then close the port. Succeeds when idle.
    pub fn disconnect(&self) -> Result<(), DisconnectError> {
        let (mut inner, reentrant) = self.lock_settled();
        if reentrant {
            // the call joining this reader closes the port next
            return Ok(());
        }
        self.reap_locked(&mut inner);
        let mut inner = self.halt_stream(inner);
        Self::close_session(&mut inner)
    }

    fn close_session(inner: &mut ManagerState) -> Result<(), DisconnectError> {
        inner.state = SessionState::Closed;
        match inner.session.take() {
            Some(mut session) => {
                session.close()?;
                log::info!("Disconnected from device");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Write `data`, connecting first if no session is open
    pub fn send(&self, data: &[u8]) -> Result<(), WriteError> {
        let (mut inner, reentrant) = self.lock_settled();
        self.reap_locked(&mut inner);

        if !inner.session.as_ref().map_or(false, PortSession::is_open) {
            if reentrant {
                return Err(ConnectError::Busy.into());
            }
            log::info!("Not connected; attempting implicit connect before write");
            inner = self.halt_stream(inner);
            self.open_locked(&mut inner)?;
        }

        let session = inner.session.as_mut().ok_or(WriteError::NotConnected)?;
        session.write(data, self.config.write_timeout())?;
        log::debug!("Data written to device");
        Ok(())
    }

    /// Spawn the background reader for the open session
    pub fn start_streaming(&self) -> Result<StreamInfo, StreamError> {
        let (mut inner, reentrant) = self.lock_settled();
        if reentrant {
            return Err(StreamError::Busy);
        }
        self.reap_locked(&mut inner);

        let stream_state = inner.stream.state();
        match stream_state {
            StreamState::Running => return Err(StreamError::AlreadyRunning),
            StreamState::Stopping => {
                inner = self.halt_stream(inner);
                if inner.stream.thread_id().is_some() {
                    return Err(StreamError::Busy);
                }
            }
            StreamState::Idle => {}
        }

        let session = match inner.session.as_ref() {
            Some(session) if session.is_open() => session,
            _ => return Err(StreamError::NotConnected),
        };
        let session_id = session.id();
        let reader = session.reader().map_err(StreamError::Spawn)?;

        if !self.subscriber.is_attached() {
            log::info!("No stream listener attached; reads are dropped until one subscribes");
        }
        let publisher = Publisher::new(
            self.subscriber.clone(),
            self.context.clone(),
            self.diagnostics_tx.clone(),
            self.metrics_tx.clone(),
        );
        let options = self.config.stream_options();
        inner.stream = StreamingLoop::start(reader, publisher.into_callback(), options)?;

        Ok(StreamInfo {
            session_id,
            buffer_size: options.buffer_size,
            read_timeout_ms: options.read_timeout.as_millis() as u64,
            started_at: Utc::now(),
        })
    }

    /// Stop the reader and wait for it to exit. Always succeeds.
    pub fn stop_streaming(&self) {
        let (mut inner, reentrant) = self.lock_settled();
        if reentrant {
            return;
        }
        self.reap_locked(&mut inner);
        if inner.stream.thread_id().is_none() {
            log::debug!("No data streaming in progress");
            return;
        }
        drop(self.halt_stream(inner));
    }

    /// Join a reader that exited on its own and tear down a faulted session.
    /// Only finished threads are joined here, so this never blocks.
    fn reap_locked(&self, inner: &mut ManagerState) {
        if !inner.stream.has_exited() {
            return;
        }
        let faulted = inner.stream.faulted();
        inner.stream.stop();
        if faulted {
            log::warn!("Reader exited on I/O fault; closing session");
            if let Err(e) = Self::close_session(inner) {
                log::warn!("Close after fault failed: {}", e);
            }
        }
    }

    /// Attach the push-channel listener. Replaces any previous one.
    pub fn subscribe(&self, sink: Arc<dyn StreamSink>) {
        self.subscriber.attach(sink);
    }

    /// Detach the listener; later reads are dropped until one attaches again.
    pub fn unsubscribe(&self) {
        self.subscriber.detach();
    }

    pub fn session_state(&self) -> SessionState {
        let mut inner = self.lock();
        self.reap_locked(&mut inner);
        inner.state.clone()
    }

    pub fn stream_state(&self) -> StreamState {
        let inner = self.lock();
        if inner.joining.is_some() {
            return StreamState::Stopping;
        }
        inner.stream.state()
    }

    pub fn connected_device(&self) -> Option<DeviceDescriptor> {
        let inner = self.lock();
        inner.session.as_ref().filter(|s| s.is_open()).map(|s| s.descriptor().clone())
    }

    pub fn metrics(&self) -> watch::Receiver<StreamMetrics> {
        self.metrics_tx.subscribe()
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<StreamDiagnostic> {
        self.diagnostics_tx.subscribe()
    }

    /// Stop streaming and close the port; used on application teardown
    pub fn shutdown(&self) {
        if let Err(e) = self.disconnect() {
            log::warn!("Shutdown close failed: {}", e);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
