use std::sync::Arc;

use serde::Serialize;
use tauri::{AppHandle, Emitter, State};

use crate::device::{DeviceDescriptor, SessionManager, SessionState, StreamInfo};
use crate::serial::stream::{
    DeliveryContext, DeliveryJob, DispatchError, SinkError, StreamEvent, StreamSink, StreamState,
};

pub const DATA_EVENT: &str = "usb-stream://data";
pub const TERMINATED_EVENT: &str = "usb-stream://terminated";

/// Runs stream deliveries on the application's main thread
pub struct MainThreadDelivery {
    app: AppHandle,
}

impl MainThreadDelivery {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl DeliveryContext for MainThreadDelivery {
    fn dispatch(&self, job: DeliveryJob) -> Result<(), DispatchError> {
        self.app.run_on_main_thread(job).map_err(|e| {
            log::warn!("Failed to schedule delivery on main thread: {}", e);
            DispatchError::Closed
        })
    }
}

/// Forwards stream events to the frontend as app events
struct EventSink {
    app: AppHandle,
}

impl StreamSink for EventSink {
    fn send(&self, event: StreamEvent) -> Result<(), SinkError> {
        let result = match &event {
            StreamEvent::Data { bytes } => self.app.emit(DATA_EVENT, bytes),
            StreamEvent::Terminated { reason } => self.app.emit(TERMINATED_EVENT, reason),
        };
        result.map_err(|e| SinkError(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session: SessionState,
    pub stream: StreamState,
    pub device: Option<DeviceDescriptor>,
}

/// Run a blocking manager call off the async runtime
async fn blocking<T, F>(manager: &Arc<SessionManager>, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(&SessionManager) -> Result<T, String> + Send + 'static,
{
    let manager = manager.clone();
    tauri::async_runtime::spawn_blocking(move || f(&manager))
        .await
        .map_err(|e| format!("ERROR: {}", e))?
}

/// List USB devices with a usable serial driver
#[tauri::command]
pub async fn list_available_drivers(
    manager: State<'_, Arc<SessionManager>>,
) -> Result<Vec<DeviceDescriptor>, String> {
    blocking(manager.inner(), |m| {
        m.list_devices().map_err(|e| format!("{}: {}", e.code(), e))
    })
    .await
}

/// Connect to the configured target device
#[tauri::command]
pub async fn connect_to_device(
    manager: State<'_, Arc<SessionManager>>,
) -> Result<DeviceDescriptor, String> {
    blocking(manager.inner(), |m| {
        m.connect().map_err(|e| format!("{}: {}", e.code(), e))
    })
    .await
}

/// Stop streaming and close the port
#[tauri::command]
pub async fn disconnect(
    manager: State<'_, Arc<SessionManager>>,
) -> Result<(), String> {
    blocking(manager.inner(), |m| {
        m.disconnect().map_err(|e| format!("{}: {}", e.code(), e))
    })
    .await
}

/// Write bytes to the device, connecting first if needed
#[tauri::command]
pub async fn send_data(
    data_to_send: Vec<u8>,
    manager: State<'_, Arc<SessionManager>>,
) -> Result<(), String> {
    blocking(manager.inner(), move |m| {
        m.send(&data_to_send).map_err(|e| format!("{}: {}", e.code(), e))
    })
    .await
}

#[tauri::command]
pub async fn start_data_streaming(
    manager: State<'_, Arc<SessionManager>>,
) -> Result<StreamInfo, String> {
    blocking(manager.inner(), |m| {
        m.start_streaming().map_err(|e| format!("{}: {}", e.code(), e))
    })
    .await
}

#[tauri::command]
pub async fn stop_data_streaming(
    manager: State<'_, Arc<SessionManager>>,
) -> Result<(), String> {
    blocking(manager.inner(), |m| {
        m.stop_streaming();
        Ok(())
    })
    .await
}

/// Frontend started listening on the stream events
#[tauri::command]
pub fn listen_stream(app: AppHandle, manager: State<'_, Arc<SessionManager>>) {
    log::debug!("Stream listener attached");
    manager.subscribe(Arc::new(EventSink { app }));
}

/// Frontend stopped listening; subsequent reads are dropped
#[tauri::command]
pub fn cancel_stream(manager: State<'_, Arc<SessionManager>>) {
    log::debug!("Stream listener detached");
    manager.unsubscribe();
}

#[tauri::command]
pub async fn session_status(
    manager: State<'_, Arc<SessionManager>>,
) -> Result<SessionStatus, String> {
    blocking(manager.inner(), |m| {
        Ok(SessionStatus {
            session: m.session_state(),
            stream: m.stream_state(),
            device: m.connected_device(),
        })
    })
    .await
}
