pub mod delivery;
pub mod reader;
pub mod types;

pub use delivery::{DeliveryContext, DeliveryJob, DispatchError, InlineDelivery, Publisher, TokioDelivery};
pub use reader::{StreamHandle, StreamOptions, StreamingLoop};
pub use types::{OnData, SinkError, StreamDiagnostic, StreamEvent, StreamMetrics, StreamSink, StreamState, Subscriber};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Data streaming already in progress")]
    AlreadyRunning,

    #[error("Serial port not connected")]
    NotConnected,

    /// The reader is being stopped by a call that is still in flight
    #[error("Data streaming is stopping")]
    Busy,

    #[error("Failed to start reader: {0}")]
    Spawn(#[source] std::io::Error),
}

impl StreamError {
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::AlreadyRunning => "ALREADY_STREAMING",
            StreamError::NotConnected => "SERIAL_PORT_NOT_FOUND",
            StreamError::Busy => "DEVICE_BUSY",
            StreamError::Spawn(_) => "STREAM_START_FAILED",
        }
    }
}
