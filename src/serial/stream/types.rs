//! Streaming core types
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Idle,
    Running,
    Stopping,
}

/// What the reader publishes to the subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    Data { bytes: Vec<u8> },
    /// The reader hit an unrecoverable I/O fault and has exited
    Terminated { reason: String },
}

/// Out-of-band notices about delivery, published on the diagnostics channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamDiagnostic {
    Dropped { len: usize },
    DeliveryFailed { message: String },
    ReadFault { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StreamMetrics {
    pub chunks_read: u64,
    pub bytes_read: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub delivery_failures: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Receiver end of the push channel
pub trait StreamSink: Send + Sync {
    fn send(&self, event: StreamEvent) -> Result<(), SinkError>;
}

impl<F> StreamSink for F
where
    F: Fn(StreamEvent) -> Result<(), SinkError> + Send + Sync,
{
    fn send(&self, event: StreamEvent) -> Result<(), SinkError> {
        self(event)
    }
}

/// Slot holding the currently listening sink, if any
#[derive(Clone, Default)]
pub struct Subscriber {
    slot: Arc<RwLock<Option<Arc<dyn StreamSink>>>>,
}

impl Subscriber {
    pub fn attach(&self, sink: Arc<dyn StreamSink>) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    pub fn detach(&self) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn current(&self) -> Option<Arc<dyn StreamSink>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_attached(&self) -> bool {
        self.current().is_some()
    }
}

/// Callback the reader invokes once per non-empty read and once on termination
pub type OnData = Arc<dyn Fn(StreamEvent) + Send + Sync>;
