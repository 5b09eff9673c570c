//! Delivery of stream events onto the consumer's execution context.
//!
//! Delivery is at-most-once and best-effort: each read produces exactly one
//! delivery attempt, and when no sink is attached at delivery time the bytes
//! of that read are dropped and counted. Nothing is queued for late listeners,
//! and a context that cannot take the job right away drops it.
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};

use super::types::{OnData, StreamDiagnostic, StreamEvent, StreamMetrics, Subscriber};

pub type DeliveryJob = Box<dyn FnOnce() + Send + 'static>;

/// Jobs a `TokioDelivery` holds before new ones are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("delivery queue full")]
    Full,

    #[error("delivery context closed")]
    Closed,
}

/// Where subscriber callbacks run
pub trait DeliveryContext: Send + Sync {
    fn dispatch(&self, job: DeliveryJob) -> Result<(), DispatchError>;
}

/// Runs callbacks directly on the reader thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDelivery;

impl DeliveryContext for InlineDelivery {
    fn dispatch(&self, job: DeliveryJob) -> Result<(), DispatchError> {
        job();
        Ok(())
    }
}

/// Runs callbacks in order on a single task of a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioDelivery {
    tx: mpsc::Sender<DeliveryJob>,
}

impl TokioDelivery {
    pub fn spawn(handle: &tokio::runtime::Handle) -> Self {
        Self::with_capacity(handle, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(handle: &tokio::runtime::Handle, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<DeliveryJob>(capacity.max(1));
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { tx }
    }
}

impl DeliveryContext for TokioDelivery {
    fn dispatch(&self, job: DeliveryJob) -> Result<(), DispatchError> {
        self.tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => DispatchError::Full,
            TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

/// Fans reader events out to the attached sink, metrics and diagnostics
#[derive(Clone)]
pub struct Publisher {
    subscriber: Subscriber,
    context: Arc<dyn DeliveryContext>,
    diagnostics_tx: broadcast::Sender<StreamDiagnostic>,
    metrics_tx: Arc<watch::Sender<StreamMetrics>>,
}

impl Publisher {
    pub fn new(
        subscriber: Subscriber,
        context: Arc<dyn DeliveryContext>,
        diagnostics_tx: broadcast::Sender<StreamDiagnostic>,
        metrics_tx: Arc<watch::Sender<StreamMetrics>>,
    ) -> Self {
        Self { subscriber, context, diagnostics_tx, metrics_tx }
    }

    pub fn publish(&self, event: StreamEvent) {
        match &event {
            StreamEvent::Data { bytes } => {
                let len = bytes.len() as u64;
                self.metrics_tx.send_modify(|m| {
                    m.chunks_read += 1;
                    m.bytes_read += len;
                });
            }
            StreamEvent::Terminated { reason } => {
                let message = reason.clone();
                self.metrics_tx.send_modify(|m| m.last_error = Some(message.clone()));
                let _ = self.diagnostics_tx.send(StreamDiagnostic::ReadFault { message });
            }
        }

        let rejected_len = match &event {
            StreamEvent::Data { bytes } => Some(bytes.len()),
            StreamEvent::Terminated { .. } => None,
        };
        let subscriber = self.subscriber.clone();
        let diagnostics_tx = self.diagnostics_tx.clone();
        let metrics_tx = self.metrics_tx.clone();

        let dispatched = self.context.dispatch(Box::new(move || {
            let Some(sink) = subscriber.current() else {
                if let StreamEvent::Data { bytes } = &event {
                    log::debug!("No active sink; dropped {} bytes", bytes.len());
                    metrics_tx.send_modify(|m| m.dropped += 1);
                    let _ = diagnostics_tx.send(StreamDiagnostic::Dropped { len: bytes.len() });
                }
                return;
            };

            match sink.send(event) {
                Ok(()) => metrics_tx.send_modify(|m| m.delivered += 1),
                Err(e) => {
                    log::warn!("Stream delivery failed: {}", e);
                    let message = e.to_string();
                    metrics_tx.send_modify(|m| {
                        m.delivery_failures += 1;
                        m.last_error = Some(message.clone());
                    });
                    let _ = diagnostics_tx.send(StreamDiagnostic::DeliveryFailed { message });
                }
            }
        }));

        if let Err(e) = dispatched {
            match rejected_len {
                Some(len) => {
                    log::debug!("Delivery rejected ({}); dropped {} bytes", e, len);
                    self.metrics_tx.send_modify(|m| m.dropped += 1);
                    let _ = self.diagnostics_tx.send(StreamDiagnostic::Dropped { len });
                }
                None => log::warn!("Termination notice not delivered: {}", e),
            }
        }
    }

    pub fn into_callback(self) -> OnData {
        Arc::new(move |event| self.publish(event))
    }
}
