//! Background serial reader thread
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use super::types::{OnData, StreamEvent, StreamState};
use super::StreamError;
use crate::serial::session::read_chunk;
use crate::serial::SerialLink;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub buffer_size: usize,
    pub read_timeout: Duration,
}

/// A running (or finished) background reader.
///
/// `stop` is cooperative: it raises the cancel flag and joins the thread, so
/// it can block for up to one read timeout. Called from the reader thread
/// itself it only raises the flag; the thread is joined by a later `stop`.
pub struct StreamHandle {
    cancel: Arc<AtomicBool>,
    faulted: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn idle() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            faulted: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn state(&self) -> StreamState {
        match &self.thread {
            None => StreamState::Idle,
            Some(t) if t.is_finished() => StreamState::Idle,
            Some(_) if self.cancel.load(Ordering::Acquire) => StreamState::Stopping,
            Some(_) => StreamState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// The thread ended on its own (read fault) and has not been joined yet
    pub fn has_exited(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| t.is_finished())
    }

    pub fn faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Id of the reader thread while it has not been joined
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread.as_ref().map(|t| t.thread().id())
    }

    /// Ask the reader to exit after its current read or delivery
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Signal cancellation and wait for the reader thread to exit.
    /// No-op on an idle handle.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.cancel.store(true, Ordering::Release);
        if thread.thread().id() == std::thread::current().id() {
            log::debug!("Stop requested from the reader thread; deferring join");
            self.thread = Some(thread);
            return;
        }
        let name = thread.thread().name().unwrap_or("serial-reader").to_string();
        if thread.join().is_err() {
            log::error!("Reader thread {} panicked", name);
        } else {
            log::debug!("Reader thread {} joined", name);
        }
    }
}

impl Default for StreamHandle {
    fn default() -> Self {
        Self::idle()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct StreamingLoop;

impl StreamingLoop {
    /// Spawn the reader. Every non-empty read is handed to `on_data` exactly
    /// once; a read fault produces a final `Terminated` event.
    pub fn start(reader: Box<dyn SerialLink>, on_data: OnData, options: StreamOptions) -> Result<StreamHandle, StreamError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let faulted = Arc::new(AtomicBool::new(false));

        let thread = {
            let cancel = cancel.clone();
            let faulted = faulted.clone();
            std::thread::Builder::new()
                .name("serial-reader".into())
                .spawn(move || run_reader(reader, on_data, options, cancel, faulted))
                .map_err(StreamError::Spawn)?
        };

        log::info!(
            "Streaming started (buffer {} bytes, read timeout {:?})",
            options.buffer_size,
            options.read_timeout
        );
        Ok(StreamHandle { cancel, faulted, thread: Some(thread) })
    }
}

fn run_reader(
    mut reader: Box<dyn SerialLink>,
    on_data: OnData,
    options: StreamOptions,
    cancel: Arc<AtomicBool>,
    faulted: Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; options.buffer_size.max(1)];

    while !cancel.load(Ordering::Acquire) {
        match read_chunk(reader.as_mut(), &mut buffer, options.read_timeout) {
            Ok(0) => {}
            Ok(n) => {
                log::debug!("Received stream response: {:?}", &buffer[..n]);
                on_data(StreamEvent::Data { bytes: buffer[..n].to_vec() });
            }
            Err(e) => {
                log::error!("Error reading data: {}", e);
                faulted.store(true, Ordering::Release);
                on_data(StreamEvent::Terminated { reason: describe(&e) });
                break;
            }
        }
    }
    log::info!("Streaming loop exited");
}

fn describe(e: &io::Error) -> String {
    format!("{:?}: {}", e.kind(), e)
}
