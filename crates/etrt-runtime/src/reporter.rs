//! Error reporter
//!
//! One background thread per runtime (`etrt-notify`) consumes device
//! notifications. For each one it:
//!
//! 1. queues a [`StreamError`] on the owning stream when the command failed
//! 2. invokes the registered callbacks, outside every internal lock
//! 3. resolves the command's event, waking waiters
//!
//! Callbacks therefore observe a still-pending event. A callback must not
//! wait on the event it is called for, or on any later event of the same
//! runtime: the notification thread is the only one that resolves them.

use crate::error::{Error, Result};
use crate::event::EventTable;
use crate::ids::{DeviceId, EventId, StreamId};
use crate::stream::StreamEngine;
use crate::types::{PendingResult, StreamError};
use etrt_device::{CommandOutcome, DeviceFault, DeviceLayer, DeviceLayerError, DiagnosticBuffer, ErrorContext, Notification};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the notification thread blocks before re-checking for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Called for every device fault, with the failed operation's event
pub type StreamErrorCallback = dyn Fn(EventId, &StreamError) + Send + Sync;

/// Called for fatal kernel aborts; the callee owns the diagnostics
pub type KernelAbortedCallback = dyn Fn(EventId, KernelAbortContext) + Send + Sync;

/// Raw fault diagnostics of an aborted kernel
///
/// The bytes alias device-side diagnostic memory. Call
/// [`free_resources`](KernelAbortContext::free_resources) once done; it
/// consumes the context so the memory cannot be released twice. A context
/// dropped without it still releases the memory and logs a warning.
pub struct KernelAbortContext {
    event: EventId,
    diagnostics: Option<DiagnosticBuffer>,
}

impl KernelAbortContext {
    fn new(event: EventId, diagnostics: DiagnosticBuffer) -> Self {
        Self {
            event,
            diagnostics: Some(diagnostics),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.diagnostics {
            Some(diagnostics) => diagnostics.bytes(),
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Decoded hart state at the moment of the fault
    pub fn error_context(&self) -> Option<ErrorContext> {
        ErrorContext::from_bytes(self.bytes())
    }

    /// Give the diagnostic memory back to the device
    pub fn free_resources(mut self) {
        if let Some(diagnostics) = self.diagnostics.take() {
            diagnostics.release();
        }
    }
}

impl Drop for KernelAbortContext {
    fn drop(&mut self) {
        if let Some(diagnostics) = self.diagnostics.take() {
            tracing::warn!(event = %self.event, "kernel_abort_context_not_freed");
            diagnostics.release();
        }
    }
}

impl fmt::Debug for KernelAbortContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelAbortContext")
            .field("event", &self.event)
            .field("len", &self.len())
            .finish()
    }
}

/// Single-slot callback registrations of one runtime
#[derive(Default)]
pub struct Callbacks {
    stream_error: RwLock<Option<Arc<StreamErrorCallback>>>,
    kernel_aborted: RwLock<Option<Arc<KernelAbortedCallback>>>,
}

impl Callbacks {
    /// Replace the stream-error callback; `None` disables delivery
    pub fn set_stream_error(&self, callback: Option<Arc<StreamErrorCallback>>) {
        *self.stream_error.write() = callback;
    }

    /// Replace the kernel-aborted callback; `None` disables delivery
    pub fn set_kernel_aborted(&self, callback: Option<Arc<KernelAbortedCallback>>) {
        *self.kernel_aborted.write() = callback;
    }

    pub fn clear(&self) {
        self.set_stream_error(None);
        self.set_kernel_aborted(None);
    }

    fn stream_error(&self) -> Option<Arc<StreamErrorCallback>> {
        self.stream_error.read().clone()
    }

    fn kernel_aborted(&self) -> Option<Arc<KernelAbortedCallback>> {
        self.kernel_aborted.read().clone()
    }
}

struct Dispatcher {
    layer: Arc<dyn DeviceLayer>,
    events: Arc<EventTable>,
    streams: Arc<StreamEngine>,
    callbacks: Arc<Callbacks>,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    fn run(self) {
        tracing::debug!("notification_thread_started");
        while !self.stop.load(Ordering::Acquire) {
            match self.layer.next_notification(POLL_INTERVAL) {
                Ok(Some(notification)) => self.dispatch(notification),
                Ok(None) => {}
                Err(DeviceLayerError::ShutDown) => break,
                Err(e) => {
                    tracing::error!(error = %e, "notification_source_failed");
                    break;
                }
            }
        }
        tracing::debug!("notification_thread_stopped");
    }

    fn dispatch(&self, notification: Notification) {
        let event = EventId::from_raw(notification.tag.0);
        let stream = StreamId::from_raw(notification.queue.0);
        let device = DeviceId::from(notification.device);

        let (result, diagnostics) = match notification.outcome {
            CommandOutcome::Completed => (PendingResult::Completed, None),
            CommandOutcome::Failed(fault) => {
                self.report(event, stream_error(&fault, device, stream));
                (PendingResult::Failed(fault.code), None)
            }
            CommandOutcome::KernelAborted { fault, diagnostics } => {
                self.report(event, stream_error(&fault, device, stream));
                (PendingResult::Failed(fault.code), Some(diagnostics))
            }
        };

        if let Some(diagnostics) = diagnostics {
            self.deliver_abort(event, diagnostics);
        }
        self.events.resolve(event, result);
    }

    fn report(&self, event: EventId, error: StreamError) {
        tracing::debug!(event = %event, error = %error, "device_fault");
        if let Some(stream) = error.stream {
            self.streams.push_error(stream, error.clone());
        }
        if let Some(callback) = self.callbacks.stream_error() {
            guarded("stream_error", || callback(event, &error));
        }
    }

    fn deliver_abort(&self, event: EventId, diagnostics: DiagnosticBuffer) {
        match self.callbacks.kernel_aborted() {
            Some(callback) => {
                let context = KernelAbortContext::new(event, diagnostics);
                guarded("kernel_aborted", || callback(event, context));
            }
            None => {
                tracing::debug!(event = %event, len = diagnostics.len(), "kernel_abort_diagnostics_released");
                diagnostics.release();
            }
        }
    }
}

fn stream_error(fault: &DeviceFault, device: DeviceId, stream: StreamId) -> StreamError {
    StreamError {
        error_code: fault.code,
        device,
        stream: Some(stream),
        cm_shire_mask: fault.shire_mask,
        error_context: fault.context,
    }
}

/// Run a user callback, containing panics to the callback
fn guarded(name: &'static str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(callback = name, "callback_panicked");
    }
}

/// Handle on the notification thread
pub struct ErrorReporter {
    callbacks: Arc<Callbacks>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ErrorReporter {
    /// Spawn the notification thread
    pub fn start(layer: Arc<dyn DeviceLayer>, events: Arc<EventTable>, streams: Arc<StreamEngine>) -> Result<Self> {
        let callbacks = Arc::new(Callbacks::default());
        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher {
            layer,
            events,
            streams,
            callbacks: Arc::clone(&callbacks),
            stop: Arc::clone(&stop),
        };
        let thread = thread::Builder::new()
            .name("etrt-notify".into())
            .spawn(move || dispatcher.run())
            .map_err(|e| Error::DeviceLayer(DeviceLayerError::Io(e)))?;

        Ok(Self {
            callbacks,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Stop and join the notification thread; idempotent
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("notification_thread_panicked");
            }
        }
        self.callbacks.clear();
    }
}

impl Drop for ErrorReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
