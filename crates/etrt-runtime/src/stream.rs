//! Stream engine
//!
//! A stream is an ordered command queue bound to one device. Submission is
//! non-blocking: the engine registers an event, hands the command to the
//! device layer tagged with that event, and returns.
//!
//! # Ordering
//!
//! Commands of one stream reach the device in submission order on a single
//! device queue. The `barrier` flag is forwarded to the device, which holds
//! the command until every earlier command of the queue has completed.
//!
//! On a layer that supports concurrent DMA an unfenced command may overlap
//! earlier ones; data hazards between such commands are the caller's to
//! avoid. On any other layer every command is submitted with `barrier` set,
//! so the stream executes strictly first in, first out.

use crate::error::{Error, Result};
use crate::event::EventTable;
use crate::ids::{DeviceId, EventId, StreamId};
use crate::types::StreamError;
use etrt_device::{CommandHeader, CommandTag, DeviceCommand, DeviceLayer, QueueId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct StreamState {
    device: DeviceId,
    /// Commands submitted so far
    sequence: u64,
    errors: Vec<StreamError>,
}

/// Owner of every stream of a runtime
pub struct StreamEngine {
    layer: Arc<dyn DeviceLayer>,
    events: Arc<EventTable>,
    streams: Mutex<HashMap<StreamId, StreamState>>,
    next_id: AtomicU32,
}

impl StreamEngine {
    pub fn new(layer: Arc<dyn DeviceLayer>, events: Arc<EventTable>) -> Self {
        Self {
            layer,
            events,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn create(&self, device: DeviceId) -> StreamId {
        let id = StreamId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.streams.lock().insert(
            id,
            StreamState {
                device,
                sequence: 0,
                errors: Vec::new(),
            },
        );
        tracing::debug!(stream = %id, device = %device, "stream_created");
        id
    }

    /// Device a stream is bound to
    pub fn device_of(&self, stream: StreamId) -> Result<DeviceId> {
        self.streams
            .lock()
            .get(&stream)
            .map(|s| s.device)
            .ok_or(Error::UnknownStream(stream))
    }

    /// Submit one command built around a fresh event's header
    pub fn submit(
        &self,
        stream: StreamId,
        barrier: bool,
        build: impl FnOnce(CommandHeader) -> DeviceCommand,
    ) -> Result<EventId> {
        let device = self.device_of(stream)?;
        let barrier = barrier || !self.layer.supports_concurrent_dma();
        let event = self.events.allocate(stream, device);
        let command = build(CommandHeader {
            tag: CommandTag(event.as_raw()),
            queue: QueueId(stream.as_raw()),
            barrier,
        });
        let kind = command.kind();
        let bytes = command.transfer_len();

        if let Err(e) = self.layer.submit(device.into(), command) {
            self.events.discard(event);
            tracing::warn!(stream = %stream, error = %e, "submit_rejected");
            return Err(e.into());
        }

        let sequence = {
            let mut streams = self.streams.lock();
            match streams.get_mut(&stream) {
                Some(state) => {
                    state.sequence += 1;
                    state.sequence
                }
                None => 0,
            }
        };
        tracing::debug!(
            stream = %stream,
            event = %event,
            kind = ?kind,
            bytes,
            barrier,
            sequence,
            "command_submitted"
        );
        Ok(event)
    }

    /// Queue a fault for later retrieval; faults of destroyed streams are dropped
    pub fn push_error(&self, stream: StreamId, error: StreamError) {
        match self.streams.lock().get_mut(&stream) {
            Some(state) => state.errors.push(error),
            None => tracing::debug!(stream = %stream, error = %error, "error_for_destroyed_stream"),
        }
    }

    /// Take every queued fault of a stream
    pub fn drain_errors(&self, stream: StreamId) -> Result<Vec<StreamError>> {
        self.streams
            .lock()
            .get_mut(&stream)
            .map(|s| std::mem::take(&mut s.errors))
            .ok_or(Error::UnknownStream(stream))
    }

    /// Destroy a stream with no unresolved events
    pub fn destroy(&self, stream: StreamId) -> Result<()> {
        let mut streams = self.streams.lock();
        if !streams.contains_key(&stream) {
            return Err(Error::UnknownStream(stream));
        }
        let pending = self.events.pending_on(stream).len();
        if pending > 0 {
            return Err(Error::StreamBusy { stream, pending });
        }
        if let Some(state) = streams.remove(&stream) {
            if !state.errors.is_empty() {
                tracing::warn!(stream = %stream, dropped = state.errors.len(), "unretrieved_stream_errors");
            }
        }
        tracing::debug!(stream = %stream, "stream_destroyed");
        Ok(())
    }

    /// Ask the device to abort every unresolved command of a stream
    ///
    /// Returns how many commands were still pending on the device.
    pub fn abort_pending(&self, stream: StreamId) -> Result<usize> {
        let device = self.device_of(stream)?;
        let mut aborted = 0;
        for event in self.events.pending_on(stream) {
            if self.layer.abort(device.into(), CommandTag(event.as_raw()))? {
                aborted += 1;
            }
        }
        tracing::debug!(stream = %stream, aborted, "stream_abort_requested");
        Ok(aborted)
    }

    /// Drain for up to `timeout`, abort what remains, then destroy
    pub fn destroy_forced(&self, stream: StreamId, timeout: Duration) -> Result<()> {
        self.device_of(stream)?;
        let started = Instant::now();
        if !self.events.wait_stream(stream, timeout) {
            let aborted = self.abort_pending(stream)?;
            tracing::warn!(stream = %stream, aborted, "forcing_stream_drain");
            let remaining = timeout.saturating_sub(started.elapsed()).max(ABORT_GRACE);
            if !self.events.wait_stream(stream, remaining) {
                let pending = self.events.pending_on(stream).len();
                return Err(Error::StreamBusy { stream, pending });
            }
        }
        self.destroy(stream)
    }

    pub fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn wait(&self, stream: StreamId, timeout: Duration) -> Result<bool> {
        self.device_of(stream)?;
        Ok(self.events.wait_stream(stream, timeout))
    }
}

/// Time granted to aborted commands to report back
pub const ABORT_GRACE: Duration = Duration::from_secs(1);
