//! Event table
//!
//! Maps event ids to their completion state. Ids are allocated
//! monotonically from 1 and never reused; resolved events keep their result
//! for the lifetime of the runtime so late waits and polls stay answerable.

use crate::error::{Error, Result};
use crate::ids::{DeviceId, EventId, StreamId};
use crate::types::PendingResult;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct EventRecord {
    stream: StreamId,
    device: DeviceId,
    state: PendingResult,
}

#[derive(Debug, Default)]
struct TableState {
    next_id: u64,
    events: HashMap<EventId, EventRecord>,
    /// Unresolved events per stream
    pending: HashMap<StreamId, Vec<EventId>>,
}

/// Process-wide completion table of one runtime
///
/// Records are never pruned: memory grows by one small entry per command
/// submitted over the life of the runtime. Kernel records behave the same
/// way in [`KernelManager`](crate::kernel::KernelManager).
#[derive(Debug, Default)]
pub struct EventTable {
    state: Mutex<TableState>,
    resolved: Condvar,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending event for `stream`
    pub fn allocate(&self, stream: StreamId, device: DeviceId) -> EventId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = EventId::from_raw(state.next_id);
        state.events.insert(
            id,
            EventRecord {
                stream,
                device,
                state: PendingResult::Pending,
            },
        );
        state.pending.entry(stream).or_default().push(id);
        id
    }

    /// Forget an event whose command never reached the device
    pub fn discard(&self, id: EventId) {
        let mut state = self.state.lock();
        if let Some(record) = state.events.remove(&id) {
            remove_pending(&mut state, record.stream, id);
        }
    }

    /// Record the outcome of an event
    ///
    /// Returns false, leaving the first result in place, when the event is
    /// unknown or already resolved.
    pub fn resolve(&self, id: EventId, result: PendingResult) -> bool {
        debug_assert!(result.is_resolved());
        let mut state = self.state.lock();
        let Some(record) = state.events.get_mut(&id) else {
            tracing::warn!(event = %id, "resolution_for_unknown_event");
            return false;
        };
        if record.state.is_resolved() {
            tracing::warn!(event = %id, previous = ?record.state, "duplicate_resolution_ignored");
            return false;
        }
        record.state = result;
        let stream = record.stream;
        remove_pending(&mut state, stream, id);
        drop(state);

        self.resolved.notify_all();
        tracing::debug!(event = %id, stream = %stream, result = ?result, "event_resolved");
        true
    }

    pub fn poll(&self, id: EventId) -> Result<PendingResult> {
        self.state
            .lock()
            .events
            .get(&id)
            .map(|r| r.state)
            .ok_or(Error::UnknownEvent(id))
    }

    /// Block until `id` resolves or `timeout` elapses
    ///
    /// Returns false on timeout; the operation itself is unaffected.
    pub fn wait(&self, id: EventId, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            match state.events.get(&id) {
                None => return Err(Error::UnknownEvent(id)),
                Some(record) if record.state.is_resolved() => return Ok(true),
                Some(_) => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.resolved.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.events.get(&id).map_or(false, |r| r.state.is_resolved()));
                    }
                }
                None => self.resolved.wait(&mut state),
            }
        }
    }

    /// Block until every event submitted on `stream` so far has resolved
    pub fn wait_stream(&self, stream: StreamId, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if state.pending.get(&stream).map_or(true, Vec::is_empty) {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.resolved.wait_until(&mut state, deadline).timed_out() {
                        return state.pending.get(&stream).map_or(true, Vec::is_empty);
                    }
                }
                None => self.resolved.wait(&mut state),
            }
        }
    }

    /// Unresolved events of `stream` in submission order
    pub fn pending_on(&self, stream: StreamId) -> Vec<EventId> {
        self.state.lock().pending.get(&stream).cloned().unwrap_or_default()
    }

    pub fn stream_of(&self, id: EventId) -> Result<StreamId> {
        self.record(id).map(|r| r.stream)
    }

    pub fn device_of(&self, id: EventId) -> Result<DeviceId> {
        self.record(id).map(|r| r.device)
    }

    /// Total unresolved events
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.values().map(Vec::len).sum()
    }

    fn record(&self, id: EventId) -> Result<EventRecord> {
        self.state.lock().events.get(&id).copied().ok_or(Error::UnknownEvent(id))
    }
}

fn remove_pending(state: &mut TableState, stream: StreamId, id: EventId) {
    if let Some(list) = state.pending.get_mut(&stream) {
        list.retain(|&e| e != id);
        if list.is_empty() {
            state.pending.remove(&stream);
        }
    }
}
