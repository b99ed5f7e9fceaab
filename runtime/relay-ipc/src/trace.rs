//! Trace hooks
//!
//! The router and receiver report what happens to each message as a
//! [`TraceEvent`]. Where events go is up to the installed [`TraceSink`]:
//! [`LogSink`] forwards them to `log::trace!`, [`RingSink`] keeps the most
//! recent ones in memory.

use std::collections::VecDeque;

use relay_platform::{ProcessId, TaskId};
use spin::Mutex;

use crate::message::MessageKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// Message committed and queued
    Write {
        kind: MessageKind,
        dst: TaskId,
        dst_process: ProcessId,
        woke: bool,
    },
    /// Send rejected after the destination was known
    WriteDrop {
        kind: MessageKind,
        dst: TaskId,
        reason: &'static str,
    },
    /// Receive started
    TryRead { task: TaskId, want_reply: bool },
    /// Message delivered
    Read { task: TaskId, kind: MessageKind },
    /// Message discarded by the receiver
    ReadDrop {
        task: TaskId,
        kind: MessageKind,
        reason: &'static str,
    },
    ReadTimeout { task: TaskId, want_reply: bool },
    /// Receive interrupted by a kill
    Kill { task: TaskId, want_reply: bool },
}

/// Destination of trace events
pub trait TraceSink: Send + Sync {
    fn record(&self, event: &TraceEvent);
}

/// Forward events to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn record(&self, event: &TraceEvent) {
        log::trace!("ipc: {:?}", event);
    }
}

/// Bounded in-memory history of events
#[derive(Debug)]
pub struct RingSink {
    capacity: usize,
    events: Mutex<VecDeque<TraceEvent>>,
}

impl RingSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Events recorded so far, oldest first
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TraceSink for RingSink {
    fn record(&self, event: &TraceEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_latest() {
        let ring = RingSink::new(2);
        for task in 1..=3 {
            ring.record(&TraceEvent::TryRead {
                task: TaskId(task),
                want_reply: false,
            });
        }
        assert_eq!(
            ring.snapshot(),
            vec![
                TraceEvent::TryRead { task: TaskId(2), want_reply: false },
                TraceEvent::TryRead { task: TaskId(3), want_reply: false },
            ]
        );
        ring.clear();
        assert!(ring.snapshot().is_empty());
    }
}
