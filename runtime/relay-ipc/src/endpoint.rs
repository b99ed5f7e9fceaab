//! Per-task message queues
//!
//! Every task that sends or receives owns an [`Endpoint`]: a FIFO of messages
//! already committed to its pool, plus the condition variable its receive
//! blocks on.
//!
//! ## Design
//!
//! ```text
//! Endpoint (task 7, process 3)
//!   ├─ queue: [msg @+0x000] → [msg @+0x120] → [msg @+0x2c0]
//!   ├─ waiting: receiver blocked?
//!   ├─ killed / closed
//!   └─ outstanding request: timestamp of the call awaiting a reply
//! ```
//!
//! The empty-check before waiting and the push before notifying happen under
//! the same lock, so a wakeup cannot be lost.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use relay_platform::{ProcessId, TaskId};

use crate::address::PoolOffset;
use crate::error::{IpcError, Result};
use crate::message::MessageHeader;

/// A message committed to the receiver's pool, waiting in its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuedMessage {
    pub offset: PoolOffset,
    pub header: MessageHeader,
}

/// How a blocking wait ended
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    Message(QueuedMessage),
    TimedOut,
    Killed,
}

#[derive(Debug, Default)]
struct EndpointState {
    queue: VecDeque<QueuedMessage>,
    waiting: bool,
    killed: bool,
    closed: bool,
    outstanding_request: Option<u64>,
}

/// Receive queue of one task
#[derive(Debug)]
pub struct Endpoint {
    task: TaskId,
    process: ProcessId,
    state: Mutex<EndpointState>,
    arrived: Condvar,
}

impl Endpoint {
    pub fn new(task: TaskId, process: ProcessId) -> Self {
        Self {
            task,
            process,
            state: Mutex::new(EndpointState::default()),
            arrived: Condvar::new(),
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock()
    }

    /// Append a message and wake the receiver if it is blocked
    ///
    /// Returns whether a blocked receiver was woken.
    ///
    /// # Errors
    ///
    /// [`IpcError::TargetGone`] once the endpoint has been closed by task
    /// teardown; the caller still owns the message.
    pub(crate) fn enqueue(&self, message: QueuedMessage) -> Result<bool> {
        let mut state = self.lock();
        if state.closed {
            return Err(IpcError::TargetGone(self.task));
        }
        state.queue.push_back(message);
        let woke = state.waiting;
        if woke {
            self.arrived.notify_one();
        }
        Ok(woke)
    }

    /// Pop the oldest message, blocking until one arrives
    ///
    /// A kill is reported before any queued message is consumed. `deadline`
    /// of `None` waits forever.
    pub(crate) fn wait_next(&self, deadline: Option<Instant>) -> WaitOutcome {
        let mut state = self.lock();
        loop {
            if state.killed || state.closed {
                return WaitOutcome::Killed;
            }
            if let Some(message) = state.queue.pop_front() {
                return WaitOutcome::Message(message);
            }

            state.waiting = true;
            match deadline {
                None => self.arrived.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        state.waiting = false;
                        return WaitOutcome::TimedOut;
                    }
                    // Timing out is noticed on the next pass
                    let _ = self.arrived.wait_until(&mut state, deadline);
                }
            }
            state.waiting = false;
        }
    }

    /// Interrupt a blocked or future receive
    pub fn kill(&self) {
        let mut state = self.lock();
        state.killed = true;
        self.arrived.notify_all();
    }

    /// Refuse further messages and hand back everything queued
    pub(crate) fn close(&self) -> Vec<QueuedMessage> {
        let mut state = self.lock();
        state.closed = true;
        self.arrived.notify_all();
        state.queue.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Whether a receiver is currently blocked
    pub fn is_waiting(&self) -> bool {
        self.lock().waiting
    }

    pub(crate) fn set_outstanding_request(&self, timestamp: Option<u64>) {
        self.lock().outstanding_request = timestamp;
    }

    pub(crate) fn outstanding_request(&self) -> Option<u64> {
        self.lock().outstanding_request
    }
}

/// All endpoints, keyed by task
///
/// Closed endpoints stay in the table so a late sender finds them closed
/// instead of creating a fresh queue for a dead task.
#[derive(Debug, Default)]
pub(crate) struct EndpointTable {
    endpoints: RwLock<HashMap<TaskId, Arc<Endpoint>>>,
}

impl EndpointTable {
    pub fn get(&self, task: TaskId) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(&task).cloned()
    }

    pub fn get_or_create(&self, task: TaskId, process: ProcessId) -> Arc<Endpoint> {
        if let Some(endpoint) = self.get(task) {
            return endpoint;
        }
        self.endpoints
            .write()
            .entry(task)
            .or_insert_with(|| Arc::new(Endpoint::new(task, process)))
            .clone()
    }

    /// Close and forget the endpoints of a process' tasks
    ///
    /// Queued messages are dropped without rollback; they live in the
    /// process' own pool, which goes away with it.
    pub fn remove_process(&self, process: ProcessId) {
        self.endpoints.write().retain(|_, endpoint| {
            if endpoint.process() != process {
                return true;
            }
            endpoint.close();
            false
        });
    }
}
