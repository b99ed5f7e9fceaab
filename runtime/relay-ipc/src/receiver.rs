//! Message delivery
//!
//! A receive takes the oldest message from the caller's endpoint, screens it
//! against what the caller is waiting for, and delivers it by rewriting the
//! header with user addresses and handing the node to the user.
//!
//! ```text
//! Idle ──> Blocked ──> Delivered
//!             ├──────> TimedOut
//!             └──────> Killed
//! ```
//!
//! Screening:
//!
//! | Queued         | Waiting for a request | Waiting for a reply                  |
//! |----------------|-----------------------|--------------------------------------|
//! | request        | deliver               | drop, keep waiting                   |
//! | reply          | drop, keep waiting    | deliver if it answers our request    |
//! | failed reply   | drop, keep waiting    | `PeerRejected` if it answers us      |
//! | death notice   | deliver               | deliver                              |
//!
//! Dropped messages are rolled back and freed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_platform::{ProcessId, TaskId};

use crate::address::{PoolOffset, UserAddr};
use crate::endpoint::{Endpoint, QueuedMessage, WaitOutcome};
use crate::error::{IpcError, Result};
use crate::marshal;
use crate::message::{MessageHeader, MessageKind, NodeLayout, MESSAGE_HEADER_SIZE};
use crate::process::{PendingFree, ProcessIpc};
use crate::trace::TraceEvent;
use crate::IpcSubsystem;

/// What a receive is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Serve: accept requests and death notices
    Request,
    /// Call: accept the reply to our outstanding request, and death notices
    Reply,
}

/// A message handed to its receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// User address of the message node; release it when done
    pub message: UserAddr,
    /// Header as written at `message`
    pub header: MessageHeader,
}

impl Delivery {
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn payload_addr(&self) -> UserAddr {
        self.header.payload_addr
    }

    pub fn payload_len(&self) -> usize {
        self.header.payload_size as usize
    }
}

enum Screen {
    Accept,
    Drop(&'static str),
    Rejected,
}

impl IpcSubsystem {
    /// Wait for the next acceptable message for `task`
    ///
    /// # Arguments
    ///
    /// * `task` - Receiving task
    /// * `expect` - Whether a request or the reply to an outstanding call is
    ///   wanted
    /// * `timeout` - Upper bound on the wait, `None` to wait forever
    ///
    /// # Errors
    ///
    /// - [`IpcError::PoolNotBound`] if the caller's pool is not mapped
    /// - [`IpcError::TimedOut`] when the timeout passes
    /// - [`IpcError::Cancelled`] if the task is killed; no message is consumed
    /// - [`IpcError::PeerRejected`] when the awaited reply is a failed reply
    pub fn receive(
        &self,
        task: TaskId,
        expect: Expectation,
        timeout: Option<Duration>,
    ) -> Result<Delivery> {
        let pid = self.process_of(task)?;
        let process = self.process_state(pid)?;
        if !process.pool().is_mapped() {
            return Err(IpcError::PoolNotBound);
        }
        let endpoint = self.endpoints.get_or_create(task, pid);
        let want_reply = expect == Expectation::Reply;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        self.record(TraceEvent::TryRead { task, want_reply });
        loop {
            let queued = match endpoint.wait_next(deadline) {
                WaitOutcome::Message(queued) => queued,
                WaitOutcome::TimedOut => {
                    self.record(TraceEvent::ReadTimeout { task, want_reply });
                    if want_reply {
                        endpoint.set_outstanding_request(None);
                    }
                    return Err(IpcError::TimedOut);
                }
                WaitOutcome::Killed => {
                    self.record(TraceEvent::Kill { task, want_reply });
                    return Err(IpcError::Cancelled);
                }
            };

            match screen(&endpoint, &queued.header, expect) {
                Screen::Accept => return self.deliver(task, &process, &endpoint, queued),
                Screen::Drop(reason) => {
                    log::warn!(
                        "receiver: {} dropped {:?} from {}: {}",
                        task,
                        queued.header.kind,
                        queued.header.sender_task,
                        reason
                    );
                    self.record(TraceEvent::ReadDrop {
                        task,
                        kind: queued.header.kind,
                        reason,
                    });
                    self.discard(&process, &queued);
                }
                Screen::Rejected => {
                    self.record(TraceEvent::ReadDrop {
                        task,
                        kind: queued.header.kind,
                        reason: "failed reply",
                    });
                    self.discard(&process, &queued);
                    endpoint.set_outstanding_request(None);
                    return Err(IpcError::PeerRejected);
                }
            }
        }
    }

    /// Hand a delivered node or buffer copy back to the pool
    ///
    /// # Errors
    ///
    /// - [`IpcError::OutOfRange`] if `addr` is outside the pool
    /// - [`IpcError::NotFound`] unless `addr` is currently releasable
    pub fn release_buffer(&self, pid: ProcessId, addr: UserAddr) -> Result<()> {
        let process = self.process_state(pid)?;
        let (offset, _) = take_releasable(&process, addr, None)?;
        process.pool().free(offset)
    }

    fn deliver(
        &self,
        task: TaskId,
        process: &Arc<ProcessIpc>,
        endpoint: &Endpoint,
        queued: QueuedMessage,
    ) -> Result<Delivery> {
        let pool = process.pool();
        let message = match pool.user_address_of(queued.offset) {
            Ok(message) => message,
            Err(err) => {
                self.discard(process, &queued);
                return Err(err);
            }
        };

        let mut header = queued.header;
        header.payload_addr = message.add(MESSAGE_HEADER_SIZE);
        header.offsets_addr = header.payload_addr.add(header.payload_size as usize);
        if let Err(err) = pool.write(queued.offset, &header.encode()) {
            self.discard(process, &queued);
            return Err(err);
        }

        process.mark_pending_free(queued.offset, PendingFree::Message);
        if header.kind.is_reply() {
            endpoint.set_outstanding_request(None);
        }
        self.record(TraceEvent::Read {
            task,
            kind: header.kind,
        });
        Ok(Delivery { message, header })
    }

    /// Roll back and free a queued message that will never be delivered
    pub(crate) fn discard(&self, process: &ProcessIpc, queued: &QueuedMessage) {
        let layout = NodeLayout::for_header(queued.offset, &queued.header);
        marshal::rollback(process, &self.platform, &layout);
        self.free_node(process, queued.offset);
    }
}

fn screen(endpoint: &Endpoint, header: &MessageHeader, expect: Expectation) -> Screen {
    match (header.kind, expect) {
        (MessageKind::DeathNotice, _) => Screen::Accept,
        (MessageKind::Request, Expectation::Request) => Screen::Accept,
        (MessageKind::Request, Expectation::Reply) => Screen::Drop("request while awaiting a reply"),
        (MessageKind::Reply | MessageKind::FailedReply, Expectation::Request) => {
            Screen::Drop("reply without an outstanding request")
        }
        (kind, Expectation::Reply) => {
            if endpoint.outstanding_request() != Some(header.timestamp) {
                Screen::Drop("reply to a different request")
            } else if kind == MessageKind::FailedReply {
                Screen::Rejected
            } else {
                Screen::Accept
            }
        }
    }
}

/// Take `addr` out of the pending-free set, translating it to its offset
///
/// `only` restricts the release to one kind of allocation; anything else is
/// left releasable and reported as [`IpcError::NotFound`].
pub(crate) fn take_releasable(
    process: &ProcessIpc,
    addr: UserAddr,
    only: Option<PendingFree>,
) -> Result<(PoolOffset, PendingFree)> {
    let offset = process.pool().kernel_address_of(addr)?;
    let Some(kind) = process.take_pending_free(offset, only) else {
        log::error!("receiver: {} is not releasable in {}", addr, process.pid());
        return Err(IpcError::NotFound);
    };
    Ok((offset, kind))
}
