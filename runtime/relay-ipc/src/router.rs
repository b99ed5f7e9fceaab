//! Message routing
//!
//! Validates an outbound message, finds its destination, places it in the
//! destination's pool, marshals its special objects and queues it.
//!
//! ## Checks, in order
//!
//! 1. Shape: payload and object count within limits, payload large enough
//!    for its objects
//! 2. Kind:
//!    - request: sender may reach the handle, handle resolves
//!    - reply: matches the request being released in the same transaction
//!      and is within the reply window
//!    - death notice: kernel only
//! 3. Requests to the authority fit its message size limit
//! 4. Destination task alive
//!
//! Nothing is allocated until every check passed; after allocation every
//! failure frees what was taken.

use relay_platform::{ProcessId, TaskId};

use crate::address::{PoolOffset, UserAddr};
use crate::endpoint::QueuedMessage;
use crate::error::{IpcError, Result};
use crate::marshal::{self, MarshalContext};
use crate::message::{
    check_object_offset, encode_offsets, MessageFlags, MessageHeader, MessageKind, NodeLayout,
    OutboundMessage, Payload, SpecialObject, Target, MESSAGE_HEADER_SIZE, OFFSET_ENTRY_SIZE,
    SPECIAL_OBJECT_SIZE,
};
use crate::process::ProcessIpc;
use crate::registry::Handle;
use crate::trace::TraceEvent;
use crate::IpcSubsystem;

/// Outcome of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub destination: TaskId,
    /// Correlation id carried by the message
    pub timestamp: u64,
    /// Whether a blocked receiver was woken
    pub woke_receiver: bool,
}

impl IpcSubsystem {
    /// Send a request or one-way message from `sender`
    ///
    /// Replies are sent with [`IpcSubsystem::transact`], which releases the
    /// request they answer.
    ///
    /// # Errors
    ///
    /// - [`IpcError::InvalidArgument`] for a malformed message or a death notice
    /// - [`IpcError::PermissionDenied`] without access to the target handle
    /// - [`IpcError::InvalidHandle`] / [`IpcError::NotFound`] for a bad handle
    /// - [`IpcError::TargetGone`] if the service task exited
    /// - [`IpcError::SizeExceeded`] above the authority's message limit
    /// - [`IpcError::OutOfMemory`] if the destination pool is full
    pub fn send(&self, sender: TaskId, message: &OutboundMessage) -> Result<SendReceipt> {
        if message.kind == MessageKind::DeathNotice {
            return Err(IpcError::InvalidArgument("death notices are generated by the kernel"));
        }
        let sender_process = self.process_of(sender)?;
        self.write(sender, sender_process, message, None)
    }

    /// Route one message
    ///
    /// `releasing` is the header of the request the caller is releasing in
    /// the same transaction; replies are only accepted against it.
    pub(crate) fn write(
        &self,
        sender: TaskId,
        sender_process: ProcessId,
        message: &OutboundMessage,
        releasing: Option<&MessageHeader>,
    ) -> Result<SendReceipt> {
        self.check_shape(&message.payload)?;

        let tasks = &*self.platform.tasks;
        let now = self.platform.clock.now_nanos();
        let (destination, timestamp) = match message.kind {
            MessageKind::Request => {
                let handle = message.target.handle;
                if !self.registry.has_access(sender_process, handle, tasks) {
                    log::error!("router: {} has no access to {}", sender, handle);
                    return Err(IpcError::PermissionDenied);
                }
                (self.registry.resolve(handle)?, self.next_timestamp())
            }
            MessageKind::Reply | MessageKind::FailedReply => {
                let request = releasing
                    .ok_or(IpcError::ProtocolError("reply must release the request it answers"))?;
                self.check_reply(sender_process, message, request)?;
                let destination = TaskId(message.target.handle.0);
                let window = u64::try_from(self.config.reply_window().as_nanos()).unwrap_or(u64::MAX);
                if now > message.timestamp.saturating_add(window) {
                    log::error!("router: stale reply from {} to {}", sender, destination);
                    self.record(TraceEvent::WriteDrop {
                        kind: message.kind,
                        dst: destination,
                        reason: "stale reply",
                    });
                    return Err(IpcError::TimedOut);
                }
                (destination, message.timestamp)
            }
            MessageKind::DeathNotice => (TaskId(message.target.handle.0), self.next_timestamp()),
        };

        if message.kind == MessageKind::Request && message.target.handle.is_authority() {
            self.check_authority_size(&message.payload)?;
        }

        if !tasks.is_alive(destination) {
            self.record(TraceEvent::WriteDrop {
                kind: message.kind,
                dst: destination,
                reason: "destination not alive",
            });
            return Err(IpcError::TargetGone(destination));
        }
        let dest_process = tasks
            .process_of(destination)
            .ok_or(IpcError::TargetGone(destination))?;
        let dest = self
            .processes
            .get(dest_process)
            .ok_or(IpcError::InvalidArgument("destination process has not opened the IPC device"))?;

        let payload = &message.payload;
        let size = NodeLayout::total_size(payload.len(), payload.offsets().len());
        let base = dest.pool().allocate(size).inspect_err(|_| {
            self.record(TraceEvent::WriteDrop {
                kind: message.kind,
                dst: destination,
                reason: "destination pool exhausted",
            });
        })?;
        let layout = NodeLayout::new(base, payload.len(), payload.offsets().len());

        let header = MessageHeader {
            kind: message.kind,
            flags: message.flags,
            target: message.target,
            code: message.code,
            payload_size: payload.len() as u32,
            timestamp,
            object_count: payload.offsets().len() as u32,
            sender_task: sender,
            sender_process,
            credentials: tasks.credentials(sender_process).unwrap_or_default(),
            payload_addr: UserAddr::default(),
            offsets_addr: UserAddr::default(),
        };

        let ctx = MarshalContext {
            sender_task: sender,
            sender_process,
            dest: &dest,
            registry: &self.registry,
            processes: &self.processes,
            platform: &self.platform,
        };
        let committed = fill_node(&dest, &layout, &header, payload)
            .and_then(|()| marshal::commit(&ctx, &layout));
        if let Err(err) = committed {
            self.free_node(&dest, base);
            self.record(TraceEvent::WriteDrop {
                kind: message.kind,
                dst: destination,
                reason: "marshalling failed",
            });
            return Err(err);
        }

        let endpoint = self.endpoints.get_or_create(destination, dest_process);
        let woke = match endpoint.enqueue(QueuedMessage { offset: base, header }) {
            Ok(woke) => woke,
            Err(err) => {
                marshal::rollback(&dest, &self.platform, &layout);
                self.free_node(&dest, base);
                return Err(err);
            }
        };

        log::trace!(
            "router: {:?} {} -> {} ({} bytes, {} objects)",
            message.kind,
            sender,
            destination,
            payload.len(),
            payload.offsets().len()
        );
        self.record(TraceEvent::Write {
            kind: message.kind,
            dst: destination,
            dst_process: dest_process,
            woke,
        });
        Ok(SendReceipt {
            destination,
            timestamp,
            woke_receiver: woke,
        })
    }

    /// Tell `to` that the service `dead` (reached through `token`) exited
    pub(crate) fn send_death_notice(
        &self,
        dead: TaskId,
        dead_process: ProcessId,
        to: TaskId,
        token: u32,
    ) -> Result<SendReceipt> {
        let notice = OutboundMessage {
            kind: MessageKind::DeathNotice,
            flags: MessageFlags::ONE_WAY,
            target: Target {
                handle: Handle(to.0),
                token,
            },
            code: 0,
            timestamp: 0,
            payload: Payload::new(),
        };
        self.write(dead, dead_process, &notice, None)
    }

    fn check_shape(&self, payload: &Payload) -> Result<()> {
        let objects = payload.offsets().len();
        if payload.len() > self.limits.max_payload {
            return Err(IpcError::InvalidArgument("payload too large"));
        }
        if objects > self.limits.max_objects {
            return Err(IpcError::InvalidArgument("too many special objects"));
        }
        if payload.len() < objects * SPECIAL_OBJECT_SIZE {
            return Err(IpcError::InvalidArgument("payload too small for its special objects"));
        }
        Ok(())
    }

    fn check_reply(
        &self,
        replier_process: ProcessId,
        reply: &OutboundMessage,
        request: &MessageHeader,
    ) -> Result<()> {
        let answers = request.kind == MessageKind::Request
            && !request.is_one_way()
            && request.timestamp == reply.timestamp
            && request.sender_task.0 == reply.target.handle.0;
        if !answers {
            log::error!("router: reply does not answer the released request");
            return Err(IpcError::ProtocolError("reply does not match the released request"));
        }

        let served = self
            .registry
            .resolve(request.target.handle)
            .map_err(|_| IpcError::ProtocolError("the request's service is gone"))?;
        if self.platform.tasks.process_of(served) != Some(replier_process) {
            log::error!("router: reply from a process that did not serve the request");
            return Err(IpcError::ProtocolError("reply must come from the serving process"));
        }
        Ok(())
    }

    /// Everything a message to the authority will occupy, buffers included
    fn check_authority_size(&self, payload: &Payload) -> Result<()> {
        let Some(limit) = self.registry.authority_max_message() else {
            return Ok(());
        };
        let bytes = payload.as_bytes();
        let mut total =
            MESSAGE_HEADER_SIZE + bytes.len() + payload.offsets().len() * OFFSET_ENTRY_SIZE;

        let mut previous = None;
        for &offset in payload.offsets() {
            let at = check_object_offset(offset, previous, bytes.len())?;
            previous = Some(offset);
            if let SpecialObject::Buffer { len, .. } =
                SpecialObject::decode(&bytes[at..at + SPECIAL_OBJECT_SIZE])?
            {
                total += len as usize;
            }
        }

        if total > limit {
            log::error!("router: {} byte message exceeds the authority limit {}", total, limit);
            return Err(IpcError::SizeExceeded {
                requested: total,
                limit,
            });
        }
        Ok(())
    }

    pub(crate) fn free_node(&self, process: &ProcessIpc, node: PoolOffset) {
        if let Err(err) = process.pool().free(node) {
            log::error!("router: cannot free message node +{:#x}: {}", node.0, err);
        }
    }
}

fn fill_node(
    dest: &ProcessIpc,
    layout: &NodeLayout,
    header: &MessageHeader,
    payload: &Payload,
) -> Result<()> {
    let pool = dest.pool();
    pool.write(layout.base, &header.encode())?;
    pool.write(layout.payload(), payload.as_bytes())?;
    pool.write(layout.offsets(), &encode_offsets(payload.offsets()))
}
