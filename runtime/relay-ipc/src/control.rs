//! User-facing control surface
//!
//! The operations a process reaches through the IPC device:
//!
//! | Operation              | Who                   | Effect                                  |
//! |------------------------|-----------------------|-----------------------------------------|
//! | `open_process`         | any process           | create IPC state                        |
//! | `map_pool`             | any task              | map the process' pool                   |
//! | `establish_authority`  | one task, once        | become handle 0                         |
//! | `admin`                | authority process     | mint/remove handles, grant access       |
//! | `bind_endpoint`        | one task per process  | receive on behalf of the process        |
//! | `transact`             | any task              | release, send, then receive             |
//!
//! Everything except `open_process` and `map_pool` requires the caller's pool
//! to be mapped.

use std::sync::Arc;

use bitflags::bitflags;
use relay_platform::{ProcessId, TaskId};

use crate::address::UserAddr;
use crate::error::{IpcError, Result};
use crate::message::{MessageFlags, MessageHeader, MessageKind, OutboundMessage, MESSAGE_HEADER_SIZE};
use crate::pool::RegionRequest;
use crate::process::{PendingFree, ProcessIpc};
use crate::receiver::{take_releasable, Delivery, Expectation};
use crate::registry::Handle;
use crate::router::SendReceipt;
use crate::IpcSubsystem;

bitflags! {
    /// Phases of a transaction
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransactFlags: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        /// Release a delivered node or buffer before sending
        const BUFF_FREE = 1 << 2;
    }
}

/// Privileged operations of the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    /// Mint a handle served by `task`, or by the caller when `None`
    GenerateHandle { task: Option<TaskId> },
    RemoveHandle { handle: Handle },
    /// Let `task`'s process reach `handle`
    GrantAccess { task: TaskId, handle: Handle },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminReply {
    Handle(Handle),
    Done,
}

/// One release/send/receive round
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub flags: TransactFlags,
    pub outbound: Option<OutboundMessage>,
    pub release: Option<UserAddr>,
}

impl Transaction {
    /// Send without waiting
    pub fn send(message: OutboundMessage) -> Self {
        Self {
            flags: TransactFlags::SEND,
            outbound: Some(message),
            release: None,
        }
    }

    /// Send a request and wait for its reply
    pub fn call(message: OutboundMessage) -> Self {
        Self {
            flags: TransactFlags::SEND | TransactFlags::RECV,
            outbound: Some(message),
            release: None,
        }
    }

    /// Wait for the next request
    pub fn receive() -> Self {
        Self {
            flags: TransactFlags::RECV,
            ..Self::default()
        }
    }

    /// Answer the request delivered at `request`, releasing it
    pub fn reply(message: OutboundMessage, request: UserAddr) -> Self {
        Self::send(message).releasing(request)
    }

    /// Release a delivered node or buffer
    pub fn release(addr: UserAddr) -> Self {
        Self::default().releasing(addr)
    }

    /// Also release `addr` before sending
    pub fn releasing(mut self, addr: UserAddr) -> Self {
        self.flags |= TransactFlags::BUFF_FREE;
        self.release = Some(addr);
        self
    }
}

/// What a transaction did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactResult {
    pub sent: Option<SendReceipt>,
    pub received: Option<Delivery>,
}

impl IpcSubsystem {
    /// Create IPC state for `pid` (opening the IPC device)
    ///
    /// Opening twice returns the existing state.
    pub fn open_process(&self, pid: ProcessId) -> Arc<ProcessIpc> {
        log::debug!("control: {} opened the IPC device", pid);
        self.processes.insert(ProcessIpc::new(pid))
    }

    /// Drop `pid`'s IPC state, unmapping its pool
    pub fn close_process(&self, pid: ProcessId) {
        log::debug!("control: {} closed the IPC device", pid);
        self.teardown_process(pid);
    }

    /// Default pool placement for `pid`: the inherited base if any, else the
    /// configured one, sized `default_pool_pages`
    pub fn default_region(&self, pid: ProcessId) -> RegionRequest {
        let base = self
            .processes
            .get(pid)
            .and_then(|process| process.preferred_user_base())
            .unwrap_or(self.config.pool_user_base);
        RegionRequest::read_only(base, self.config.default_pool_size())
    }

    /// Map the caller's pool
    ///
    /// # Errors
    ///
    /// - [`IpcError::InvalidArgument`] if the process has not opened the
    ///   device or the request is malformed
    /// - [`IpcError::AlreadyBound`] if already mapped
    /// - [`IpcError::SizeExceeded`] above `max_pool_pages`
    pub fn map_pool(&self, task: TaskId, request: RegionRequest) -> Result<UserAddr> {
        let pid = self.process_of(task)?;
        let process = self.process_state(pid)?;
        process.pool().bind(
            pid,
            request,
            &*self.platform.pages,
            self.config.page_size,
            self.config.max_pool_size(),
        )?;
        Ok(UserAddr(request.user_base))
    }

    /// Make `task` the authority
    pub fn establish_authority(&self, task: TaskId, max_message: usize) -> Result<()> {
        self.caller(task)?;
        self.registry.register_authority(task, max_message)
    }

    /// Run a privileged command
    ///
    /// # Errors
    ///
    /// - [`IpcError::PermissionDenied`] unless the caller is in the
    ///   authority's process
    /// - [`IpcError::InvalidArgument`] if the task named is not alive
    /// - registry errors for the handle operations
    pub fn admin(&self, task: TaskId, command: AdminCommand) -> Result<AdminReply> {
        let (pid, _) = self.caller(task)?;
        let tasks = &*self.platform.tasks;
        if !self.registry.is_authority_process(pid, tasks) {
            log::error!("control: {} is not in the authority's process", task);
            return Err(IpcError::PermissionDenied);
        }

        match command {
            AdminCommand::GenerateHandle { task: owner } => {
                let owner = owner.unwrap_or(task);
                if !tasks.is_alive(owner) {
                    return Err(IpcError::InvalidArgument("handle owner is not alive"));
                }
                let handle = self.registry.acquire_handle(owner)?;
                self.registry.grant_access(pid, handle)?;
                Ok(AdminReply::Handle(handle))
            }
            AdminCommand::RemoveHandle { handle } => {
                self.registry.release_handle(handle)?;
                Ok(AdminReply::Done)
            }
            AdminCommand::GrantAccess { task: grantee, handle } => {
                if !tasks.is_alive(grantee) {
                    return Err(IpcError::InvalidArgument("grantee is not alive"));
                }
                let grantee_pid = self.process_of(grantee)?;
                self.registry.grant_access(grantee_pid, handle)?;
                log::debug!("control: {} may now reach {}", grantee_pid, handle);
                Ok(AdminReply::Done)
            }
        }
    }

    /// Make `task` its process' IPC task
    ///
    /// Returns the task id, which is also its handle under task-id handles.
    pub fn bind_endpoint(&self, task: TaskId) -> Result<TaskId> {
        let (_, process) = self.caller(task)?;
        if self.registry.authority().is_none() {
            return Err(IpcError::InvalidArgument("no authority registered"));
        }
        process.set_ipc_task(task)?;
        Ok(task)
    }

    /// Release, send, then receive, as selected by `transaction.flags`
    ///
    /// The release is validated before anything else and performed even if
    /// the send fails. A send with `RECV` is a call: it waits up to
    /// `call_timeout` for the reply. `RECV` alone waits forever for a request.
    ///
    /// # Errors
    ///
    /// - [`IpcError::PoolNotBound`] if the caller's pool is not mapped
    /// - [`IpcError::InvalidArgument`] without an authority, or when a flag's
    ///   operand is missing
    /// - [`IpcError::ProtocolError`] for a reply whose request is not
    ///   releasable
    /// - any error of [`IpcSubsystem::send`], [`IpcSubsystem::receive`] or
    ///   [`IpcSubsystem::release_buffer`]
    pub fn transact(&self, task: TaskId, transaction: Transaction) -> Result<TransactResult> {
        let (pid, process) = self.caller(task)?;
        if self.registry.authority().is_none() {
            return Err(IpcError::InvalidArgument("no authority registered"));
        }

        let flags = transaction.flags;
        let outbound = match (flags.contains(TransactFlags::SEND), &transaction.outbound) {
            (true, Some(message)) => Some(message),
            (true, None) => return Err(IpcError::InvalidArgument("SEND without a message")),
            (false, _) => None,
        };
        if outbound.is_some_and(|message| message.kind == MessageKind::DeathNotice) {
            return Err(IpcError::InvalidArgument("death notices are generated by the kernel"));
        }
        let replying = outbound.is_some_and(|message| message.kind.is_reply());

        let mut release = None;
        if flags.contains(TransactFlags::BUFF_FREE) {
            let addr = transaction
                .release
                .ok_or(IpcError::InvalidArgument("BUFF_FREE without an address"))?;
            // A reply may only release a delivered message
            let only = replying.then_some(PendingFree::Message);
            release = Some(match take_releasable(&process, addr, only) {
                Err(IpcError::NotFound) if replying => {
                    return Err(IpcError::ProtocolError("the request is not awaiting a reply"));
                }
                other => other?,
            });
        }

        let request = match release {
            Some((offset, _)) if replying => process
                .pool()
                .read(offset, MESSAGE_HEADER_SIZE)
                .and_then(|bytes| MessageHeader::decode(&bytes))
                .ok(),
            _ => None,
        };
        let sent = outbound.map(|message| self.write(task, pid, message, request.as_ref()));

        if let Some((offset, _)) = release {
            self.free_node(&process, offset);
        }
        let sent = sent.transpose()?;

        if let (Some(receipt), Some(message)) = (sent, outbound) {
            if flags.contains(TransactFlags::RECV)
                && message.kind == MessageKind::Request
                && !message.flags.contains(MessageFlags::ONE_WAY)
            {
                self.endpoints
                    .get_or_create(task, pid)
                    .set_outstanding_request(Some(receipt.timestamp));
            }
        }
        self.finish_transaction(task, flags, sent)
    }

    fn finish_transaction(
        &self,
        task: TaskId,
        flags: TransactFlags,
        sent: Option<SendReceipt>,
    ) -> Result<TransactResult> {
        let received = if flags.contains(TransactFlags::RECV) {
            let (expect, timeout) = if flags.contains(TransactFlags::SEND) {
                (Expectation::Reply, Some(self.config.call_timeout()))
            } else {
                (Expectation::Request, None)
            };
            Some(self.receive(task, expect, timeout)?)
        } else {
            None
        };
        Ok(TransactResult { sent, received })
    }

    /// Caller's process and state, requiring a mapped pool
    fn caller(&self, task: TaskId) -> Result<(ProcessId, Arc<ProcessIpc>)> {
        let pid = self.process_of(task)?;
        let process = self.process_state(pid)?;
        if !process.pool().is_mapped() {
            return Err(IpcError::PoolNotBound);
        }
        Ok((pid, process))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::{Payload, SpecialObject, Target, SPECIAL_OBJECT_SIZE};
    use crate::testing::Harness;
    use crate::IpcConfig;
    use relay_platform::Credentials;

    #[test]
    fn test_admin_requires_authority_process() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let outsider = h.spawn();

        assert_eq!(
            h.ipc.admin(outsider.task, AdminCommand::GenerateHandle { task: None }),
            Err(IpcError::PermissionDenied)
        );

        // Any task of the authority's process may administer
        let sibling = h.mock.tasks.spawn_task(authority.pid);
        let service = h.spawn();
        let reply = h
            .ipc
            .admin(sibling, AdminCommand::GenerateHandle { task: Some(service.task) })
            .unwrap();
        assert_eq!(reply, AdminReply::Handle(Handle(service.task.0)));
    }

    #[test]
    fn test_remove_handle() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (_, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.grant(&authority, &client, handle);

        let reply = h.ipc.admin(authority.task, AdminCommand::RemoveHandle { handle });
        assert_eq!(reply, Ok(AdminReply::Done));
        let msg = OutboundMessage::request(handle, 1, Payload::new());
        assert_eq!(h.ipc.send(client.task, &msg), Err(IpcError::PermissionDenied));
        assert_eq!(
            h.ipc.admin(authority.task, AdminCommand::RemoveHandle { handle: Handle::AUTHORITY }),
            Err(IpcError::InvalidArgument("the authority handle cannot be released"))
        );
    }

    #[test]
    fn test_grant_to_dead_task() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (_, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.mock.tasks.exit_task(client.task);

        assert!(matches!(
            h.ipc.admin(authority.task, AdminCommand::GrantAccess { task: client.task, handle }),
            Err(IpcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_single_authority() {
        let h = Harness::new();
        h.spawn_authority();
        let other = h.spawn();
        assert_eq!(
            h.ipc.establish_authority(other.task, 4096),
            Err(IpcError::AlreadyExists)
        );
    }

    #[test]
    fn test_bind_endpoint_once_per_process() {
        let h = Harness::new();
        h.spawn_authority();
        let service = h.spawn();
        let sibling = h.mock.tasks.spawn_task(service.pid);

        assert_eq!(h.ipc.bind_endpoint(service.task), Ok(service.task));
        assert_eq!(h.ipc.bind_endpoint(sibling), Err(IpcError::AlreadyBound));
    }

    #[test]
    fn test_bind_endpoint_needs_authority() {
        let h = Harness::new();
        let service = h.spawn();
        assert!(matches!(
            h.ipc.bind_endpoint(service.task),
            Err(IpcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_map_pool_rules() {
        let h = Harness::new();
        let pid = h.mock.tasks.spawn_process();
        let task = h.mock.tasks.spawn_task(pid);

        // Device not opened
        let request = h.ipc.default_region(pid);
        assert!(matches!(h.ipc.map_pool(task, request), Err(IpcError::InvalidArgument(_))));

        h.ipc.open_process(pid);
        let too_big = RegionRequest::read_only(request.user_base, h.ipc.config().max_pool_size() + 4096);
        assert!(matches!(
            h.ipc.map_pool(task, too_big),
            Err(IpcError::SizeExceeded { .. })
        ));

        assert_eq!(h.ipc.map_pool(task, request), Ok(UserAddr(request.user_base)));
        assert_eq!(h.ipc.map_pool(task, request), Err(IpcError::AlreadyBound));
        assert_eq!(
            h.mock.memory.mapped_pages(pid),
            h.ipc.config().default_pool_pages
        );
    }

    #[test]
    fn test_transact_needs_mapped_pool() {
        let h = Harness::new();
        h.spawn_authority();
        let pid = h.mock.tasks.spawn_process();
        let task = h.mock.tasks.spawn_task(pid);
        h.ipc.open_process(pid);

        assert_eq!(
            h.ipc.transact(task, Transaction::receive()),
            Err(IpcError::PoolNotBound)
        );
        assert_eq!(
            h.ipc.admin(task, AdminCommand::GenerateHandle { task: None }),
            Err(IpcError::PoolNotBound)
        );
    }

    #[test]
    fn test_send_flag_needs_message() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let transaction = Transaction {
            flags: TransactFlags::SEND,
            ..Transaction::default()
        };
        assert!(matches!(
            h.ipc.transact(authority.task, transaction),
            Err(IpcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_second_reply_rejected() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (service, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.grant(&authority, &client, handle);

        h.ipc
            .send(client.task, &OutboundMessage::request(handle, 1, Payload::new()))
            .unwrap();
        let request = h
            .ipc
            .transact(service.task, Transaction::receive())
            .unwrap()
            .received
            .unwrap();

        let reply = OutboundMessage::reply(&request.header, Payload::new());
        let first = h
            .ipc
            .transact(service.task, Transaction::reply(reply.clone(), request.message))
            .unwrap();
        assert_eq!(first.sent.map(|receipt| receipt.destination), Some(client.task));

        assert_eq!(
            h.ipc.transact(service.task, Transaction::reply(reply, request.message)),
            Err(IpcError::ProtocolError("the request is not awaiting a reply"))
        );
        assert_eq!(h.ipc.queue_len(client.task), 1);
    }

    #[test]
    fn test_reply_cannot_release_a_buffer_copy() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (service, handle) = h.spawn_service(&authority);
        let sender = h.spawn();
        let victim = h.spawn();
        h.grant(&authority, &sender, handle);
        h.ipc
            .endpoints
            .get_or_create(victim.task, victim.pid)
            .set_outstanding_request(Some(7));

        // Buffer whose bytes read as a request from the victim
        let forged = MessageHeader {
            kind: MessageKind::Request,
            flags: MessageFlags::empty(),
            target: Target { handle, token: 0 },
            code: 1,
            payload_size: 0,
            timestamp: 7,
            object_count: 0,
            sender_task: victim.task,
            sender_process: victim.pid,
            credentials: Credentials::default(),
            payload_addr: UserAddr::default(),
            offsets_addr: UserAddr::default(),
        };
        h.mock.user.map(sender.pid, 0x7000, forged.encode().to_vec());
        let object = SpecialObject::Buffer {
            addr: 0x7000,
            len: MESSAGE_HEADER_SIZE as u32,
        };
        h.ipc
            .send(sender.task, &OutboundMessage::one_way(handle, 1, Payload::new().object(object)))
            .unwrap();
        let delivery = h
            .ipc
            .transact(service.task, Transaction::receive())
            .unwrap()
            .received
            .unwrap();
        let bytes = h
            .ipc
            .read_user(service.pid, delivery.payload_addr(), SPECIAL_OBJECT_SIZE)
            .unwrap();
        let SpecialObject::Buffer { addr, .. } = SpecialObject::decode(&bytes).unwrap() else {
            panic!("expected a buffer object");
        };
        let copy = UserAddr(addr as usize);

        let reply = OutboundMessage::reply(&forged, Payload::new());
        assert_eq!(
            h.ipc.transact(service.task, Transaction::reply(reply, copy)),
            Err(IpcError::ProtocolError("the request is not awaiting a reply"))
        );
        assert_eq!(h.ipc.queue_len(victim.task), 0);

        // The copy and the message are still the service's to release
        h.ipc.release_buffer(service.pid, copy).unwrap();
        h.ipc
            .transact(service.task, Transaction::release(delivery.message))
            .unwrap();
        assert_eq!(h.ipc.pool_stats(service.pid).unwrap().outstanding, 0);
    }

    #[test]
    fn test_release_only() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (service, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.grant(&authority, &client, handle);

        h.ipc
            .send(client.task, &OutboundMessage::one_way(handle, 1, Payload::new()))
            .unwrap();
        let delivery = h
            .ipc
            .transact(service.task, Transaction::receive())
            .unwrap()
            .received
            .unwrap();

        let result = h.ipc.transact(service.task, Transaction::release(delivery.message)).unwrap();
        assert_eq!(result, TransactResult::default());
        assert_eq!(
            h.ipc.transact(service.task, Transaction::release(delivery.message)),
            Err(IpcError::NotFound)
        );
    }

    #[test]
    fn test_call_round_trip() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (service, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.grant(&authority, &client, handle);

        crossbeam::thread::scope(|scope| {
            let caller = scope.spawn(|_| {
                let call = OutboundMessage::request(handle, 4, Payload::from_bytes(&b"2+2"[..]));
                h.ipc.transact(client.task, Transaction::call(call))
            });

            let request = h
                .ipc
                .receive(service.task, Expectation::Request, Some(Duration::from_secs(5)))
                .unwrap();
            let answer = OutboundMessage::reply(&request.header, Payload::from_bytes(&b"4"[..]));
            h.ipc
                .transact(service.task, Transaction::reply(answer, request.message))
                .unwrap();

            let result = caller.join().unwrap().unwrap();
            let reply = result.received.unwrap();
            assert_eq!(reply.kind(), MessageKind::Reply);
            assert_eq!(reply.header.timestamp, result.sent.unwrap().timestamp);
            assert_eq!(h.ipc.read_user(client.pid, reply.payload_addr(), 1).unwrap(), b"4");
        })
        .unwrap();
    }

    #[test]
    fn test_call_timeout() {
        let h = Harness::with_config(IpcConfig {
            call_timeout_ms: 20,
            ..IpcConfig::default()
        });
        let authority = h.spawn_authority();
        let (service, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.grant(&authority, &client, handle);

        let call = OutboundMessage::request(handle, 1, Payload::new());
        assert_eq!(
            h.ipc.transact(client.task, Transaction::call(call)),
            Err(IpcError::TimedOut)
        );
        assert_eq!(h.ipc.queue_len(service.task), 1);
    }

    #[test]
    fn test_close_process() {
        let h = Harness::new();
        let process = h.spawn();
        h.ipc.close_process(process.pid);
        assert!(h.ipc.process(process.pid).is_none());
        assert_eq!(h.mock.memory.mapped_pages(process.pid), 0);
        assert_eq!(h.mock.memory.live_frames(), 0);
    }
}
