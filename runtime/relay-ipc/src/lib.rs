//! # Relay IPC
//!
//! Kernel-resident, shared-pool IPC between user tasks.
//!
//! ## Overview
//!
//! Every participating process maps a *pool*: kernel memory that is also
//! visible read-only in the process. A sender's message is written once, by
//! the kernel, straight into the receiver's pool; the receiver reads it in
//! place and hands the memory back when done.
//!
//! One privileged task is the *authority*. It is always reachable through
//! handle 0, mints handles for services and decides which processes may reach
//! which service. Access also travels with messages: passing a handle object
//! to another process grants that process access.
//!
//! ## Components
//!
//! ```text
//!  sender ──> Router ──> Registry (resolve, access)
//!               │
//!               ├──> destination Pool (allocate, copy)
//!               ├──> Marshaller (buffers, descriptors, handles)
//!               └──> destination Endpoint (enqueue, wake)
//!                                   │
//!  receiver <── Receiver <──────────┘
//! ```
//!
//! - [`pool`]: per-process shared region and its allocator
//! - [`registry`]: handles, authority, access grants
//! - [`marshal`]: special-object commit and rollback
//! - [`router`]: validating and enqueueing messages
//! - [`receiver`] and [`lifecycle`]: delivery, release, teardown
//! - [`control`]: the user-facing operations
//!
//! ## Usage
//!
//! ```rust,ignore
//! let ipc = IpcSubsystem::new(IpcConfig::default(), platform)?;
//! ipc.open_process(pid);
//! ipc.map_pool(task, ipc.default_region(pid))?;
//! let reply = ipc.transact(task, Transaction::call(OutboundMessage::request(handle, 1, payload)))?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_platform::{Platform, PlatformError, ProcessId, TaskId};

pub mod address;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod marshal;
pub mod message;
pub mod pool;
pub mod process;
pub mod receiver;
pub mod registry;
pub mod router;
pub mod trace;

#[cfg(test)]
mod testing;

pub use address::{PoolOffset, UserAddr};
pub use config::{ConfigError, HandleMode, IpcConfig};
pub use control::{AdminCommand, AdminReply, Transaction, TransactFlags, TransactResult};
pub use error::{ErrorClass, IpcError, Result};
pub use message::{
    MessageFlags, MessageHeader, MessageKind, MessageLimits, OutboundMessage, Payload,
    SpecialObject, Target, MESSAGE_HEADER_SIZE, SPECIAL_OBJECT_SIZE,
};
pub use pool::{PoolStats, Protection, RegionRequest};
pub use process::{PendingFree, ProcessIpc};
pub use receiver::{Delivery, Expectation};
pub use registry::{DenseHandles, Handle, HandlePolicy, Registry, TaskIdHandles};
pub use router::SendReceipt;
pub use trace::{LogSink, RingSink, TraceEvent, TraceSink};

use endpoint::EndpointTable;
use process::ProcessTable;

/// The IPC subsystem: one instance per kernel
pub struct IpcSubsystem {
    config: IpcConfig,
    limits: MessageLimits,
    platform: Platform,
    registry: Registry,
    processes: ProcessTable,
    endpoints: EndpointTable,
    trace: Arc<dyn TraceSink>,
    last_timestamp: AtomicU64,
}

impl IpcSubsystem {
    /// Create the subsystem
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `config` does not validate.
    pub fn new(config: IpcConfig, platform: Platform) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        log::debug!(
            "ipc: {:?} handles, pools up to {} pages, reply window {} ms",
            config.handle_mode,
            config.max_pool_pages,
            config.reply_window_ms
        );
        Ok(Self {
            limits: config.limits(),
            registry: Registry::from_config(&config),
            config,
            platform,
            processes: ProcessTable::default(),
            endpoints: EndpointTable::default(),
            trace: Arc::new(LogSink),
            last_timestamp: AtomicU64::new(0),
        })
    }

    /// Replace the trace sink
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn limits(&self) -> MessageLimits {
        self.limits
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// IPC state of an open process
    pub fn process(&self, pid: ProcessId) -> Option<Arc<ProcessIpc>> {
        self.processes.get(pid)
    }

    /// Bytes of `pid`'s pool as its user mapping shows them
    pub fn read_user(&self, pid: ProcessId, addr: UserAddr, len: usize) -> Result<Vec<u8>> {
        self.process_state(pid)?.pool().read_user(addr, len)
    }

    pub fn pool_stats(&self, pid: ProcessId) -> Option<PoolStats> {
        self.processes.get(pid).map(|process| process.pool().stats())
    }

    /// Messages waiting for `task`
    pub fn queue_len(&self, task: TaskId) -> usize {
        self.endpoints.get(task).map_or(0, |endpoint| endpoint.len())
    }

    pub fn has_access(&self, pid: ProcessId, handle: Handle) -> bool {
        self.registry.has_access(pid, handle, &*self.platform.tasks)
    }

    pub(crate) fn process_of(&self, task: TaskId) -> Result<ProcessId> {
        self.platform
            .tasks
            .process_of(task)
            .ok_or(IpcError::Platform(PlatformError::NoSuchTask(task.0)))
    }

    pub(crate) fn process_state(&self, pid: ProcessId) -> Result<Arc<ProcessIpc>> {
        self.processes
            .get(pid)
            .ok_or(IpcError::InvalidArgument("process has not opened the IPC device"))
    }

    /// Clock reading for a new message, strictly greater than any issued
    /// before so requests stay distinguishable under a coarse clock
    pub(crate) fn next_timestamp(&self) -> u64 {
        let now = self.platform.clock.now_nanos();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }

    pub(crate) fn record(&self, event: TraceEvent) {
        self.trace.record(&event);
    }
}
