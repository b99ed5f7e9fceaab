//! Per-process IPC state
//!
//! A process gets a [`ProcessIpc`] when it opens the IPC device. It owns the
//! process' pool, the process' designated IPC task and the pending-free set:
//! pool allocations the user has been handed and is allowed to release.
//! Each entry remembers whether it is a delivered message or a buffer copy,
//! since only a message can be answered.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use relay_platform::{ProcessId, TaskId};
use spin::Mutex;

use crate::address::PoolOffset;
use crate::error::{IpcError, Result};
use crate::pool::Pool;

/// What a releasable allocation holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFree {
    /// A delivered message node
    Message,
    /// The copy of a buffer object
    Buffer,
}

pub struct ProcessIpc {
    pid: ProcessId,
    pool: Pool,
    ipc_task: Mutex<Option<TaskId>>,
    pending_free: Mutex<BTreeMap<PoolOffset, PendingFree>>,
    preferred_user_base: Option<usize>,
}

impl ProcessIpc {
    pub fn new(pid: ProcessId) -> Self {
        Self::with_preferred_base(pid, None)
    }

    /// State for a forked child, remembering where the parent's pool lived
    pub fn with_preferred_base(pid: ProcessId, preferred_user_base: Option<usize>) -> Self {
        Self {
            pid,
            pool: Pool::new(),
            ipc_task: Mutex::new(None),
            pending_free: Mutex::new(BTreeMap::new()),
            preferred_user_base,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn preferred_user_base(&self) -> Option<usize> {
        self.preferred_user_base
    }

    pub fn ipc_task(&self) -> Option<TaskId> {
        *self.ipc_task.lock()
    }

    /// Designate the task that receives on behalf of this process
    pub fn set_ipc_task(&self, task: TaskId) -> Result<()> {
        let mut slot = self.ipc_task.lock();
        if slot.is_some() {
            return Err(IpcError::AlreadyBound);
        }
        *slot = Some(task);
        Ok(())
    }

    /// Clear the designation if it names `task`
    pub fn clear_ipc_task_if(&self, task: TaskId) -> bool {
        let mut slot = self.ipc_task.lock();
        if *slot == Some(task) {
            *slot = None;
            return true;
        }
        false
    }

    pub(crate) fn mark_pending_free(&self, offset: PoolOffset, kind: PendingFree) {
        self.pending_free.lock().insert(offset, kind);
    }

    /// Remove `offset` from the pending-free set
    ///
    /// With `only` set, an entry of another kind is left in place and
    /// reported as absent.
    pub(crate) fn take_pending_free(
        &self,
        offset: PoolOffset,
        only: Option<PendingFree>,
    ) -> Option<PendingFree> {
        let mut pending = self.pending_free.lock();
        let kind = *pending.get(&offset)?;
        if only.is_some_and(|only| only != kind) {
            return None;
        }
        pending.remove(&offset)
    }

    pub fn pending_free(&self, offset: PoolOffset) -> Option<PendingFree> {
        self.pending_free.lock().get(&offset).copied()
    }

    pub fn pending_free_count(&self) -> usize {
        self.pending_free.lock().len()
    }

    pub(crate) fn clear_pending_free(&self) {
        self.pending_free.lock().clear();
    }
}

/// Open processes, keyed by pid
#[derive(Default)]
pub(crate) struct ProcessTable {
    processes: RwLock<HashMap<ProcessId, Arc<ProcessIpc>>>,
}

impl ProcessTable {
    pub fn get(&self, pid: ProcessId) -> Option<Arc<ProcessIpc>> {
        self.processes.read().get(&pid).cloned()
    }

    /// Insert unless present; returns the state now registered for `pid`
    pub fn insert(&self, state: ProcessIpc) -> Arc<ProcessIpc> {
        self.processes
            .write()
            .entry(state.pid())
            .or_insert_with(|| Arc::new(state))
            .clone()
    }

    pub fn remove(&self, pid: ProcessId) -> Option<Arc<ProcessIpc>> {
        self.processes.write().remove(&pid)
    }

    /// The designated IPC task of `pid`, if the process is open and has one
    pub fn ipc_task_of(&self, pid: ProcessId) -> Option<TaskId> {
        self.get(pid).and_then(|process| process.ipc_task())
    }
}
