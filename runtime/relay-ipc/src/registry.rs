//! Service Registry
//!
//! Maps service handles to the tasks that serve them and records which
//! processes may reach which service.
//!
//! # Design
//!
//! - Handle 0 always names the authority; at most one authority exists
//! - How other handles are minted is a [`HandlePolicy`] chosen at
//!   construction: [`TaskIdHandles`] (handle == task id) or [`DenseHandles`]
//!   (slot table)
//! - Access grants are a sparse relation kept in both directions so either
//!   side can be torn down without scanning
//! - One spin lock guards everything; nothing blocks while it is held

use core::fmt;
use std::collections::{BTreeSet, HashMap};

use relay_platform::{ProcessId, TaskDirectory, TaskId};
use spin::Mutex;

use crate::config::{HandleMode, IpcConfig};
use crate::error::{IpcError, Result};
use crate::message::MESSAGE_HEADER_SIZE;

/// Name of a service endpoint as seen by user space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Handle(pub u32);

impl Handle {
    /// The authority's well-known handle
    pub const AUTHORITY: Handle = Handle(0);

    pub fn is_authority(self) -> bool {
        self == Handle::AUTHORITY
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle {}", self.0)
    }
}

/// Strategy for minting and resolving non-authority handles
pub trait HandlePolicy: Send {
    /// Mint a handle served by `owner`
    fn generate(&mut self, owner: TaskId, authority: Option<TaskId>) -> Result<Handle>;

    /// Retire a handle; later resolution fails with [`IpcError::NotFound`]
    fn release(&mut self, handle: Handle) -> Result<()>;

    /// Task serving a non-zero handle
    fn resolve(&self, handle: Handle) -> Result<TaskId>;

    /// Retire every handle served by an exiting task
    fn release_task(&mut self, task: TaskId) -> Vec<Handle>;
}

/// The handle is the serving task's id
///
/// Any task id below the capacity resolves, even one never registered, and
/// liveness is checked by the caller. Releasing a handle marks it so that
/// resolution reports [`IpcError::NotFound`] until it is generated again.
#[derive(Debug)]
pub struct TaskIdHandles {
    capacity: usize,
    released: BTreeSet<u32>,
}

impl TaskIdHandles {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            released: BTreeSet::new(),
        }
    }

    fn in_range(&self, handle: Handle) -> bool {
        (handle.0 as usize) < self.capacity
    }
}

impl HandlePolicy for TaskIdHandles {
    fn generate(&mut self, owner: TaskId, authority: Option<TaskId>) -> Result<Handle> {
        if Some(owner) == authority {
            return Err(IpcError::InvalidArgument("the authority is reached through handle 0"));
        }
        let handle = Handle(owner.0);
        if handle.is_authority() || !self.in_range(handle) {
            return Err(IpcError::OutOfHandles);
        }
        self.released.remove(&handle.0);
        Ok(handle)
    }

    fn release(&mut self, handle: Handle) -> Result<()> {
        if !self.in_range(handle) {
            return Err(IpcError::InvalidHandle(handle.0));
        }
        self.released.insert(handle.0);
        Ok(())
    }

    fn resolve(&self, handle: Handle) -> Result<TaskId> {
        if !self.in_range(handle) {
            return Err(IpcError::InvalidHandle(handle.0));
        }
        if self.released.contains(&handle.0) {
            return Err(IpcError::NotFound);
        }
        Ok(TaskId(handle.0))
    }

    fn release_task(&mut self, _task: TaskId) -> Vec<Handle> {
        // The handle is the task id itself; resolution of a dead task is
        // caught by the liveness check.
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Registered(TaskId),
    Released,
}

/// Handles index a fixed slot table
///
/// Slot 0 is the authority and never handed out. A task may serve several
/// handles.
#[derive(Debug)]
pub struct DenseHandles {
    slots: Vec<Slot>,
}

impl DenseHandles {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::Free; capacity],
        }
    }

    fn slot(&self, handle: Handle) -> Result<Slot> {
        self.slots
            .get(handle.0 as usize)
            .copied()
            .ok_or(IpcError::InvalidHandle(handle.0))
    }
}

impl HandlePolicy for DenseHandles {
    fn generate(&mut self, owner: TaskId, _authority: Option<TaskId>) -> Result<Handle> {
        let index = self
            .slots
            .iter()
            .skip(1)
            .position(|slot| !matches!(slot, Slot::Registered(_)))
            .map(|position| position + 1)
            .ok_or(IpcError::OutOfHandles)?;
        self.slots[index] = Slot::Registered(owner);
        Ok(Handle(index as u32))
    }

    fn release(&mut self, handle: Handle) -> Result<()> {
        match self.slot(handle)? {
            Slot::Free => Err(IpcError::InvalidHandle(handle.0)),
            Slot::Released => Ok(()),
            Slot::Registered(_) => {
                self.slots[handle.0 as usize] = Slot::Released;
                Ok(())
            }
        }
    }

    fn resolve(&self, handle: Handle) -> Result<TaskId> {
        match self.slot(handle)? {
            Slot::Registered(task) => Ok(task),
            Slot::Released => Err(IpcError::NotFound),
            Slot::Free => Err(IpcError::InvalidHandle(handle.0)),
        }
    }

    fn release_task(&mut self, task: TaskId) -> Vec<Handle> {
        let mut released = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate().skip(1) {
            if *slot == Slot::Registered(task) {
                *slot = Slot::Released;
                released.push(Handle(index as u32));
            }
        }
        released
    }
}

#[derive(Debug, Clone, Copy)]
struct Authority {
    task: TaskId,
    max_message: usize,
}

struct RegistryState {
    authority: Option<Authority>,
    policy: Box<dyn HandlePolicy>,
    /// Service task -> processes that may reach it
    reachable_by: HashMap<TaskId, BTreeSet<ProcessId>>,
    /// Process -> service tasks it may reach
    held_by: HashMap<ProcessId, BTreeSet<TaskId>>,
}

impl RegistryState {
    fn resolve(&self, handle: Handle) -> Result<TaskId> {
        if handle.is_authority() {
            return self
                .authority
                .map(|authority| authority.task)
                .ok_or(IpcError::InvalidHandle(handle.0));
        }
        self.policy.resolve(handle)
    }
}

/// Handle table, authority and access relation
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new(policy: Box<dyn HandlePolicy>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                authority: None,
                policy,
                reachable_by: HashMap::new(),
                held_by: HashMap::new(),
            }),
        }
    }

    /// Registry with the policy named by `config.handle_mode`
    pub fn from_config(config: &IpcConfig) -> Self {
        let policy: Box<dyn HandlePolicy> = match config.handle_mode {
            HandleMode::TaskId => Box::new(TaskIdHandles::new(config.max_services)),
            HandleMode::Dense => Box::new(DenseHandles::new(config.max_services)),
        };
        Self::new(policy)
    }

    /// Install `task` as the authority
    ///
    /// # Arguments
    ///
    /// * `task` - Task that will serve handle 0
    /// * `max_message` - Largest message, all parts included, the authority
    ///   accepts
    ///
    /// # Errors
    ///
    /// - [`IpcError::InvalidArgument`] if `max_message` cannot hold a header
    /// - [`IpcError::AlreadyExists`] if an authority is registered
    pub fn register_authority(&self, task: TaskId, max_message: usize) -> Result<()> {
        if max_message < MESSAGE_HEADER_SIZE {
            return Err(IpcError::InvalidArgument("authority message limit below header size"));
        }
        let mut state = self.state.lock();
        if state.authority.is_some() {
            return Err(IpcError::AlreadyExists);
        }
        state.authority = Some(Authority { task, max_message });
        log::debug!("registry: {} is the authority (max message {} bytes)", task, max_message);
        Ok(())
    }

    pub fn authority(&self) -> Option<TaskId> {
        self.state.lock().authority.map(|authority| authority.task)
    }

    pub fn authority_max_message(&self) -> Option<usize> {
        self.state.lock().authority.map(|authority| authority.max_message)
    }

    /// Whether `pid` is the process the authority task runs in
    pub fn is_authority_process(&self, pid: ProcessId, tasks: &dyn TaskDirectory) -> bool {
        self.authority()
            .and_then(|task| tasks.process_of(task))
            .is_some_and(|owner| owner == pid)
    }

    /// Mint a handle served by `owner`
    pub fn acquire_handle(&self, owner: TaskId) -> Result<Handle> {
        let mut state = self.state.lock();
        let authority = state.authority.map(|authority| authority.task);
        let handle = state.policy.generate(owner, authority)?;
        log::debug!("registry: {} now served by {}", handle, owner);
        Ok(handle)
    }

    pub fn release_handle(&self, handle: Handle) -> Result<()> {
        if handle.is_authority() {
            return Err(IpcError::InvalidArgument("the authority handle cannot be released"));
        }
        self.state.lock().policy.release(handle)
    }

    /// Task currently serving `handle`
    ///
    /// # Errors
    ///
    /// - [`IpcError::InvalidHandle`] if out of range or never registered
    /// - [`IpcError::NotFound`] if released
    pub fn resolve(&self, handle: Handle) -> Result<TaskId> {
        self.state.lock().resolve(handle)
    }

    /// Let `grantee` reach the service behind `handle`
    ///
    /// Returns the serving task.
    pub fn grant_access(&self, grantee: ProcessId, handle: Handle) -> Result<TaskId> {
        let mut state = self.state.lock();
        let owner = state.resolve(handle)?;
        state.reachable_by.entry(owner).or_default().insert(grantee);
        state.held_by.entry(grantee).or_default().insert(owner);
        Ok(owner)
    }

    /// Whether `pid` may send requests to `handle`
    ///
    /// The authority is reachable by everyone, and a service is always
    /// reachable from its own process.
    pub fn has_access(&self, pid: ProcessId, handle: Handle, tasks: &dyn TaskDirectory) -> bool {
        if handle.is_authority() {
            return true;
        }
        let state = self.state.lock();
        let Ok(owner) = state.resolve(handle) else {
            return false;
        };
        if tasks.process_of(owner) == Some(pid) {
            return true;
        }
        state
            .reachable_by
            .get(&owner)
            .is_some_and(|grantees| grantees.contains(&pid))
    }

    /// Drop every grant pointing at `task`, returning the former grantees
    pub fn revoke_owner(&self, task: TaskId) -> Vec<ProcessId> {
        let mut state = self.state.lock();
        let grantees = state.reachable_by.remove(&task).unwrap_or_default();
        for pid in &grantees {
            if let Some(held) = state.held_by.get_mut(pid) {
                held.remove(&task);
                if held.is_empty() {
                    state.held_by.remove(pid);
                }
            }
        }
        grantees.into_iter().collect()
    }

    /// Drop every grant held by `pid`
    pub fn revoke_grantee(&self, pid: ProcessId) {
        let mut state = self.state.lock();
        let owners = state.held_by.remove(&pid).unwrap_or_default();
        for task in owners {
            if let Some(grantees) = state.reachable_by.get_mut(&task) {
                grantees.remove(&pid);
                if grantees.is_empty() {
                    state.reachable_by.remove(&task);
                }
            }
        }
    }

    /// Retire the handles of an exiting task
    ///
    /// An exiting authority is cleared so a restarted one can register.
    pub fn release_task(&self, task: TaskId) -> Vec<Handle> {
        let mut state = self.state.lock();
        if state.authority.is_some_and(|authority| authority.task == task) {
            log::debug!("registry: authority {} exited", task);
            state.authority = None;
        }
        state.policy.release_task(task)
    }

    /// Processes holding a grant for `task`
    pub fn grantees_of(&self, task: TaskId) -> Vec<ProcessId> {
        self.state
            .lock()
            .reachable_by
            .get(&task)
            .map(|grantees| grantees.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of grants held by `pid`
    pub fn grants_held_by(&self, pid: ProcessId) -> usize {
        self.state.lock().held_by.get(&pid).map_or(0, BTreeSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_platform::mock::MockTasks;

    fn task_id_registry() -> Registry {
        Registry::new(Box::new(TaskIdHandles::new(128)))
    }

    #[test]
    fn test_authority_registration() {
        let registry = task_id_registry();
        assert!(matches!(
            registry.register_authority(TaskId(1), 16),
            Err(IpcError::InvalidArgument(_))
        ));
        registry.register_authority(TaskId(1), 4096).unwrap();
        assert_eq!(registry.register_authority(TaskId(2), 4096), Err(IpcError::AlreadyExists));
        assert_eq!(registry.resolve(Handle::AUTHORITY), Ok(TaskId(1)));
        assert_eq!(registry.authority_max_message(), Some(4096));
    }

    #[test]
    fn test_handle_zero_without_authority() {
        let registry = task_id_registry();
        assert_eq!(registry.resolve(Handle(0)), Err(IpcError::InvalidHandle(0)));
    }

    #[test]
    fn test_task_id_handles() {
        let registry = task_id_registry();
        registry.register_authority(TaskId(1), 4096).unwrap();

        assert!(matches!(
            registry.acquire_handle(TaskId(1)),
            Err(IpcError::InvalidArgument(_))
        ));
        assert_eq!(registry.acquire_handle(TaskId(5)), Ok(Handle(5)));
        assert_eq!(registry.acquire_handle(TaskId(200)), Err(IpcError::OutOfHandles));
        assert_eq!(registry.resolve(Handle(5)), Ok(TaskId(5)));
        assert_eq!(registry.resolve(Handle(300)), Err(IpcError::InvalidHandle(300)));

        registry.release_handle(Handle(5)).unwrap();
        assert_eq!(registry.resolve(Handle(5)), Err(IpcError::NotFound));
        assert_eq!(registry.acquire_handle(TaskId(5)), Ok(Handle(5)));
        assert_eq!(registry.resolve(Handle(5)), Ok(TaskId(5)));
    }

    #[test]
    fn test_dense_handles() {
        let registry = Registry::new(Box::new(DenseHandles::new(3)));
        assert_eq!(registry.acquire_handle(TaskId(10)), Ok(Handle(1)));
        assert_eq!(registry.acquire_handle(TaskId(11)), Ok(Handle(2)));
        assert_eq!(registry.acquire_handle(TaskId(12)), Err(IpcError::OutOfHandles));

        assert_eq!(registry.resolve(Handle(2)), Ok(TaskId(11)));
        registry.release_handle(Handle(2)).unwrap();
        assert_eq!(registry.resolve(Handle(2)), Err(IpcError::NotFound));

        // Released slots are reused.
        assert_eq!(registry.acquire_handle(TaskId(12)), Ok(Handle(2)));
        assert_eq!(registry.resolve(Handle(3)), Err(IpcError::InvalidHandle(3)));
    }

    #[test]
    fn test_dense_never_registered_slot() {
        let registry = Registry::new(Box::new(DenseHandles::new(8)));
        assert_eq!(registry.resolve(Handle(4)), Err(IpcError::InvalidHandle(4)));
        assert_eq!(registry.release_handle(Handle(4)), Err(IpcError::InvalidHandle(4)));
    }

    #[test]
    fn test_dense_release_task() {
        let registry = Registry::new(Box::new(DenseHandles::new(8)));
        let a = registry.acquire_handle(TaskId(10)).unwrap();
        let b = registry.acquire_handle(TaskId(10)).unwrap();
        let c = registry.acquire_handle(TaskId(11)).unwrap();

        assert_eq!(registry.release_task(TaskId(10)), vec![a, b]);
        assert_eq!(registry.resolve(a), Err(IpcError::NotFound));
        assert_eq!(registry.resolve(c), Ok(TaskId(11)));
    }

    #[test]
    fn test_access_relation() {
        let tasks = MockTasks::default();
        let authority_pid = tasks.spawn_process();
        let service_pid = tasks.spawn_process();
        let client_pid = tasks.spawn_process();
        let authority = tasks.spawn_task(authority_pid);
        let service = tasks.spawn_task(service_pid);

        let registry = task_id_registry();
        registry.register_authority(authority, 4096).unwrap();
        let handle = registry.acquire_handle(service).unwrap();

        assert!(registry.has_access(client_pid, Handle::AUTHORITY, &tasks));
        assert!(registry.has_access(service_pid, handle, &tasks));
        assert!(!registry.has_access(client_pid, handle, &tasks));

        assert_eq!(registry.grant_access(client_pid, handle), Ok(service));
        assert!(registry.has_access(client_pid, handle, &tasks));
        assert_eq!(registry.grantees_of(service), vec![client_pid]);
        assert_eq!(registry.grants_held_by(client_pid), 1);

        assert_eq!(registry.revoke_owner(service), vec![client_pid]);
        assert!(!registry.has_access(client_pid, handle, &tasks));
        assert_eq!(registry.grants_held_by(client_pid), 0);
    }

    #[test]
    fn test_revoke_grantee() {
        let tasks = MockTasks::default();
        let pid = tasks.spawn_process();
        let client = tasks.spawn_process();
        let s1 = tasks.spawn_task(pid);
        let s2 = tasks.spawn_task(pid);

        let registry = task_id_registry();
        let h1 = registry.acquire_handle(s1).unwrap();
        let h2 = registry.acquire_handle(s2).unwrap();
        registry.grant_access(client, h1).unwrap();
        registry.grant_access(client, h2).unwrap();

        registry.revoke_grantee(client);
        assert!(registry.grantees_of(s1).is_empty());
        assert!(registry.grantees_of(s2).is_empty());
        assert!(!registry.has_access(client, h1, &tasks));
    }

    #[test]
    fn test_authority_cleared_on_exit() {
        let registry = task_id_registry();
        registry.register_authority(TaskId(1), 4096).unwrap();
        registry.release_task(TaskId(1));
        assert_eq!(registry.authority(), None);
        registry.register_authority(TaskId(2), 4096).unwrap();
    }
}
