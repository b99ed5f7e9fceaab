//! Mock platform for hosted testing
//!
//! In-memory stand-ins for every collaborator, with counters and failure
//! injection so tests can observe frames, mappings and descriptors directly.
//!
//! ## Usage
//!
//! ```rust
//! use relay_platform::mock::MockPlatform;
//!
//! let mock = MockPlatform::new();
//! let pid = mock.tasks.spawn_process();
//! let task = mock.tasks.spawn_task(pid);
//! let platform = mock.platform();
//! assert_eq!(platform.tasks.process_of(task), Some(pid));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spin::Mutex;

use crate::{
    Clock, Credentials, DescriptorTable, KernelRegion, PageMapper, PhysFrame, Platform,
    PlatformError, ProcessId, Result, TaskDirectory, TaskId, UserMemory,
};

/// Highest descriptor number a mock process may hold
pub const MOCK_MAX_DESCRIPTORS: i32 = 256;

/// Every mock collaborator, shared with the [`Platform`] it produces
#[derive(Clone, Default)]
pub struct MockPlatform {
    pub memory: Arc<MockMemory>,
    pub descriptors: Arc<MockDescriptors>,
    pub tasks: Arc<MockTasks>,
    pub user: Arc<MockUserMemory>,
    pub clock: Arc<MockClock>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle the mocks as trait objects
    pub fn platform(&self) -> Platform {
        Platform {
            pages: self.memory.clone(),
            descriptors: self.descriptors.clone(),
            tasks: self.tasks.clone(),
            user: self.user.clone(),
            clock: self.clock.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    next_frame: u64,
    live_frames: usize,
    frame_limit: Option<usize>,
    mappings: HashMap<(ProcessId, usize), PhysFrame>,
    /// Successful user mappings left before the next one fails
    fail_map_after: Option<usize>,
}

/// Frame allocator and user page tables
#[derive(Default)]
pub struct MockMemory {
    state: Mutex<MemoryState>,
}

impl MockMemory {
    /// Frames currently handed out
    pub fn live_frames(&self) -> usize {
        self.state.lock().live_frames
    }

    /// User pages currently mapped in `pid`
    pub fn mapped_pages(&self, pid: ProcessId) -> usize {
        self.state
            .lock()
            .mappings
            .keys()
            .filter(|(owner, _)| *owner == pid)
            .count()
    }

    /// Frame mapped at `uva` in `pid`
    pub fn mapping(&self, pid: ProcessId, uva: usize) -> Option<PhysFrame> {
        self.state.lock().mappings.get(&(pid, uva)).copied()
    }

    /// Let `successes` more user mappings succeed, then fail one
    pub fn fail_map_after(&self, successes: usize) {
        self.state.lock().fail_map_after = Some(successes);
    }

    /// Cap the number of live frames
    pub fn set_frame_limit(&self, limit: Option<usize>) {
        self.state.lock().frame_limit = limit;
    }
}

impl PageMapper for MockMemory {
    fn alloc_region(&self, pages: usize, page_size: usize) -> Result<KernelRegion> {
        let frames = {
            let mut state = self.state.lock();
            if let Some(limit) = state.frame_limit {
                if state.live_frames + pages > limit {
                    return Err(PlatformError::OutOfFrames { requested: pages });
                }
            }
            let first = state.next_frame;
            state.next_frame += pages as u64;
            state.live_frames += pages;
            (first..first + pages as u64).map(PhysFrame).collect::<Vec<_>>()
        };

        KernelRegion::new(page_size, frames).inspect_err(|_| {
            self.state.lock().live_frames -= pages;
        })
    }

    fn map_user_page(&self, pid: ProcessId, uva: usize, frame: PhysFrame) -> Result<()> {
        let mut state = self.state.lock();
        match state.fail_map_after {
            Some(0) => {
                state.fail_map_after = None;
                log::debug!("mock: injected map failure at {:#x} in {}", uva, pid);
                return Err(PlatformError::MapFailed { addr: uva });
            }
            Some(n) => state.fail_map_after = Some(n - 1),
            None => {}
        }
        if state.mappings.contains_key(&(pid, uva)) {
            return Err(PlatformError::MapFailed { addr: uva });
        }
        state.mappings.insert((pid, uva), frame);
        Ok(())
    }

    fn unmap_user_page(&self, pid: ProcessId, uva: usize) {
        self.state.lock().mappings.remove(&(pid, uva));
    }

    fn free_region(&self, region: KernelRegion) {
        let frames = region.into_frames();
        self.state.lock().live_frames -= frames.len();
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Per-process descriptor tables pointing at shared open files
#[derive(Default)]
pub struct MockDescriptors {
    state: Mutex<DescriptorState>,
}

#[derive(Default)]
struct DescriptorState {
    next_file: u64,
    tables: HashMap<ProcessId, BTreeMap<i32, u64>>,
}

impl DescriptorState {
    fn install(&mut self, pid: ProcessId, file: u64) -> Result<i32> {
        let table = self.tables.entry(pid).or_default();
        let fd = (0..MOCK_MAX_DESCRIPTORS)
            .find(|fd| !table.contains_key(fd))
            .ok_or(PlatformError::DescriptorTableFull)?;
        table.insert(fd, file);
        Ok(fd)
    }
}

impl MockDescriptors {
    /// Open a fresh file in `pid`
    pub fn open(&self, pid: ProcessId) -> Result<i32> {
        let mut state = self.state.lock();
        let file = state.next_file;
        state.next_file += 1;
        state.install(pid, file)
    }

    /// Open file behind `fd`, if any
    pub fn file_of(&self, pid: ProcessId, fd: i32) -> Option<u64> {
        self.state.lock().tables.get(&pid)?.get(&fd).copied()
    }

    pub fn is_open(&self, pid: ProcessId, fd: i32) -> bool {
        self.file_of(pid, fd).is_some()
    }

    /// Number of open descriptors in `pid`
    pub fn open_count(&self, pid: ProcessId) -> usize {
        self.state.lock().tables.get(&pid).map_or(0, BTreeMap::len)
    }
}

impl DescriptorTable for MockDescriptors {
    fn dup_into(&self, from: ProcessId, fd: i32, to: ProcessId) -> Result<i32> {
        let mut state = self.state.lock();
        let file = state
            .tables
            .get(&from)
            .and_then(|table| table.get(&fd))
            .copied()
            .ok_or(PlatformError::BadDescriptor(fd))?;
        state.install(to, file)
    }

    fn close(&self, pid: ProcessId, fd: i32) -> Result<()> {
        self.state
            .lock()
            .tables
            .get_mut(&pid)
            .and_then(|table| table.remove(&fd))
            .map(|_| ())
            .ok_or(PlatformError::BadDescriptor(fd))
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

struct TaskEntry {
    pid: ProcessId,
    alive: bool,
}

struct ProcessEntry {
    user_mode: bool,
    credentials: Credentials,
}

struct TaskState {
    next_pid: u32,
    next_tid: u32,
    tasks: HashMap<TaskId, TaskEntry>,
    processes: HashMap<ProcessId, ProcessEntry>,
}

impl Default for TaskState {
    fn default() -> Self {
        // Ids start at 1; task id 0 would collide with the authority handle.
        Self {
            next_pid: 1,
            next_tid: 1,
            tasks: HashMap::new(),
            processes: HashMap::new(),
        }
    }
}

/// Task and process bookkeeping
#[derive(Default)]
pub struct MockTasks {
    state: Mutex<TaskState>,
}

impl MockTasks {
    fn spawn(&self, user_mode: bool) -> ProcessId {
        let mut state = self.state.lock();
        let pid = ProcessId(state.next_pid);
        state.next_pid += 1;
        state.processes.insert(
            pid,
            ProcessEntry {
                user_mode,
                credentials: Credentials::default(),
            },
        );
        pid
    }

    /// Create a user-mode process
    pub fn spawn_process(&self) -> ProcessId {
        self.spawn(true)
    }

    /// Create a kernel-mode process; its tasks never count as alive targets
    pub fn spawn_kernel_process(&self) -> ProcessId {
        self.spawn(false)
    }

    /// Create a running task in `pid`
    pub fn spawn_task(&self, pid: ProcessId) -> TaskId {
        let mut state = self.state.lock();
        let task = TaskId(state.next_tid);
        state.next_tid += 1;
        state.tasks.insert(task, TaskEntry { pid, alive: true });
        task
    }

    /// Mark a task exited; it stays known to [`TaskDirectory::process_of`]
    pub fn exit_task(&self, task: TaskId) {
        if let Some(entry) = self.state.lock().tasks.get_mut(&task) {
            entry.alive = false;
        }
    }

    pub fn set_credentials(&self, pid: ProcessId, credentials: Credentials) {
        if let Some(entry) = self.state.lock().processes.get_mut(&pid) {
            entry.credentials = credentials;
        }
    }
}

impl TaskDirectory for MockTasks {
    fn process_of(&self, task: TaskId) -> Option<ProcessId> {
        self.state.lock().tasks.get(&task).map(|entry| entry.pid)
    }

    fn is_alive(&self, task: TaskId) -> bool {
        let state = self.state.lock();
        state.tasks.get(&task).is_some_and(|entry| {
            entry.alive
                && state
                    .processes
                    .get(&entry.pid)
                    .is_some_and(|process| process.user_mode)
        })
    }

    fn credentials(&self, pid: ProcessId) -> Option<Credentials> {
        self.state.lock().processes.get(&pid).map(|entry| entry.credentials)
    }
}

// ---------------------------------------------------------------------------
// User memory
// ---------------------------------------------------------------------------

/// Byte ranges registered as user memory of each process
#[derive(Default)]
pub struct MockUserMemory {
    regions: Mutex<HashMap<ProcessId, BTreeMap<usize, Vec<u8>>>>,
}

impl MockUserMemory {
    /// Place `bytes` at `addr` in `pid`'s address space
    pub fn map(&self, pid: ProcessId, addr: usize, bytes: impl Into<Vec<u8>>) {
        self.regions
            .lock()
            .entry(pid)
            .or_default()
            .insert(addr, bytes.into());
    }

    pub fn unmap(&self, pid: ProcessId, addr: usize) {
        if let Some(regions) = self.regions.lock().get_mut(&pid) {
            regions.remove(&addr);
        }
    }
}

impl UserMemory for MockUserMemory {
    fn copy_from_user(&self, pid: ProcessId, addr: usize, len: usize) -> Result<Vec<u8>> {
        let bad = PlatformError::BadAddress { addr, len };
        let regions = self.regions.lock();
        let (start, bytes) = regions
            .get(&pid)
            .and_then(|map| map.range(..=addr).next_back())
            .ok_or(bad)?;
        let from = addr - start;
        let to = from.checked_add(len).ok_or(bad)?;
        bytes.get(from..to).map(<[u8]>::to_vec).ok_or(bad)
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Manually advanced clock
#[derive(Default)]
pub struct MockClock {
    nanos: AtomicU64,
}

impl MockClock {
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
