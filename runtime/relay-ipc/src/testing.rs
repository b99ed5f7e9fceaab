//! Shared fixtures for unit tests

use std::sync::Arc;

use relay_platform::mock::MockPlatform;
use relay_platform::{ProcessId, TaskId};

use crate::control::{AdminCommand, AdminReply};
use crate::registry::Handle;
use crate::trace::RingSink;
use crate::{IpcConfig, IpcSubsystem};

pub(crate) struct Harness {
    pub mock: MockPlatform,
    pub ipc: IpcSubsystem,
    pub ring: Arc<RingSink>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Proc {
    pub pid: ProcessId,
    pub task: TaskId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(IpcConfig::default())
    }

    pub fn with_config(config: IpcConfig) -> Self {
        let mock = MockPlatform::new();
        let ring = Arc::new(RingSink::new(64));
        let ipc = IpcSubsystem::new(config, mock.platform())
            .unwrap()
            .with_trace_sink(ring.clone());
        Self { mock, ipc, ring }
    }

    /// Process with one task, device opened and pool mapped
    pub fn spawn(&self) -> Proc {
        let pid = self.mock.tasks.spawn_process();
        let task = self.mock.tasks.spawn_task(pid);
        self.ipc.open_process(pid);
        self.ipc.map_pool(task, self.ipc.default_region(pid)).unwrap();
        Proc { pid, task }
    }

    pub fn spawn_authority(&self) -> Proc {
        let authority = self.spawn();
        self.ipc.establish_authority(authority.task, 64 * 1024).unwrap();
        authority
    }

    /// Process whose IPC task serves a freshly minted handle
    pub fn spawn_service(&self, authority: &Proc) -> (Proc, Handle) {
        let service = self.spawn();
        self.ipc.bind_endpoint(service.task).unwrap();
        let reply = self
            .ipc
            .admin(authority.task, AdminCommand::GenerateHandle { task: Some(service.task) })
            .unwrap();
        let AdminReply::Handle(handle) = reply else {
            panic!("expected a handle, got {:?}", reply);
        };
        (service, handle)
    }

    pub fn grant(&self, authority: &Proc, client: &Proc, handle: Handle) {
        self.ipc
            .admin(authority.task, AdminCommand::GrantAccess { task: client.task, handle })
            .unwrap();
    }
}
