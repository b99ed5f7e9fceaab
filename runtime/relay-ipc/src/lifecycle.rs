//! Task and process teardown
//!
//! Called by the scheduler and process manager. None of these operations
//! fail; problems are logged and the teardown continues.
//!
//! ## Task exit
//!
//! 1. Close the task's endpoint and roll back every queued message
//! 2. Revoke every grant that let other processes reach the task
//! 3. Send one death notice to the IPC task of each such process
//! 4. Retire the task's handles and its IPC-task designation
//!
//! ## Process exit
//!
//! Revoke the process' grants, forget its endpoints and unmap its pool.

use relay_platform::{ProcessId, TaskId};

use crate::process::ProcessIpc;
use crate::IpcSubsystem;

impl IpcSubsystem {
    /// Interrupt `task`'s blocked receive with [`crate::IpcError::Cancelled`]
    pub fn kill_task(&self, task: TaskId) {
        if let Some(endpoint) = self.endpoints.get(task) {
            log::debug!("lifecycle: killing receive of {}", task);
            endpoint.kill();
        }
    }

    /// Clean up after a task exited
    pub fn on_task_exit(&self, task: TaskId) {
        let pid = self
            .platform
            .tasks
            .process_of(task)
            .or_else(|| self.endpoints.get(task).map(|endpoint| endpoint.process()));
        let process = pid.and_then(|pid| self.processes.get(pid));
        // Leave a closed endpoint behind even for a task that never received,
        // so a late sender sees it gone
        let endpoint = pid.map(|pid| self.endpoints.get_or_create(task, pid));

        if let Some(endpoint) = endpoint {
            let drained = endpoint.close();
            if !drained.is_empty() {
                log::debug!("lifecycle: purging {} queued messages of {}", drained.len(), task);
            }
            match &process {
                Some(process) => {
                    for queued in &drained {
                        self.discard(process, queued);
                    }
                }
                None => log::warn!("lifecycle: {} has no process state, dropping queue", task),
            }
        }

        let grantees = self.registry.revoke_owner(task);
        let handles = self.registry.release_task(task);
        let token = handles.first().map_or(task.0, |handle| handle.0);

        if let Some(pid) = pid {
            for grantee in grantees.into_iter().filter(|grantee| *grantee != pid) {
                self.notify_death(task, pid, grantee, token);
            }
        }

        if let Some(process) = process {
            if process.clear_ipc_task_if(task) {
                log::debug!("lifecycle: {} no longer serves {}", task, process.pid());
            }
        }
    }

    fn notify_death(&self, dead: TaskId, dead_process: ProcessId, grantee: ProcessId, token: u32) {
        let Some(ipc_task) = self.processes.ipc_task_of(grantee) else {
            log::debug!("lifecycle: {} has no IPC task to notify", grantee);
            return;
        };
        if let Err(err) = self.send_death_notice(dead, dead_process, ipc_task, token) {
            log::warn!("lifecycle: death notice for {} to {} failed: {}", dead, ipc_task, err);
        }
    }

    /// Clean up after a process exited; all its tasks have exited already
    pub fn on_process_exit(&self, pid: ProcessId) {
        self.teardown_process(pid);
    }

    /// Give a forked child fresh IPC state that remembers the parent's pool
    /// placement
    ///
    /// Nothing is inherited when the parent never opened the device.
    pub fn on_process_fork(&self, parent: ProcessId, child: ProcessId) {
        let Some(parent_state) = self.processes.get(parent) else {
            return;
        };
        let preferred = parent_state
            .pool()
            .user_base()
            .or(parent_state.preferred_user_base());
        self.processes
            .insert(ProcessIpc::with_preferred_base(child, preferred));
        log::debug!("lifecycle: {} forked from {}", child, parent);
    }

    pub(crate) fn teardown_process(&self, pid: ProcessId) {
        self.registry.revoke_grantee(pid);
        self.endpoints.remove_process(pid);

        let Some(process) = self.processes.remove(pid) else {
            return;
        };
        process.clear_pending_free();
        let dropped = process.pool().unbind(pid, &*self.platform.pages);
        log::debug!("lifecycle: {} torn down ({} pool allocations dropped)", pid, dropped);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::message::{MessageKind, OutboundMessage, Payload};
    use crate::receiver::Expectation;
    use crate::testing::Harness;
    use crate::IpcError;

    const SHORT: Option<Duration> = Some(Duration::from_millis(20));

    #[test]
    fn test_service_exit() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (service, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.ipc.bind_endpoint(client.task).unwrap();
        h.grant(&authority, &client, handle);

        h.ipc
            .send(client.task, &OutboundMessage::request(handle, 1, Payload::new()))
            .unwrap();
        h.mock.tasks.exit_task(service.task);
        h.ipc.on_task_exit(service.task);

        // Queue purged back into the service's pool
        assert_eq!(h.ipc.queue_len(service.task), 0);
        assert_eq!(h.ipc.pool_stats(service.pid).unwrap().outstanding, 0);
        assert!(!h.ipc.has_access(client.pid, handle));
        assert!(h.ipc.process(service.pid).unwrap().ipc_task().is_none());

        let notice = h.ipc.receive(client.task, Expectation::Request, SHORT).unwrap();
        assert_eq!(notice.kind(), MessageKind::DeathNotice);
        assert_eq!(notice.header.sender_task, service.task);
        assert_eq!(notice.header.target.token, handle.0);
    }

    #[test]
    fn test_no_notice_without_ipc_task() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (service, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.grant(&authority, &client, handle);

        h.mock.tasks.exit_task(service.task);
        h.ipc.on_task_exit(service.task);
        assert_eq!(h.ipc.queue_len(client.task), 0);
        assert_eq!(h.ipc.registry().grantees_of(service.task), Vec::new());
    }

    #[test]
    fn test_exit_before_first_receive_leaves_tombstone() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (service, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.grant(&authority, &client, handle);
        assert!(h.ipc.endpoints.get(service.task).is_none());

        h.ipc.on_task_exit(service.task);
        assert!(h
            .ipc
            .endpoints
            .get(service.task)
            .is_some_and(|endpoint| endpoint.is_closed()));

        // Still alive to the scheduler, but its queue refuses new work
        h.ipc.registry().grant_access(client.pid, handle).unwrap();
        let free = h.ipc.pool_stats(service.pid).unwrap().free;
        assert_eq!(
            h.ipc
                .send(client.task, &OutboundMessage::request(handle, 1, Payload::new())),
            Err(IpcError::TargetGone(service.task))
        );
        assert_eq!(h.ipc.pool_stats(service.pid).unwrap().free, free);
        assert_eq!(h.ipc.queue_len(service.task), 0);
    }

    #[test]
    fn test_authority_exit_allows_successor() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        h.mock.tasks.exit_task(authority.task);
        h.ipc.on_task_exit(authority.task);
        assert_eq!(h.ipc.registry().authority(), None);

        let successor = h.spawn();
        h.ipc.establish_authority(successor.task, 4096).unwrap();
        assert_eq!(h.ipc.registry().authority(), Some(successor.task));
    }

    #[test]
    fn test_kill_cancels_blocked_receive() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (service, _) = h.spawn_service(&authority);

        crossbeam::thread::scope(|scope| {
            let receiver = scope.spawn(|_| h.ipc.receive(service.task, Expectation::Request, None));
            while !h
                .ipc
                .endpoints
                .get(service.task)
                .is_some_and(|endpoint| endpoint.is_waiting())
            {
                std::thread::yield_now();
            }
            h.ipc.kill_task(service.task);
            assert_eq!(receiver.join().unwrap(), Err(IpcError::Cancelled));
        })
        .unwrap();
    }

    #[test]
    fn test_process_exit() {
        let h = Harness::new();
        let authority = h.spawn_authority();
        let (_, handle) = h.spawn_service(&authority);
        let client = h.spawn();
        h.grant(&authority, &client, handle);
        assert!(h.mock.memory.mapped_pages(client.pid) > 0);

        h.mock.tasks.exit_task(client.task);
        h.ipc.on_task_exit(client.task);
        h.ipc.on_process_exit(client.pid);

        assert!(h.ipc.process(client.pid).is_none());
        assert_eq!(h.mock.memory.mapped_pages(client.pid), 0);
        assert_eq!(h.ipc.registry().grants_held_by(client.pid), 0);
        assert!(!h.ipc.has_access(client.pid, handle));
    }

    #[test]
    fn test_fork_inherits_placement() {
        let h = Harness::new();
        let parent = h.spawn();
        let child = h.mock.tasks.spawn_process();

        h.ipc.on_process_fork(parent.pid, child);
        let state = h.ipc.process(child).unwrap();
        assert!(!state.pool().is_mapped());
        assert_eq!(state.preferred_user_base(), Some(h.ipc.config().pool_user_base));
        assert_eq!(
            h.ipc.default_region(child).user_base,
            h.ipc.config().pool_user_base
        );
    }

    #[test]
    fn test_fork_from_closed_parent() {
        let h = Harness::new();
        let parent = h.mock.tasks.spawn_process();
        let child = h.mock.tasks.spawn_process();
        h.ipc.on_process_fork(parent, child);
        assert!(h.ipc.process(child).is_none());
    }
}
