//! Special-object marshalling
//!
//! # Purpose
//!
//! A payload may embed records the kernel must translate for the receiver:
//! out-of-line buffers, file descriptors and service handles. Marshalling
//! rewrites each record in place inside the destination pool.
//!
//! ## Design
//!
//! - Offsets are validated one by one as they are visited (in range, strictly
//!   ascending, non-overlapping)
//! - Every object kind has a commit and a rollback that undoes exactly what
//!   the commit did
//! - One routine commits all objects of a message; if object *k* fails,
//!   objects *k-1..0* are rolled back in reverse and the error is returned
//! - Access grants carried by handle objects are applied only once every
//!   object has committed
//!
//! | Object     | Commit                                          | Rollback                 |
//! |------------|-------------------------------------------------|--------------------------|
//! | Buffer     | copy from sender into dest pool, rewrite address | free copy, drop pending  |
//! | Descriptor | duplicate into dest process, rewrite fd         | close duplicate          |
//! | Handle     | check liveness and sender access                | nothing                  |

use relay_platform::{Platform, ProcessId, TaskId};

use crate::address::UserAddr;
use crate::error::{IpcError, Result};
use crate::message::{check_object_offset, decode_offsets, NodeLayout, SpecialObject, OFFSET_ENTRY_SIZE, SPECIAL_OBJECT_SIZE};
use crate::process::{PendingFree, ProcessIpc, ProcessTable};
use crate::registry::{Handle, Registry};

/// Everything a commit needs to know about one delivery
pub(crate) struct MarshalContext<'a> {
    pub sender_task: TaskId,
    pub sender_process: ProcessId,
    pub dest: &'a ProcessIpc,
    pub registry: &'a Registry,
    pub processes: &'a ProcessTable,
    pub platform: &'a Platform,
}

/// Translate every special object of the message at `layout`
///
/// # Errors
///
/// The first failing object's error, after all earlier objects were rolled
/// back. The message node itself is left for the caller to free.
pub(crate) fn commit(ctx: &MarshalContext<'_>, layout: &NodeLayout) -> Result<()> {
    if layout.object_count == 0 {
        return Ok(());
    }
    let offsets = read_offsets(ctx.dest, layout)?;

    let mut applied = Vec::with_capacity(offsets.len());
    let mut grants = Vec::new();
    let result = commit_each(ctx, layout, &offsets, &mut applied, &mut grants)
        .and_then(|()| apply_grants(ctx, &grants));

    if let Err(err) = result {
        log::warn!(
            "marshal: {} of {} objects committed before failure: {}",
            applied.len(),
            offsets.len(),
            err
        );
        for object in applied.iter().rev() {
            rollback_object(ctx.dest, ctx.platform, object);
        }
        return Err(err);
    }
    Ok(())
}

/// Undo every special object of a committed message, last to first
///
/// Used when a queued message is discarded. Failures are logged and skipped.
pub(crate) fn rollback(dest: &ProcessIpc, platform: &Platform, layout: &NodeLayout) {
    if layout.object_count == 0 {
        return;
    }
    let offsets = match read_offsets(dest, layout) {
        Ok(offsets) => offsets,
        Err(err) => {
            log::error!("marshal: cannot read offset table for rollback: {}", err);
            return;
        }
    };
    for offset in offsets.iter().rev() {
        let at = layout.payload().add(*offset as usize);
        match dest
            .pool()
            .read(at, SPECIAL_OBJECT_SIZE)
            .and_then(|bytes| SpecialObject::decode(&bytes))
        {
            Ok(object) => rollback_object(dest, platform, &object),
            Err(err) => log::error!("marshal: skipping unreadable object at +{:#x}: {}", at.0, err),
        }
    }
}

fn read_offsets(dest: &ProcessIpc, layout: &NodeLayout) -> Result<Vec<u32>> {
    let bytes = dest
        .pool()
        .read(layout.offsets(), layout.object_count * OFFSET_ENTRY_SIZE)?;
    Ok(decode_offsets(&bytes))
}

fn commit_each(
    ctx: &MarshalContext<'_>,
    layout: &NodeLayout,
    offsets: &[u32],
    applied: &mut Vec<SpecialObject>,
    grants: &mut Vec<Handle>,
) -> Result<()> {
    let mut previous = None;
    for &offset in offsets {
        let relative = check_object_offset(offset, previous, layout.payload_size)?;
        previous = Some(offset);

        let at = layout.payload().add(relative);
        let object = SpecialObject::decode(&ctx.dest.pool().read(at, SPECIAL_OBJECT_SIZE)?)?;
        let committed = commit_object(ctx, object, grants)?;
        applied.push(committed);
        ctx.dest.pool().write(at, &committed.encode())?;
    }
    Ok(())
}

fn commit_object(
    ctx: &MarshalContext<'_>,
    object: SpecialObject,
    grants: &mut Vec<Handle>,
) -> Result<SpecialObject> {
    match object {
        SpecialObject::Buffer { addr, len } => {
            if addr == 0 || len == 0 {
                return Err(IpcError::InvalidArgument("empty buffer object"));
            }
            let bytes = ctx
                .platform
                .user
                .copy_from_user(ctx.sender_process, addr as usize, len as usize)
                .map_err(|err| {
                    log::error!("marshal: {} passed a bad buffer: {}", ctx.sender_task, err);
                    IpcError::InvalidArgument("buffer object outside sender memory")
                })?;

            let pool = ctx.dest.pool();
            let copy = pool.allocate(bytes.len())?;
            let placed = pool.write(copy, &bytes).and_then(|()| pool.user_address_of(copy));
            let user = match placed {
                Ok(user) => user,
                Err(err) => {
                    if let Err(free_err) = pool.free(copy) {
                        log::error!("marshal: leaking buffer copy at +{:#x}: {}", copy.0, free_err);
                    }
                    return Err(err);
                }
            };
            ctx.dest.mark_pending_free(copy, PendingFree::Buffer);
            Ok(SpecialObject::Buffer {
                addr: user.0 as u64,
                len,
            })
        }
        SpecialObject::Descriptor { fd } => {
            let dup = ctx
                .platform
                .descriptors
                .dup_into(ctx.sender_process, fd, ctx.dest.pid())?;
            Ok(SpecialObject::Descriptor { fd: dup })
        }
        SpecialObject::Handle { handle, .. } => {
            let handle = Handle(handle);
            let tasks = &*ctx.platform.tasks;
            let target = ctx.registry.resolve(handle)?;
            if !tasks.is_alive(target) {
                return Err(IpcError::InvalidArgument("handle object names a dead task"));
            }
            if !ctx.registry.has_access(ctx.sender_process, handle, tasks) {
                log::error!("marshal: {} cannot pass {} it does not hold", ctx.sender_task, handle);
                return Err(IpcError::PermissionDenied);
            }
            let serves_its_process = tasks
                .process_of(target)
                .and_then(|pid| ctx.processes.ipc_task_of(pid))
                .is_some_and(|ipc_task| ipc_task == target);
            if serves_its_process {
                grants.push(handle);
            }
            Ok(object)
        }
    }
}

fn apply_grants(ctx: &MarshalContext<'_>, grants: &[Handle]) -> Result<()> {
    for handle in grants {
        ctx.registry.grant_access(ctx.dest.pid(), *handle)?;
    }
    Ok(())
}

fn rollback_object(dest: &ProcessIpc, platform: &Platform, object: &SpecialObject) {
    match *object {
        SpecialObject::Buffer { addr, .. } => {
            let released = dest
                .pool()
                .kernel_address_of(UserAddr(addr as usize))
                .and_then(|copy| {
                    dest.take_pending_free(copy, Some(PendingFree::Buffer));
                    dest.pool().free(copy)
                });
            if let Err(err) = released {
                log::error!("marshal: cannot release buffer copy at {:#x}: {}", addr, err);
            }
        }
        SpecialObject::Descriptor { fd } => {
            if let Err(err) = platform.descriptors.close(dest.pid(), fd) {
                log::error!("marshal: cannot close duplicated fd {}: {}", fd, err);
            }
        }
        SpecialObject::Handle { .. } => {}
    }
}
