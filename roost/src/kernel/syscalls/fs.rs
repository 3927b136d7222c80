//! File syscalls: READ, WRITE.
//!
//! If the caller is in a world whose VFS intercepts the path, the virtual
//! filesystem is used and the chaos engine is consulted in the same
//! pre-I/O step. Otherwise the host filesystem is used behind the
//! caller's path allow-lists.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::audit::AuditCategory;
use crate::kernel::events::KernelEventType;
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;
use crate::world::World;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::Read, handle_read);
    handler!(router, ctx, SyscallOp::Write, handle_write);
}

#[derive(Deserialize)]
struct ReadRequest {
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
struct WriteRequest {
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
    /// "write" or "append".
    #[serde(default = "default_write_mode")]
    mode: String,
}

fn default_write_mode() -> String {
    "write".to_string()
}

/// The world whose VFS claims this path, if the agent is in one.
fn intercepting_world(ctx: &KernelContext, agent_id: u32, path: &str) -> Option<Arc<World>> {
    let world = ctx.worlds.world_of(agent_id)?;
    (world.vfs().is_enabled() && world.vfs().should_intercept(path)).then_some(world)
}

fn handle_read(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: ReadRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.path.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "path required");
    }

    if let Some(world) = intercepting_world(ctx, frame.agent_id, &request.path) {
        return read_virtual(ctx, frame, &world, &request.path);
    }

    let perms = ctx.permissions.get_or_create(frame.agent_id);
    if !perms.can_read_path(&request.path) {
        tracing::warn!(agent_id = frame.agent_id, path = %request.path, "read denied");
        ctx.events.emit(
            KernelEventType::SyscallBlocked,
            json!({"opcode": "READ", "agent_id": frame.agent_id, "path": &request.path}),
            frame.agent_id,
        );
        ctx.audit.log(
            AuditCategory::Security,
            "READ_DENIED",
            frame.agent_id,
            json!({"path": &request.path}),
            false,
        );
        return fail(
            frame,
            ErrorKind::PermissionDenied,
            "path not allowed for reading",
        );
    }

    tracing::debug!(agent_id = frame.agent_id, path = %request.path, "reading file");
    match std::fs::read(&request.path) {
        Ok(bytes) => {
            let content = String::from_utf8_lossy(&bytes).into_owned();
            reply(
                frame,
                json!({"success": true, "content": content, "size": bytes.len()}),
            )
        }
        Err(e) => fail(frame, ErrorKind::IoFailure, format!("failed to read file: {e}")),
    }
}

fn read_virtual(ctx: &Arc<KernelContext>, frame: &Frame, world: &World, path: &str) -> Frame {
    world.record_syscall();
    ctx.audit.log(
        AuditCategory::World,
        "VFS_READ",
        frame.agent_id,
        json!({"path": path, "world": world.id()}),
        true,
    );

    if world.chaos().should_fail_read(path) {
        tracing::debug!(path, world = world.id(), "chaos read failure");
        return reply(
            frame,
            json!({
                "success": false,
                "error": "Simulated read failure (chaos)",
                "error_kind": ErrorKind::ChaosFailure.as_str(),
                "content": "",
                "size": 0,
                "world": world.id(),
            }),
        );
    }

    match world.vfs().read(path) {
        Some(content) => reply(
            frame,
            json!({
                "success": true,
                "content": content,
                "size": content.len(),
                "world": world.id(),
                "virtual": true,
            }),
        ),
        None => reply(
            frame,
            json!({
                "success": false,
                "error": "File not found in virtual filesystem",
                "error_kind": ErrorKind::NotFound.as_str(),
                "content": "",
                "size": 0,
                "world": world.id(),
            }),
        ),
    }
}

fn handle_write(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: WriteRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.path.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "path required");
    }
    let append = request.mode == "append";

    if let Some(world) = intercepting_world(ctx, frame.agent_id, &request.path) {
        return write_virtual(frame, &world, &request.path, &request.content, append);
    }

    let perms = ctx.permissions.get_or_create(frame.agent_id);
    if !perms.can_write_path(&request.path) {
        tracing::warn!(agent_id = frame.agent_id, path = %request.path, "write denied");
        ctx.events.emit(
            KernelEventType::SyscallBlocked,
            json!({"opcode": "WRITE", "agent_id": frame.agent_id, "path": &request.path}),
            frame.agent_id,
        );
        ctx.audit.log(
            AuditCategory::Security,
            "WRITE_DENIED",
            frame.agent_id,
            json!({"path": &request.path}),
            false,
        );
        return fail(
            frame,
            ErrorKind::PermissionDenied,
            "path not allowed for writing",
        );
    }

    tracing::debug!(agent_id = frame.agent_id, path = %request.path, append, "writing file");
    let result = if append {
        use std::io::Write;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.path)
            .and_then(|mut file| file.write_all(request.content.as_bytes()))
    } else {
        std::fs::write(&request.path, request.content.as_bytes())
    };

    match result {
        Ok(()) => reply(
            frame,
            json!({"success": true, "bytes_written": request.content.len()}),
        ),
        Err(e) => fail(
            frame,
            ErrorKind::IoFailure,
            format!("failed to write file: {e}"),
        ),
    }
}

fn write_virtual(frame: &Frame, world: &World, path: &str, content: &str, append: bool) -> Frame {
    world.record_syscall();

    if world.chaos().should_fail_write(path) {
        tracing::debug!(path, world = world.id(), "chaos write failure");
        return reply(
            frame,
            json!({
                "success": false,
                "error": "Simulated write failure (chaos)",
                "error_kind": ErrorKind::ChaosFailure.as_str(),
                "bytes_written": 0,
                "world": world.id(),
            }),
        );
    }

    if world.vfs().write(path, content, append) {
        reply(
            frame,
            json!({
                "success": true,
                "bytes_written": content.len(),
                "world": world.id(),
                "virtual": true,
            }),
        )
    } else {
        reply(
            frame,
            json!({
                "success": false,
                "error": "Virtual filesystem write denied",
                "error_kind": ErrorKind::PermissionDenied.as_str(),
                "bytes_written": 0,
                "world": world.id(),
            }),
        )
    }
}
