//! World engine syscalls: WORLD_CREATE, DESTROY, LIST, JOIN, LEAVE,
//! EVENT, STATE, SNAPSHOT, RESTORE.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::audit::AuditCategory;
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;
use crate::world::WorldError;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::WorldCreate, handle_create);
    handler!(router, ctx, SyscallOp::WorldDestroy, handle_destroy);
    handler!(router, ctx, SyscallOp::WorldList, handle_list);
    handler!(router, ctx, SyscallOp::WorldJoin, handle_join);
    handler!(router, ctx, SyscallOp::WorldLeave, handle_leave);
    handler!(router, ctx, SyscallOp::WorldEvent, handle_event);
    handler!(router, ctx, SyscallOp::WorldState, handle_state);
    handler!(router, ctx, SyscallOp::WorldSnapshot, handle_snapshot);
    handler!(router, ctx, SyscallOp::WorldRestore, handle_restore);
}

fn world_failure(frame: &Frame, error: WorldError) -> Frame {
    let kind = match &error {
        WorldError::NotFound(_) | WorldError::NotJoined => ErrorKind::NotFound,
        WorldError::NotEmpty(_) | WorldError::AlreadyJoined(_) | WorldError::Exists(_) => {
            ErrorKind::Conflict
        }
    };
    fail(frame, kind, error.to_string())
}

#[derive(Deserialize)]
struct CreateRequest {
    #[serde(default = "default_world_name")]
    name: String,
    #[serde(default)]
    config: Value,
}

fn default_world_name() -> String {
    "unnamed".to_string()
}

fn handle_create(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: CreateRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let world_id = ctx.worlds.create_world(&request.name, &request.config);
    ctx.audit.log(
        AuditCategory::World,
        "WORLD_CREATE",
        frame.agent_id,
        json!({"world_id": &world_id, "name": &request.name}),
        true,
    );
    reply(
        frame,
        json!({"success": true, "world_id": world_id, "name": request.name}),
    )
}

#[derive(Deserialize)]
struct DestroyRequest {
    #[serde(default)]
    world_id: String,
    #[serde(default)]
    force: bool,
}

fn handle_destroy(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: DestroyRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.world_id.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "world_id required");
    }

    match ctx.worlds.destroy_world(&request.world_id, request.force) {
        Ok(()) => {
            ctx.audit.log(
                AuditCategory::World,
                "WORLD_DESTROY",
                frame.agent_id,
                json!({"world_id": &request.world_id, "force": request.force}),
                true,
            );
            reply(frame, json!({"success": true, "world_id": request.world_id}))
        }
        Err(e) => world_failure(frame, e),
    }
}

fn handle_list(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let worlds = ctx.worlds.list_worlds();
    reply(
        frame,
        json!({"success": true, "count": worlds.len(), "worlds": worlds}),
    )
}

#[derive(Deserialize)]
struct WorldIdRequest {
    #[serde(default)]
    world_id: String,
}

fn handle_join(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: WorldIdRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.world_id.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "world_id required");
    }

    match ctx.worlds.join_world(frame.agent_id, &request.world_id) {
        Ok(()) => {
            ctx.audit.log(
                AuditCategory::World,
                "WORLD_JOIN",
                frame.agent_id,
                json!({"world_id": &request.world_id}),
                true,
            );
            reply(frame, json!({"success": true, "world_id": request.world_id}))
        }
        Err(e) => world_failure(frame, e),
    }
}

fn handle_leave(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    match ctx.worlds.leave_world(frame.agent_id) {
        Ok(world_id) => {
            ctx.audit.log(
                AuditCategory::World,
                "WORLD_LEAVE",
                frame.agent_id,
                json!({"world_id": &world_id}),
                true,
            );
            reply(frame, json!({"success": true, "world_id": world_id}))
        }
        Err(e) => world_failure(frame, e),
    }
}

#[derive(Deserialize)]
struct EventRequest {
    #[serde(default)]
    world_id: String,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    params: Value,
}

fn handle_event(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: EventRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.world_id.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "world_id required");
    }
    if request.event_type.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "event_type required");
    }

    match ctx
        .worlds
        .inject_event(&request.world_id, &request.event_type, request.params)
    {
        Ok(()) => {
            tracing::info!(
                agent_id = frame.agent_id,
                world_id = %request.world_id,
                event = %request.event_type,
                "chaos event injected"
            );
            ctx.audit.log(
                AuditCategory::World,
                "WORLD_EVENT",
                frame.agent_id,
                json!({"world_id": &request.world_id, "event_type": &request.event_type}),
                true,
            );
            reply(
                frame,
                json!({
                    "success": true,
                    "world_id": request.world_id,
                    "event_type": request.event_type,
                }),
            )
        }
        Err(e) => world_failure(frame, e),
    }
}

fn handle_state(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: WorldIdRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.world_id.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "world_id required");
    }

    match ctx.worlds.world_state(&request.world_id) {
        Ok(state) => reply(frame, json!({"success": true, "state": state})),
        Err(e) => world_failure(frame, e),
    }
}

fn handle_snapshot(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: WorldIdRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.world_id.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "world_id required");
    }

    match ctx.worlds.snapshot_world(&request.world_id) {
        Ok(snapshot) => {
            ctx.audit.log(
                AuditCategory::World,
                "WORLD_SNAPSHOT",
                frame.agent_id,
                json!({"world_id": &request.world_id}),
                true,
            );
            reply(frame, json!({"success": true, "snapshot": snapshot}))
        }
        Err(e) => world_failure(frame, e),
    }
}

#[derive(Deserialize)]
struct RestoreRequest {
    #[serde(default)]
    snapshot: Value,
    #[serde(default)]
    new_world_id: String,
}

fn handle_restore(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: RestoreRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if !request.snapshot.is_object() {
        return fail(frame, ErrorKind::InvalidRequest, "snapshot required");
    }

    let new_id = (!request.new_world_id.is_empty()).then_some(request.new_world_id.as_str());
    match ctx.worlds.restore_world(&request.snapshot, new_id) {
        Ok(world_id) => {
            ctx.audit.log(
                AuditCategory::World,
                "WORLD_RESTORE",
                frame.agent_id,
                json!({"world_id": &world_id}),
                true,
            );
            reply(frame, json!({"success": true, "world_id": world_id}))
        }
        Err(e) => world_failure(frame, e),
    }
}
