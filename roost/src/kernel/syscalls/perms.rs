//! Permission syscalls: GET_PERMS, SET_PERMS.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::audit::AuditCategory;
use crate::kernel::events::KernelEventType;
use crate::kernel::permissions::{AgentPermissions, PermissionLevel};
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::GetPerms, handle_get_perms);
    handler!(router, ctx, SyscallOp::SetPerms, handle_set_perms);
}

fn handle_get_perms(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let perms = ctx.permissions.get_or_create(frame.agent_id);
    reply(
        frame,
        json!({"success": true, "permissions": serde_json::to_value(&perms).unwrap_or(Value::Null)}),
    )
}

#[derive(Deserialize)]
struct SetPermsRequest {
    #[serde(default)]
    agent_id: Option<u32>,
    #[serde(default)]
    permissions: Option<Value>,
    #[serde(default)]
    level: Option<String>,
}

/// Cross-agent mutation requires the caller to hold `can_spawn`.
fn handle_set_perms(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: SetPermsRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let target_id = request.agent_id.unwrap_or(frame.agent_id);
    if target_id != frame.agent_id {
        let caller = ctx.permissions.get_or_create(frame.agent_id);
        if !caller.can_spawn {
            tracing::warn!(
                agent_id = frame.agent_id,
                target_id,
                "denied cross-agent permission change"
            );
            ctx.events.emit(
                KernelEventType::SyscallBlocked,
                json!({"opcode": "SET_PERMS", "agent_id": frame.agent_id, "target": target_id}),
                frame.agent_id,
            );
            ctx.audit.log(
                AuditCategory::Security,
                "SET_PERMS_DENIED",
                frame.agent_id,
                json!({"target": target_id}),
                false,
            );
            return fail(
                frame,
                ErrorKind::PermissionDenied,
                "cannot modify another agent's permissions",
            );
        }
    }

    if let Some(perms_json) = request.permissions {
        let perms: AgentPermissions = match serde_json::from_value(perms_json) {
            Ok(p) => p,
            Err(e) => {
                return fail(
                    frame,
                    ErrorKind::InvalidRequest,
                    format!("invalid permissions: {e}"),
                );
            }
        };
        ctx.permissions.set_permissions(target_id, perms);
        tracing::info!(agent_id = frame.agent_id, target_id, "permissions set");
    } else if let Some(level_str) = request.level {
        let level = PermissionLevel::parse(&level_str);
        ctx.permissions.set_level(target_id, level);
        tracing::info!(
            agent_id = frame.agent_id,
            target_id,
            level = level.as_str(),
            "permission level set"
        );
    } else {
        return fail(
            frame,
            ErrorKind::InvalidRequest,
            "permissions or level required",
        );
    }

    ctx.audit.log(
        AuditCategory::Security,
        "SET_PERMS",
        frame.agent_id,
        json!({"target": target_id}),
        true,
    );
    reply(frame, json!({"success": true, "agent_id": target_id}))
}
