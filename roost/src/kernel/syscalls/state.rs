//! State store syscalls: STORE, FETCH, DELETE, KEYS.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::audit::AuditCategory;
use crate::kernel::events::KernelEventType;
use crate::kernel::router::SyscallRouter;
use crate::kernel::state::Scope;
use crate::kernel::KernelContext;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::Store, handle_store);
    handler!(router, ctx, SyscallOp::Fetch, handle_fetch);
    handler!(router, ctx, SyscallOp::Delete, handle_delete);
    handler!(router, ctx, SyscallOp::Keys, handle_keys);
}

#[derive(Deserialize)]
struct StoreRequest {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Value,
    #[serde(default = "default_scope")]
    scope: String,
    #[serde(default)]
    ttl: Option<i64>,
}

fn default_scope() -> String {
    "global".to_string()
}

fn handle_store(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: StoreRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.key.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "key is required");
    }

    let scope = Scope::parse(&request.scope);
    let stored_scope = ctx
        .state
        .store(frame.agent_id, &request.key, request.value, scope, request.ttl);
    tracing::debug!(
        agent_id = frame.agent_id,
        key = %request.key,
        scope = stored_scope.as_str(),
        "stored key"
    );

    // Only global writes are observable by other agents, so only they
    // produce STATE_CHANGED.
    if stored_scope == Scope::Global {
        ctx.events.emit(
            KernelEventType::StateChanged,
            json!({"key": &request.key, "action": "store", "agent_id": frame.agent_id}),
            frame.agent_id,
        );
    }
    ctx.audit.log(
        AuditCategory::State,
        "STORE",
        frame.agent_id,
        json!({"key": &request.key, "scope": stored_scope.as_str()}),
        true,
    );

    reply(
        frame,
        json!({"success": true, "key": request.key, "scope": stored_scope.as_str()}),
    )
}

#[derive(Deserialize)]
struct KeyRequest {
    #[serde(default)]
    key: String,
}

fn handle_fetch(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: KeyRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.key.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "key is required");
    }

    let fetched = ctx.state.fetch(frame.agent_id, &request.key);
    let mut body = json!({
        "success": true,
        "exists": fetched.exists,
        "value": fetched.value,
    });
    if let Some(scope) = fetched.scope {
        body["scope"] = json!(scope.as_str());
    }
    reply(frame, body)
}

fn handle_delete(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: KeyRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.key.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "key is required");
    }

    let deleted = ctx.state.erase(frame.agent_id, &request.key);
    if deleted {
        tracing::debug!(agent_id = frame.agent_id, key = %request.key, "deleted key");
        ctx.audit.log(
            AuditCategory::State,
            "DELETE",
            frame.agent_id,
            json!({"key": request.key}),
            true,
        );
    }
    reply(frame, json!({"success": true, "deleted": deleted}))
}

#[derive(Deserialize)]
struct KeysRequest {
    #[serde(default)]
    prefix: String,
}

fn handle_keys(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: KeysRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let keys = ctx.state.keys(frame.agent_id, &request.prefix);
    reply(frame, json!({"success": true, "count": keys.len(), "keys": keys}))
}
