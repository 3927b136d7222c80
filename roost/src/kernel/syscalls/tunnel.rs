//! Tunnel syscalls: TUNNEL_CONNECT, DISCONNECT, STATUS, LIST_REMOTES,
//! CONFIG.
//!
//! Connect and disconnect talk to the relay proxy and may wait on it, so
//! they run on the async pool; a pool worker drives the bridge futures via
//! the kernel's runtime handle. Status, listing, and configuration are
//! immediate.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::audit::AuditCategory;
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::TunnelConnect, handle_connect);
    handler!(router, ctx, SyscallOp::TunnelDisconnect, handle_disconnect);
    handler!(router, ctx, SyscallOp::TunnelStatus, handle_status);
    handler!(router, ctx, SyscallOp::TunnelListRemotes, handle_list_remotes);
    handler!(router, ctx, SyscallOp::TunnelConfig, handle_config);
}

fn handle_connect(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let Some(runtime) = ctx.runtime.get().cloned() else {
        return fail(frame, ErrorKind::Unavailable, "kernel runtime not started");
    };

    ctx.audit.log(
        AuditCategory::Network,
        "TUNNEL_CONNECT",
        frame.agent_id,
        json!({}),
        true,
    );

    let tunnel = Arc::clone(&ctx.tunnel);
    let request_id = ctx.tasks.next_request_id();
    let submitted = ctx
        .tasks
        .submit(frame.agent_id, SyscallOp::TunnelConnect, request_id, move || {
            match runtime.block_on(tunnel.connect()) {
                Ok(()) => json!({"success": true, "connected": true}).to_string(),
                Err(e) => json!({
                    "success": false,
                    "error": e,
                    "error_kind": ErrorKind::IoFailure.as_str(),
                })
                .to_string(),
            }
        });
    if !submitted {
        return fail(frame, ErrorKind::Unavailable, "async pool shutting down");
    }
    reply(frame, json!({"success": true, "submitted": true, "request_id": request_id}))
}

fn handle_disconnect(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let Some(runtime) = ctx.runtime.get().cloned() else {
        return fail(frame, ErrorKind::Unavailable, "kernel runtime not started");
    };

    let tunnel = Arc::clone(&ctx.tunnel);
    let request_id = ctx.tasks.next_request_id();
    let submitted = ctx.tasks.submit(
        frame.agent_id,
        SyscallOp::TunnelDisconnect,
        request_id,
        move || match runtime.block_on(tunnel.disconnect()) {
            Ok(()) => json!({"success": true, "connected": false}).to_string(),
            Err(e) => json!({
                "success": false,
                "error": e,
                "error_kind": ErrorKind::IoFailure.as_str(),
            })
            .to_string(),
        },
    );
    if !submitted {
        return fail(frame, ErrorKind::Unavailable, "async pool shutting down");
    }
    reply(frame, json!({"success": true, "submitted": true, "request_id": request_id}))
}

fn handle_status(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let mut body = json!({"success": true});
    if let Some(fields) = ctx.tunnel.status().as_object() {
        for (key, value) in fields {
            body[key.as_str()] = value.clone();
        }
    }
    reply(frame, body)
}

fn handle_list_remotes(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let remotes: Vec<serde_json::Value> = ctx
        .tunnel
        .list_remote_agents()
        .iter()
        .map(|agent| {
            json!({
                "agent_id": agent.agent_id,
                "name": agent.name,
                "connected_at": agent.connected_at_ms,
            })
        })
        .collect();
    reply(
        frame,
        json!({"success": true, "count": remotes.len(), "remote_agents": remotes}),
    )
}

#[derive(Deserialize)]
struct ConfigRequest {
    #[serde(default)]
    relay_url: Option<String>,
    #[serde(default)]
    machine_id: Option<String>,
    /// Both names accepted on the wire.
    #[serde(default)]
    machine_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    reconnect_interval: Option<u64>,
    #[serde(default)]
    auto_connect: Option<bool>,
}

fn handle_config(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: ConfigRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    ctx.tunnel.set_config(|config| {
        if let Some(url) = request.relay_url {
            config.relay_url = url;
        }
        if let Some(id) = request.machine_id {
            config.machine_id = id;
        }
        if let Some(token) = request.machine_token.or(request.token) {
            config.machine_token = token;
        }
        if let Some(interval) = request.reconnect_interval {
            config.reconnect_interval_secs = interval;
        }
        if let Some(auto) = request.auto_connect {
            config.auto_connect = auto;
        }
    });

    ctx.audit.log(
        AuditCategory::Security,
        "TUNNEL_CONFIG_CHANGED",
        frame.agent_id,
        json!({}),
        true,
    );

    let config = ctx.tunnel.config_snapshot();
    reply(
        frame,
        json!({
            "success": true,
            "config": {
                "relay_url": config.relay_url,
                "machine_id": config.machine_id,
                "auto_connect": config.auto_connect,
                "reconnect_interval": config.reconnect_interval_secs,
            },
        }),
    )
}
