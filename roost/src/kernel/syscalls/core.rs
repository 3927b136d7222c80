//! Core syscalls: NOOP, HELLO, EXIT, THINK.

use std::sync::Arc;

use serde_json::{json, Value};

use roost_protocol::{Frame, SyscallOp, PROTOCOL_VERSION};

use super::{handler, reply, ErrorKind};
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::Noop, handle_noop);
    handler!(router, ctx, SyscallOp::Hello, handle_hello);
    handler!(router, ctx, SyscallOp::Exit, handle_exit);
    handler!(router, ctx, SyscallOp::Think, handle_think);
}

fn handle_noop(_ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let echo: Value = serde_json::from_slice(&frame.payload).unwrap_or(Value::Null);
    reply(frame, json!({"success": true, "echo": echo}))
}

fn handle_hello(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    reply(
        frame,
        json!({
            "success": true,
            "agent_id": frame.agent_id,
            "kernel_version": env!("CARGO_PKG_VERSION"),
            "protocol_version": PROTOCOL_VERSION,
            "opcode_count": SyscallOp::ALL.len(),
            "uptime_secs": ctx.started_at.elapsed().as_secs(),
        }),
    )
}

fn handle_exit(_ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    // The reactor closes the connection after writing this response.
    reply(frame, json!({"success": true}))
}

/// LLM calls are delegated to an external service; the kernel only
/// reports the request as unavailable.
fn handle_think(_ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    tracing::warn!(agent_id = frame.agent_id, "THINK requested but kernel LLM is disabled");
    reply(
        frame,
        json!({
            "success": false,
            "error": "LLM calls are handled outside the kernel; use an external LLM service",
            "error_kind": ErrorKind::Unavailable.as_str(),
            "content": "",
            "tokens": 0,
        }),
    )
}
