//! Syscall handlers, one module per subsystem.
//!
//! Every handler is synchronous with respect to the router, parses its
//! JSON request into a typed struct, and answers with a JSON body carrying
//! `success: bool` (plus `error` and `error_kind` on failure). Blocking
//! work is submitted to the async task manager.

mod core;
mod events;
mod fs;
mod http;
mod ipc;
mod metrics;
mod perms;
mod process;
mod replay;
mod state;
mod tunnel;
mod worlds;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use roost_protocol::Frame;

use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;

/// Error kinds surfaced to clients alongside the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    PermissionDenied,
    NotFound,
    Conflict,
    Unavailable,
    IoFailure,
    ChaosFailure,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::IoFailure => "IO_FAILURE",
            ErrorKind::ChaosFailure => "CHAOS_FAILURE",
            ErrorKind::Timeout => "TIMEOUT",
        }
    }
}

/// Build a response frame with the same opcode and agent id.
pub(crate) fn reply(frame: &Frame, body: Value) -> Frame {
    Frame::json(frame.agent_id, frame.opcode, &body)
}

/// Build a failure response.
pub(crate) fn fail(frame: &Frame, kind: ErrorKind, error: impl Into<String>) -> Frame {
    reply(
        frame,
        json!({
            "success": false,
            "error": error.into(),
            "error_kind": kind.as_str(),
        }),
    )
}

/// Parse the request payload into a typed struct. An empty payload parses
/// as `{}` so optional-field requests can omit the body entirely.
pub(crate) fn parse<T: DeserializeOwned>(frame: &Frame) -> Result<T, Frame> {
    let payload: &[u8] = if frame.payload.is_empty() {
        b"{}"
    } else {
        &frame.payload
    };
    serde_json::from_slice(payload).map_err(|e| {
        fail(
            frame,
            ErrorKind::InvalidRequest,
            format!("invalid request: {e}"),
        )
    })
}

/// Register every subsystem's handlers. Called once at kernel assembly.
pub fn register_all(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    self::core::register(router, ctx);
    ipc::register(router, ctx);
    state::register(router, ctx);
    events::register(router, ctx);
    perms::register(router, ctx);
    fs::register(router, ctx);
    http::register(router, ctx);
    process::register(router, ctx);
    metrics::register(router, ctx);
    replay::register(router, ctx);
    worlds::register(router, ctx);
    tunnel::register(router, ctx);
}

/// Register one handler closure over the shared context.
macro_rules! handler {
    ($router:expr, $ctx:expr, $op:expr, $func:path) => {{
        let ctx = std::sync::Arc::clone($ctx);
        $router.register($op, Box::new(move |frame| $func(&ctx, frame)));
    }};
}
pub(crate) use handler;
