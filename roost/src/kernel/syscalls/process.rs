//! Agent lifecycle and command syscalls: SPAWN, KILL, LIST, PAUSE,
//! RESUME, EXEC.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::audit::AuditCategory;
use crate::kernel::events::KernelEventType;
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;
use crate::supervisor::{AgentSelector, AgentSpec, SupervisorError};

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::Spawn, handle_spawn);
    handler!(router, ctx, SyscallOp::Kill, handle_kill);
    handler!(router, ctx, SyscallOp::List, handle_list);
    handler!(router, ctx, SyscallOp::Pause, handle_pause);
    handler!(router, ctx, SyscallOp::Resume, handle_resume);
    handler!(router, ctx, SyscallOp::Exec, handle_exec);
}

fn handle_spawn(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let spec: AgentSpec = match parse(frame) {
        Ok(s) => s,
        Err(response) => return response,
    };

    let perms = ctx.permissions.get_or_create(frame.agent_id);
    if !perms.can_spawn {
        tracing::warn!(agent_id = frame.agent_id, "spawn denied");
        ctx.events.emit(
            KernelEventType::SyscallBlocked,
            json!({"opcode": "SPAWN", "agent_id": frame.agent_id}),
            frame.agent_id,
        );
        ctx.audit.log(
            AuditCategory::Security,
            "SPAWN_DENIED",
            frame.agent_id,
            json!({"name": &spec.name}),
            false,
        );
        return fail(frame, ErrorKind::PermissionDenied, "spawn not allowed");
    }

    let name = spec.name.clone();
    match ctx.supervisor.spawn(spec) {
        Ok(agent_id) => {
            ctx.mailboxes.attach(agent_id);
            ctx.audit.log(
                AuditCategory::Lifecycle,
                "SPAWN",
                frame.agent_id,
                json!({"spawned_id": agent_id, "name": &name}),
                true,
            );
            reply(frame, json!({"success": true, "agent_id": agent_id, "name": name}))
        }
        Err(e @ SupervisorError::Exists(_)) => fail(frame, ErrorKind::Conflict, e.to_string()),
        Err(e) => fail(frame, ErrorKind::IoFailure, e.to_string()),
    }
}

#[derive(Deserialize)]
struct SelectorRequest {
    #[serde(default)]
    agent_id: Option<u32>,
    #[serde(default)]
    name: Option<String>,
}

impl SelectorRequest {
    fn selector(&self) -> Option<AgentSelector> {
        match (&self.agent_id, &self.name) {
            (Some(id), _) => Some(AgentSelector::Id(*id)),
            (None, Some(name)) if !name.is_empty() => Some(AgentSelector::Name(name.clone())),
            _ => None,
        }
    }
}

fn supervisor_failure(frame: &Frame, error: SupervisorError) -> Frame {
    match &error {
        SupervisorError::NotFound(_) => fail(frame, ErrorKind::NotFound, error.to_string()),
        SupervisorError::Exists(_) => fail(frame, ErrorKind::Conflict, error.to_string()),
        SupervisorError::WrongState { .. } => {
            fail(frame, ErrorKind::Conflict, error.to_string())
        }
        SupervisorError::Launch(_) => fail(frame, ErrorKind::IoFailure, error.to_string()),
    }
}

fn handle_kill(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: SelectorRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let Some(selector) = request.selector() else {
        return fail(frame, ErrorKind::InvalidRequest, "agent_id or name required");
    };

    match ctx.supervisor.kill(&selector) {
        Ok(agent_id) => {
            ctx.audit.log(
                AuditCategory::Lifecycle,
                "KILL",
                frame.agent_id,
                json!({"killed_id": agent_id}),
                true,
            );
            reply(frame, json!({"success": true, "agent_id": agent_id}))
        }
        Err(e) => supervisor_failure(frame, e),
    }
}

fn handle_list(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let agents = ctx.supervisor.list();
    reply(
        frame,
        json!({"success": true, "count": agents.len(), "agents": agents}),
    )
}

fn handle_pause(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: SelectorRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let Some(selector) = request.selector() else {
        return fail(frame, ErrorKind::InvalidRequest, "agent_id or name required");
    };
    match ctx.supervisor.pause(&selector) {
        Ok(agent_id) => reply(frame, json!({"success": true, "agent_id": agent_id})),
        Err(e) => supervisor_failure(frame, e),
    }
}

fn handle_resume(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: SelectorRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let Some(selector) = request.selector() else {
        return fail(frame, ErrorKind::InvalidRequest, "agent_id or name required");
    };
    match ctx.supervisor.resume(&selector) {
        Ok(agent_id) => reply(frame, json!({"success": true, "agent_id": agent_id})),
        Err(e) => supervisor_failure(frame, e),
    }
}

#[derive(Deserialize, Clone)]
struct ExecRequest {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: std::collections::HashMap<String, String>,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

fn handle_exec(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: ExecRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.command.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "command required");
    }

    let perms = ctx.permissions.get_or_create(frame.agent_id);
    if !perms.can_exec {
        tracing::warn!(agent_id = frame.agent_id, "exec denied");
        ctx.events.emit(
            KernelEventType::SyscallBlocked,
            json!({"opcode": "EXEC", "agent_id": frame.agent_id}),
            frame.agent_id,
        );
        ctx.audit.log(
            AuditCategory::Security,
            "EXEC_DENIED",
            frame.agent_id,
            json!({"command": &request.command}),
            false,
        );
        return fail(frame, ErrorKind::PermissionDenied, "exec not allowed");
    }

    ctx.audit.log(
        AuditCategory::Lifecycle,
        "EXEC",
        frame.agent_id,
        json!({"command": &request.command}),
        true,
    );

    let timeout = Duration::from_secs(
        request
            .timeout_secs
            .unwrap_or(ctx.config.limits.exec_timeout_secs),
    );
    let output_cap = ctx.config.limits.max_exec_output_bytes;
    let request_id = ctx.tasks.next_request_id();
    let submitted = ctx.tasks.submit(frame.agent_id, SyscallOp::Exec, request_id, move || {
        run_command(&request, timeout, output_cap).to_string()
    });
    if !submitted {
        return fail(frame, ErrorKind::Unavailable, "async pool shutting down");
    }
    reply(frame, json!({"success": true, "submitted": true, "request_id": request_id}))
}

/// Runs on an async-pool worker. Empty `args` means shell mode; otherwise
/// the command is executed directly with its arguments.
fn run_command(request: &ExecRequest, timeout: Duration, output_cap: usize) -> Value {
    let mut command = if request.args.is_empty() {
        let mut c = std::process::Command::new("/bin/sh");
        c.arg("-c").arg(&request.command);
        c
    } else {
        let mut c = std::process::Command::new(&request.command);
        c.args(&request.args);
        c
    };
    command
        .envs(&request.env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    if let Some(workdir) = &request.workdir {
        command.current_dir(workdir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return json!({
                "success": false,
                "error": format!("failed to execute command: {e}"),
                "error_kind": ErrorKind::IoFailure.as_str(),
            });
        }
    };

    // Drain pipes on their own threads so a chatty child cannot deadlock
    // against a full pipe buffer while we wait on it.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_capped(stdout, output_cap));
    let stderr_reader = std::thread::spawn(move || read_capped(stderr, output_cap));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                let _ = child.kill();
                return json!({
                    "success": false,
                    "error": format!("failed to wait on command: {e}"),
                    "error_kind": ErrorKind::IoFailure.as_str(),
                });
            }
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    match status {
        Some(status) => {
            let exit_code = status.code().unwrap_or(-1);
            json!({
                "success": exit_code == 0,
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            })
        }
        None => json!({
            "success": false,
            "error": format!("command timed out after {}s", timeout.as_secs()),
            "error_kind": ErrorKind::Timeout.as_str(),
            "stdout": stdout,
            "stderr": stderr,
        }),
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes.
fn read_capped(pipe: Option<impl Read>, cap: usize) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if kept.len() < cap {
                    let take = n.min(cap - kept.len());
                    kept.extend_from_slice(&buf[..take]);
                }
            }
        }
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if kept.len() >= cap {
        text.push_str("\n... (truncated)");
    }
    text
}
