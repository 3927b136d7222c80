//! Recording, audit-log, and replay syscalls: RECORD_START/STOP/STATUS,
//! REPLAY_START/STATUS, GET_AUDIT_LOG, SET_AUDIT_CONFIG.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::audit::AuditCategory;
use crate::kernel::replay::{skip_on_replay, RecordingState};
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::RecordStart, handle_record_start);
    handler!(router, ctx, SyscallOp::RecordStop, handle_record_stop);
    handler!(router, ctx, SyscallOp::RecordStatus, handle_record_status);
    handler!(router, ctx, SyscallOp::ReplayStart, handle_replay_start);
    handler!(router, ctx, SyscallOp::ReplayStatus, handle_replay_status);
    handler!(router, ctx, SyscallOp::GetAuditLog, handle_get_audit_log);
    handler!(router, ctx, SyscallOp::SetAuditConfig, handle_set_audit_config);
}

#[derive(Deserialize)]
struct RecordStartRequest {
    #[serde(default)]
    include_think: Option<bool>,
    #[serde(default)]
    include_http: Option<bool>,
    #[serde(default)]
    include_exec: Option<bool>,
    #[serde(default)]
    max_entries: Option<usize>,
    #[serde(default)]
    filter_agents: Option<Vec<u32>>,
}

fn handle_record_start(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: RecordStartRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let mut config = ctx.execution.config();
    if let Some(v) = request.include_think {
        config.include_think = v;
    }
    if let Some(v) = request.include_http {
        config.include_http = v;
    }
    if let Some(v) = request.include_exec {
        config.include_exec = v;
    }
    if let Some(v) = request.max_entries {
        config.max_entries = v;
    }
    if let Some(v) = request.filter_agents {
        config.filter_agents = v;
    }
    ctx.execution.set_config(config);

    let started = ctx.execution.start_recording();
    if started {
        ctx.audit.log(
            AuditCategory::Syscall,
            "RECORDING_STARTED",
            frame.agent_id,
            json!({}),
            true,
        );
    }
    reply(frame, json!({"success": started, "recording": started}))
}

fn handle_record_stop(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let stopped = ctx.execution.stop_recording();
    if stopped {
        ctx.audit.log(
            AuditCategory::Syscall,
            "RECORDING_STOPPED",
            frame.agent_id,
            json!({"entries_recorded": ctx.execution.entry_count()}),
            true,
        );
    }
    reply(
        frame,
        json!({
            "success": stopped,
            "recording": false,
            "entries_recorded": ctx.execution.entry_count(),
        }),
    )
}

#[derive(Deserialize)]
struct RecordStatusRequest {
    #[serde(default)]
    export: bool,
    #[serde(default)]
    get_entries: bool,
    #[serde(default)]
    since_id: u64,
    #[serde(default = "default_entry_limit")]
    limit: usize,
}

fn default_entry_limit() -> usize {
    100
}

fn handle_record_status(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: RecordStatusRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let state = ctx.execution.recording_state();
    let mut body = json!({
        "success": true,
        "recording": state == RecordingState::Recording,
        "paused": state == RecordingState::Paused,
        "entry_count": ctx.execution.entry_count(),
        "last_sequence_id": ctx.execution.last_seq_id(),
    });

    if request.export {
        body["recording_data"] = ctx.execution.export_recording();
    }
    if request.get_entries {
        let entries: Vec<Value> = ctx
            .execution
            .entries_page(request.since_id, request.limit)
            .iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect();
        body["entries"] = json!(entries);
    }

    reply(frame, body)
}

#[derive(Deserialize)]
struct ReplayStartRequest {
    #[serde(default)]
    recording_data: Option<Value>,
}

fn handle_replay_start(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: ReplayStartRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    if let Some(data) = request.recording_data {
        if !ctx.execution.import_recording(&data) {
            return fail(
                frame,
                ErrorKind::InvalidRequest,
                "failed to import recording data",
            );
        }
    }

    let entries = match ctx.execution.begin_replay() {
        Ok(entries) => entries,
        Err(e) => return fail(frame, ErrorKind::InvalidRequest, e),
    };
    let total_entries = entries.len();

    ctx.audit.log(
        AuditCategory::Syscall,
        "REPLAY_STARTED",
        frame.agent_id,
        json!({"total_entries": total_entries}),
        true,
    );

    // Replay runs on a pool worker, re-dispatching each entry through the
    // live router. Control opcodes are skipped, not re-executed.
    let replay_ctx = Arc::clone(ctx);
    let request_id = ctx.tasks.next_request_id();
    let submitted = ctx
        .tasks
        .submit(frame.agent_id, SyscallOp::ReplayStart, request_id, move || {
            // Entered so replayed handlers that touch tokio (process spawn)
            // find a runtime from this pool thread.
            let _guard = replay_ctx.runtime.get().map(|handle| handle.enter());
            let Some(dispatcher) = replay_ctx.dispatcher() else {
                replay_ctx.execution.fail_replay("kernel dispatcher unavailable");
                return json!({"success": false, "error": "kernel dispatcher unavailable"})
                    .to_string();
            };
            for entry in entries {
                let replayable = roost_protocol::SyscallOp::try_from(entry.opcode)
                    .ok()
                    .filter(|op| !skip_on_replay(*op));
                match replayable {
                    Some(op) => {
                        let replay_frame = roost_protocol::Frame::new(
                            entry.agent_id,
                            op,
                            entry.payload.into_bytes(),
                        );
                        dispatcher(&replay_frame);
                        replay_ctx.execution.replay_step(true);
                    }
                    None => replay_ctx.execution.replay_step(false),
                }
            }
            replay_ctx.execution.finish_replay();
            let progress = replay_ctx.execution.replay_progress();
            json!({
                "success": true,
                "replay_complete": true,
                "entries_replayed": progress.entries_replayed,
                "entries_skipped": progress.entries_skipped,
            })
            .to_string()
        });
    if !submitted {
        ctx.execution.fail_replay("async pool shutting down");
        return fail(frame, ErrorKind::Unavailable, "async pool shutting down");
    }

    reply(
        frame,
        json!({"success": true, "total_entries": total_entries, "request_id": request_id}),
    )
}

fn handle_replay_status(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let progress = ctx.execution.replay_progress();
    let percent = if progress.total_entries > 0 {
        (100 * progress.current_entry / progress.total_entries) as i64
    } else {
        0
    };

    let mut body = json!({
        "success": true,
        "state": progress.state.as_str(),
        "total_entries": progress.total_entries,
        "current_entry": progress.current_entry,
        "entries_replayed": progress.entries_replayed,
        "entries_skipped": progress.entries_skipped,
        "progress_percent": percent,
    });
    if !progress.last_error.is_empty() {
        body["last_error"] = json!(progress.last_error);
    }
    reply(frame, body)
}

#[derive(Deserialize)]
struct AuditLogRequest {
    #[serde(default)]
    category: String,
    #[serde(default)]
    agent_id: u32,
    #[serde(default)]
    since_id: u64,
    #[serde(default = "default_entry_limit")]
    limit: usize,
}

fn handle_get_audit_log(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: AuditLogRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let category = if request.category.is_empty() {
        None
    } else {
        AuditCategory::parse(&request.category)
    };
    let agent_filter = (request.agent_id > 0).then_some(request.agent_id);

    let entries: Vec<Value> = ctx
        .audit
        .entries(category, agent_filter, request.since_id, request.limit)
        .iter()
        .map(|e| e.to_json())
        .collect();

    reply(
        frame,
        json!({"success": true, "count": entries.len(), "entries": entries}),
    )
}

fn handle_set_audit_config(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: Value = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let mut config = ctx.audit.config();
    let flags: [(&str, &mut bool); 8] = [
        ("log_syscalls", &mut config.log_syscalls),
        ("log_security", &mut config.log_security),
        ("log_lifecycle", &mut config.log_lifecycle),
        ("log_ipc", &mut config.log_ipc),
        ("log_state", &mut config.log_state),
        ("log_resource", &mut config.log_resource),
        ("log_network", &mut config.log_network),
        ("log_world", &mut config.log_world),
    ];
    for (key, slot) in flags {
        if let Some(v) = request.get(key).and_then(|v| v.as_bool()) {
            *slot = v;
        }
    }
    if let Some(max) = request.get("max_entries").and_then(|v| v.as_u64()) {
        config.max_entries = max as usize;
    }

    ctx.audit.set_config(config.clone());
    ctx.audit.log(
        AuditCategory::Security,
        "AUDIT_CONFIG_CHANGED",
        frame.agent_id,
        json!({"changed_by": frame.agent_id, "new_config": request}),
        true,
    );

    reply(
        frame,
        json!({
            "success": true,
            "config": serde_json::to_value(&config).unwrap_or(Value::Null),
        }),
    )
}
