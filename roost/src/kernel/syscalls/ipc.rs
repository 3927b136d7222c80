//! Inter-agent messaging syscalls: REGISTER, SEND, RECV, BROADCAST.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::audit::AuditCategory;
use crate::kernel::events::KernelEventType;
use crate::kernel::mailbox::MailboxError;
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::Register, handle_register);
    handler!(router, ctx, SyscallOp::Send, handle_send);
    handler!(router, ctx, SyscallOp::Recv, handle_recv);
    handler!(router, ctx, SyscallOp::Broadcast, handle_broadcast);
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    name: String,
}

fn handle_register(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: RegisterRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.name.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "name required");
    }

    match ctx.mailboxes.register(frame.agent_id, &request.name) {
        Ok(()) => {
            tracing::info!(agent_id = frame.agent_id, name = %request.name, "agent registered");
            ctx.audit.log(
                AuditCategory::Ipc,
                "REGISTER",
                frame.agent_id,
                json!({"name": &request.name}),
                true,
            );
            reply(
                frame,
                json!({"success": true, "agent_id": frame.agent_id, "name": request.name}),
            )
        }
        Err(e @ MailboxError::NameTaken(_)) => fail(frame, ErrorKind::Conflict, e.to_string()),
        Err(e) => fail(frame, ErrorKind::InvalidRequest, e.to_string()),
    }
}

#[derive(Deserialize)]
struct SendRequest {
    #[serde(default)]
    to: u32,
    #[serde(default)]
    to_name: String,
    #[serde(default)]
    message: Value,
}

fn handle_send(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: SendRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let target_id = if request.to != 0 {
        request.to
    } else if !request.to_name.is_empty() {
        match ctx.mailboxes.resolve(&request.to_name) {
            Some(id) => id,
            None => {
                return fail(
                    frame,
                    ErrorKind::NotFound,
                    format!("target agent not found: {}", request.to_name),
                );
            }
        }
    } else {
        return fail(
            frame,
            ErrorKind::InvalidRequest,
            "target agent required (to or to_name)",
        );
    };

    match ctx.mailboxes.send(frame.agent_id, target_id, request.message) {
        Ok(()) => {
            tracing::debug!(from = frame.agent_id, to = target_id, "message enqueued");
            ctx.events.emit(
                KernelEventType::MessageReceived,
                json!({"from": frame.agent_id, "to": target_id}),
                frame.agent_id,
            );
            ctx.audit.log(
                AuditCategory::Ipc,
                "SEND",
                frame.agent_id,
                json!({"to": target_id}),
                true,
            );
            reply(frame, json!({"success": true, "delivered_to": target_id}))
        }
        Err(e) => fail(frame, ErrorKind::NotFound, e.to_string()),
    }
}

#[derive(Deserialize)]
struct RecvRequest {
    #[serde(default = "default_recv_max")]
    max: usize,
}

fn default_recv_max() -> usize {
    10
}

fn handle_recv(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: RecvRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let entries = ctx.mailboxes.recv(frame.agent_id, request.max);
    let messages: Vec<Value> = entries
        .iter()
        .map(|entry| {
            json!({
                "from": entry.from_id,
                "from_name": entry.from_name,
                "message": entry.body,
                "age_ms": entry.enqueued_at.elapsed().as_millis() as u64,
            })
        })
        .collect();

    reply(
        frame,
        json!({"success": true, "count": messages.len(), "messages": messages}),
    )
}

#[derive(Deserialize)]
struct BroadcastRequest {
    #[serde(default)]
    message: Value,
    #[serde(default)]
    include_self: bool,
}

fn handle_broadcast(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: BroadcastRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let delivered =
        ctx.mailboxes
            .broadcast(frame.agent_id, request.message, request.include_self);
    tracing::debug!(from = frame.agent_id, delivered, "broadcast");
    ctx.events.emit(
        KernelEventType::MessageReceived,
        json!({"from": frame.agent_id, "broadcast": true, "delivered_count": delivered}),
        frame.agent_id,
    );
    ctx.audit.log(
        AuditCategory::Ipc,
        "BROADCAST",
        frame.agent_id,
        json!({"delivered_count": delivered}),
        true,
    );
    reply(frame, json!({"success": true, "delivered_count": delivered}))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{call, harness};
    use roost_protocol::SyscallOp;
    use serde_json::json;

    #[test]
    fn send_to_unregistered_name_fails_then_succeeds() {
        let (ctx, router) = harness();
        ctx.mailboxes.attach(1);
        ctx.mailboxes.attach(2);
        call(&router, 1, SyscallOp::Register, json!({"name": "alice"}));

        // E1: send to "bob" before registration fails with NOT_FOUND.
        let body = call(
            &router,
            1,
            SyscallOp::Send,
            json!({"to_name": "bob", "message": {"n": 1}}),
        );
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "NOT_FOUND");

        let body = call(&router, 2, SyscallOp::Register, json!({"name": "bob"}));
        assert_eq!(body["success"], true);

        for _ in 0..2 {
            let body = call(
                &router,
                1,
                SyscallOp::Send,
                json!({"to_name": "bob", "message": {"n": 1}}),
            );
            assert_eq!(body["success"], true);
            assert_eq!(body["delivered_to"], 2);
        }

        let body = call(&router, 2, SyscallOp::Recv, json!({"max": 10}));
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 2);
        for message in body["messages"].as_array().unwrap() {
            assert_eq!(message["message"]["n"], 1);
            assert_eq!(message["from_name"], "alice");
            assert!(message["age_ms"].as_u64().is_some());
        }
    }

    #[test]
    fn register_conflict_reports_error() {
        let (ctx, router) = harness();
        ctx.mailboxes.attach(1);
        ctx.mailboxes.attach(2);
        call(&router, 1, SyscallOp::Register, json!({"name": "taken"}));
        let body = call(&router, 2, SyscallOp::Register, json!({"name": "taken"}));
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "CONFLICT");
    }

    #[test]
    fn register_requires_name() {
        let (_ctx, router) = harness();
        let body = call(&router, 1, SyscallOp::Register, json!({}));
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "INVALID_REQUEST");
    }

    #[test]
    fn send_by_id_and_recv_fifo() {
        let (ctx, router) = harness();
        ctx.mailboxes.attach(1);
        ctx.mailboxes.attach(2);
        for n in 1..=3 {
            call(
                &router,
                1,
                SyscallOp::Send,
                json!({"to": 2, "message": {"n": n}}),
            );
        }
        let body = call(&router, 2, SyscallOp::Recv, json!({"max": 2}));
        assert_eq!(body["count"], 2);
        assert_eq!(body["messages"][0]["message"]["n"], 1);
        assert_eq!(body["messages"][1]["message"]["n"], 2);

        let body = call(&router, 2, SyscallOp::Recv, json!({}));
        assert_eq!(body["count"], 1);
        assert_eq!(body["messages"][0]["message"]["n"], 3);
    }

    #[test]
    fn send_requires_target() {
        let (_ctx, router) = harness();
        let body = call(&router, 1, SyscallOp::Send, json!({"message": {}}));
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "INVALID_REQUEST");
    }

    #[test]
    fn broadcast_counts_deliveries() {
        let (ctx, router) = harness();
        for id in 1..=3 {
            ctx.mailboxes.attach(id);
        }
        let body = call(
            &router,
            1,
            SyscallOp::Broadcast,
            json!({"message": {"note": "hi"}}),
        );
        assert_eq!(body["success"], true);
        assert_eq!(body["delivered_count"], 2);

        let body = call(&router, 3, SyscallOp::Recv, json!({}));
        assert_eq!(body["count"], 1);
        assert_eq!(body["messages"][0]["message"]["note"], "hi");
    }

    #[test]
    fn send_emits_message_received_event() {
        let (ctx, router) = harness();
        ctx.mailboxes.attach(1);
        ctx.mailboxes.attach(2);
        call(
            &router,
            2,
            SyscallOp::Subscribe,
            json!({"event_types": ["MESSAGE_RECEIVED"]}),
        );
        call(&router, 1, SyscallOp::Send, json!({"to": 2, "message": {}}));

        let body = call(&router, 2, SyscallOp::PollEvents, json!({}));
        assert_eq!(body["count"], 1);
        assert_eq!(body["events"][0]["type"], "MESSAGE_RECEIVED");
        assert_eq!(body["events"][0]["data"]["to"], 2);
    }
}
