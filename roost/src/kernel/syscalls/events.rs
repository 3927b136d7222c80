//! Event bus syscalls: SUBSCRIBE, UNSUBSCRIBE, POLL_EVENTS, EMIT, plus
//! ASYNC_POLL for drained worker results.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::events::KernelEventType;
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::Subscribe, handle_subscribe);
    handler!(router, ctx, SyscallOp::Unsubscribe, handle_unsubscribe);
    handler!(router, ctx, SyscallOp::PollEvents, handle_poll_events);
    handler!(router, ctx, SyscallOp::Emit, handle_emit);
    handler!(router, ctx, SyscallOp::AsyncPoll, handle_async_poll);
}

#[derive(Deserialize)]
struct SubscriptionRequest {
    #[serde(default)]
    event_types: Vec<String>,
    /// Accepted aliases for the event list.
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    all: bool,
}

impl SubscriptionRequest {
    fn names(&self) -> Vec<String> {
        if !self.event_types.is_empty() {
            self.event_types.clone()
        } else if !self.events.is_empty() {
            self.events.clone()
        } else {
            self.event.iter().cloned().collect()
        }
    }
}

fn handle_subscribe(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: SubscriptionRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let names = request.names();
    if names.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "no events specified");
    }

    let types: Vec<KernelEventType> = names.iter().map(|n| KernelEventType::parse(n)).collect();
    ctx.events.subscribe(frame.agent_id, &types);
    tracing::debug!(agent_id = frame.agent_id, count = types.len(), "subscribed");

    reply(frame, json!({"success": true, "subscribed": names}))
}

fn handle_unsubscribe(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: SubscriptionRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let types: Vec<KernelEventType> = request
        .names()
        .iter()
        .map(|n| KernelEventType::parse(n))
        .collect();
    ctx.events.unsubscribe(frame.agent_id, &types, request.all);
    reply(frame, json!({"success": true}))
}

#[derive(Deserialize)]
struct PollRequest {
    #[serde(default = "default_poll_max")]
    max: usize,
}

fn default_poll_max() -> usize {
    100
}

fn handle_poll_events(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: PollRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let events: Vec<Value> = ctx
        .events
        .poll(frame.agent_id, request.max)
        .iter()
        .map(|event| {
            json!({
                "type": event.event_type.as_str(),
                "data": event.data,
                "source_agent_id": event.source_agent_id,
                "timestamp": event.timestamp_ms,
            })
        })
        .collect();

    reply(
        frame,
        json!({"success": true, "count": events.len(), "events": events}),
    )
}

#[derive(Deserialize)]
struct EmitRequest {
    #[serde(default = "default_emit_event")]
    event: String,
    #[serde(default)]
    data: Value,
}

fn default_emit_event() -> String {
    "CUSTOM".to_string()
}

/// Agent-emitted events are always CUSTOM; a non-CUSTOM name is preserved
/// in the data under `custom_type`.
fn handle_emit(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: EmitRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let mut data = request.data;
    if request.event != "CUSTOM" {
        if !data.is_object() {
            data = json!({"value": data});
        }
        data["custom_type"] = json!(&request.event);
    }
    ctx.events
        .emit(KernelEventType::Custom, data, frame.agent_id);
    tracing::debug!(agent_id = frame.agent_id, event = %request.event, "event emitted");

    reply(frame, json!({"success": true, "event": request.event}))
}

#[derive(Deserialize)]
struct AsyncPollRequest {
    #[serde(default = "default_async_max")]
    max: usize,
}

fn default_async_max() -> usize {
    10
}

fn handle_async_poll(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: AsyncPollRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let results: Vec<Value> = ctx
        .tasks
        .poll(frame.agent_id, request.max)
        .iter()
        .map(|result| {
            json!({
                "request_id": result.request_id,
                "opcode": result.opcode as u8,
                "opcode_name": result.opcode.name(),
                "payload": result.payload,
            })
        })
        .collect();

    reply(
        frame,
        json!({"success": true, "count": results.len(), "results": results}),
    )
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{call, harness};
    use roost_protocol::SyscallOp;
    use serde_json::json;

    #[test]
    fn subscribe_and_poll_custom_events() {
        let (_ctx, router) = harness();
        call(
            &router,
            1,
            SyscallOp::Subscribe,
            json!({"event_types": ["CUSTOM"]}),
        );
        call(
            &router,
            2,
            SyscallOp::Emit,
            json!({"event": "deploy_done", "data": {"version": "1.2"}}),
        );

        let body = call(&router, 1, SyscallOp::PollEvents, json!({"max": 10}));
        assert_eq!(body["count"], 1);
        let event = &body["events"][0];
        assert_eq!(event["type"], "CUSTOM");
        assert_eq!(event["data"]["custom_type"], "deploy_done");
        assert_eq!(event["data"]["version"], "1.2");
        assert_eq!(event["source_agent_id"], 2);
        assert!(event["timestamp"].as_i64().is_some());

        // Drained.
        let body = call(&router, 1, SyscallOp::PollEvents, json!({}));
        assert_eq!(body["count"], 0);
    }

    #[test]
    fn subscribe_accepts_single_event_alias() {
        let (_ctx, router) = harness();
        let body = call(&router, 1, SyscallOp::Subscribe, json!({"event": "CUSTOM"}));
        assert_eq!(body["success"], true);
        assert_eq!(body["subscribed"], json!(["CUSTOM"]));
    }

    #[test]
    fn subscribe_without_events_is_invalid() {
        let (_ctx, router) = harness();
        let body = call(&router, 1, SyscallOp::Subscribe, json!({}));
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "INVALID_REQUEST");
    }

    #[test]
    fn unknown_event_names_degrade_to_custom() {
        let (_ctx, router) = harness();
        call(
            &router,
            1,
            SyscallOp::Subscribe,
            json!({"event_types": ["TOTALLY_MADE_UP"]}),
        );
        // The made-up name subscribed the agent to CUSTOM.
        call(&router, 2, SyscallOp::Emit, json!({"data": {"x": 1}}));
        let body = call(&router, 1, SyscallOp::PollEvents, json!({}));
        assert_eq!(body["count"], 1);
    }

    #[test]
    fn unsubscribe_all_stops_delivery() {
        let (_ctx, router) = harness();
        call(
            &router,
            1,
            SyscallOp::Subscribe,
            json!({"event_types": ["CUSTOM"]}),
        );
        call(&router, 1, SyscallOp::Unsubscribe, json!({"all": true}));
        call(&router, 2, SyscallOp::Emit, json!({"data": {}}));
        let body = call(&router, 1, SyscallOp::PollEvents, json!({}));
        assert_eq!(body["count"], 0);
    }

    #[test]
    fn async_poll_returns_empty_when_no_results() {
        let (_ctx, router) = harness();
        let body = call(&router, 1, SyscallOp::AsyncPoll, json!({}));
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 0);
    }
}
