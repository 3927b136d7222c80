//! HTTP syscall.
//!
//! The world is consulted first: chaos may fail the request outright, and
//! the network mock may answer it without touching the real network. Both
//! the mocked answer (which may carry simulated latency) and real
//! passthrough run on the async pool; the handler always returns a
//! request id immediately.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::audit::AuditCategory;
use crate::kernel::events::KernelEventType;
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::Http, handle_http);
}

#[derive(Deserialize, Clone)]
struct HttpRequest {
    #[serde(default)]
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn handle_http(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: HttpRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.url.is_empty() {
        return fail(frame, ErrorKind::InvalidRequest, "url required");
    }

    // World consultation happens synchronously, before any I/O.
    if let Some(world) = ctx.worlds.world_of(frame.agent_id) {
        world.record_syscall();

        if world.chaos().should_fail_network(&request.url) {
            tracing::debug!(url = %request.url, world = world.id(), "chaos network failure");
            return reply(
                frame,
                json!({
                    "success": false,
                    "error": "Simulated network failure (chaos)",
                    "error_kind": ErrorKind::ChaosFailure.as_str(),
                    "world": world.id(),
                }),
            );
        }

        if let Some(mock) = world.network().get_response(&request.url, &request.method) {
            let chaos_latency = world.chaos().latency_ms();
            let world_id = world.id().to_string();
            let request_id = ctx.tasks.next_request_id();
            let submitted = ctx.tasks.submit(frame.agent_id, SyscallOp::Http, request_id, move || {
                let delay = mock.latency_ms + chaos_latency;
                if delay > 0 {
                    std::thread::sleep(Duration::from_millis(delay));
                }
                json!({
                    "success": true,
                    "status": mock.status,
                    "body": mock.body,
                    "headers": mock.headers,
                    "mocked": true,
                    "world": world_id,
                })
                .to_string()
            });
            if !submitted {
                return fail(frame, ErrorKind::Unavailable, "async pool shutting down");
            }
            return reply(frame, json!({"success": true, "submitted": true, "request_id": request_id}));
        }
    }

    // Passthrough to the real network, gated by can_network.
    let perms = ctx.permissions.get_or_create(frame.agent_id);
    if !perms.can_network {
        tracing::warn!(agent_id = frame.agent_id, url = %request.url, "http denied");
        ctx.events.emit(
            KernelEventType::SyscallBlocked,
            json!({"opcode": "HTTP", "agent_id": frame.agent_id, "url": &request.url}),
            frame.agent_id,
        );
        ctx.audit.log(
            AuditCategory::Security,
            "HTTP_DENIED",
            frame.agent_id,
            json!({"url": &request.url}),
            false,
        );
        return fail(frame, ErrorKind::PermissionDenied, "network access not allowed");
    }

    ctx.audit.log(
        AuditCategory::Network,
        "HTTP",
        frame.agent_id,
        json!({"url": &request.url, "method": &request.method}),
        true,
    );

    // In record mode, real responses are captured into the world's mock
    // store for later replay.
    let recorder = ctx
        .worlds
        .world_of(frame.agent_id)
        .filter(|world| world.network().mode() == "record");

    let timeout = Duration::from_secs(ctx.config.limits.http_timeout_secs);
    let request_id = ctx.tasks.next_request_id();
    let submitted = ctx.tasks.submit(frame.agent_id, SyscallOp::Http, request_id, move || {
        let response = perform_request(&request, timeout);
        if let Some(world) = recorder {
            let status = response.get("status").and_then(|s| s.as_u64()).unwrap_or(0) as u16;
            let body = response.get("body").and_then(|b| b.as_str()).unwrap_or("");
            world.network().record(&request.url, &request.method, status, body);
        }
        response.to_string()
    });
    if !submitted {
        return fail(frame, ErrorKind::Unavailable, "async pool shutting down");
    }
    reply(frame, json!({"success": true, "submitted": true, "request_id": request_id}))
}

/// Runs on an async-pool worker; blocking is fine here.
fn perform_request(request: &HttpRequest, timeout: Duration) -> Value {
    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            return json!({
                "success": false,
                "error": format!("http client error: {e}"),
                "error_kind": ErrorKind::IoFailure.as_str(),
            });
        }
    };

    let method = match request.method.to_uppercase().parse::<reqwest::Method>() {
        Ok(method) => method,
        Err(_) => {
            return json!({
                "success": false,
                "error": format!("invalid method: {}", request.method),
                "error_kind": ErrorKind::InvalidRequest.as_str(),
            });
        }
    };

    let mut builder = client.request(method, &request.url);
    for (key, value) in &request.headers {
        builder = builder.header(key, value);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    match builder.send() {
        Ok(response) => {
            let status = response.status().as_u16();
            let headers: std::collections::HashMap<String, String> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let body = response.text().unwrap_or_default();
            json!({
                "success": true,
                "status": status,
                "headers": headers,
                "body": body,
            })
        }
        Err(e) => {
            let kind = if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                ErrorKind::IoFailure
            };
            json!({
                "success": false,
                "error": format!("http request failed: {e}"),
                "error_kind": kind.as_str(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{call, harness};
    use roost_protocol::SyscallOp;
    use serde_json::json;
    use std::time::Duration;

    fn poll_result(
        router: &crate::kernel::router::SyscallRouter,
        agent_id: u32,
        request_id: u64,
    ) -> serde_json::Value {
        for _ in 0..200 {
            let body = call(router, agent_id, SyscallOp::AsyncPoll, json!({"max": 10}));
            for result in body["results"].as_array().unwrap() {
                if result["request_id"] == request_id {
                    let payload: serde_json::Value =
                        serde_json::from_str(result["payload"].as_str().unwrap()).unwrap();
                    return payload;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("async result not produced within 2s");
    }

    #[test]
    fn mocked_response_arrives_via_async_poll() {
        let (ctx, router) = harness();
        let world = ctx.worlds.create_world(
            "net",
            &json!({
                "network": {
                    "mode": "mock",
                    "mock_responses": {
                        "https://api.example.com/data": {"status": 200, "body": "{\"ok\":true}"},
                    },
                },
            }),
        );
        ctx.worlds.join_world(1, &world).unwrap();

        let body = call(
            &router,
            1,
            SyscallOp::Http,
            json!({"url": "https://api.example.com/data"}),
        );
        assert_eq!(body["success"], true);
        assert_eq!(body["submitted"], true);
        let request_id = body["request_id"].as_u64().unwrap();

        let payload = poll_result(&router, 1, request_id);
        assert_eq!(payload["success"], true);
        assert_eq!(payload["status"], 200);
        assert_eq!(payload["body"], "{\"ok\":true}");
        assert_eq!(payload["mocked"], true);
    }

    #[test]
    fn chaos_network_partition_fails_synchronously() {
        let (ctx, router) = harness();
        let world = ctx.worlds.create_world(
            "net",
            &json!({"network": {"mode": "mock"}, "chaos": {"enabled": true}}),
        );
        ctx.worlds.join_world(1, &world).unwrap();
        ctx.worlds
            .inject_event(&world, "network_partition", json!({}))
            .unwrap();

        let body = call(
            &router,
            1,
            SyscallOp::Http,
            json!({"url": "https://api.example.com"}),
        );
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "CHAOS_FAILURE");
    }

    #[test]
    fn fail_unmatched_mock_returns_503() {
        let (ctx, router) = harness();
        let world = ctx.worlds.create_world(
            "net",
            &json!({"network": {"mode": "mock", "fail_unmatched": true}}),
        );
        ctx.worlds.join_world(1, &world).unwrap();

        let body = call(
            &router,
            1,
            SyscallOp::Http,
            json!({"url": "https://unmocked.example.com"}),
        );
        let request_id = body["request_id"].as_u64().unwrap();
        let payload = poll_result(&router, 1, request_id);
        assert_eq!(payload["status"], 503);
    }

    #[test]
    fn passthrough_requires_network_permission() {
        let (ctx, router) = harness();
        ctx.permissions
            .set_level(1, crate::kernel::permissions::PermissionLevel::Sandboxed);
        let body = call(
            &router,
            1,
            SyscallOp::Http,
            json!({"url": "https://example.com"}),
        );
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "PERMISSION_DENIED");
    }

    #[test]
    fn url_is_required() {
        let (_ctx, router) = harness();
        let body = call(&router, 1, SyscallOp::Http, json!({}));
        assert_eq!(body["error_kind"], "INVALID_REQUEST");
    }
}
