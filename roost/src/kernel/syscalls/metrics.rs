//! Metrics syscalls: METRICS_SYSTEM, METRICS_AGENT, METRICS_ALL_AGENTS,
//! METRICS_CGROUP.
//!
//! These report what the kernel itself owns: agent lifecycle state, store
//! and world sizes, and uptime. OS counters (/proc, cgroups) come from
//! external collectors and are not read here; METRICS_CGROUP says so.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use roost_protocol::{Frame, SyscallOp};

use super::{fail, handler, parse, reply, ErrorKind};
use crate::kernel::router::SyscallRouter;
use crate::kernel::KernelContext;
use crate::supervisor::AgentSelector;

pub fn register(router: &mut SyscallRouter, ctx: &Arc<KernelContext>) {
    handler!(router, ctx, SyscallOp::MetricsSystem, handle_system);
    handler!(router, ctx, SyscallOp::MetricsAgent, handle_agent);
    handler!(router, ctx, SyscallOp::MetricsAllAgents, handle_all_agents);
    handler!(router, ctx, SyscallOp::MetricsCgroup, handle_cgroup);
}

fn handle_system(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let by_state = ctx.supervisor.counts_by_state();
    reply(
        frame,
        json!({
            "success": true,
            "metrics": {
                "uptime_secs": ctx.started_at.elapsed().as_secs(),
                "agents": {
                    "total": ctx.supervisor.agent_count(),
                    "by_state": by_state,
                    "pending_restarts": ctx.supervisor.pending_restart_count(),
                },
                "worlds": ctx.worlds.metrics(),
                "state_keys": ctx.state.len(),
                "audit_entries": ctx.audit.len(),
                "tunnel": ctx.tunnel.status(),
            },
        }),
    )
}

#[derive(Deserialize)]
struct AgentMetricsRequest {
    #[serde(default)]
    agent_id: Option<u32>,
    #[serde(default)]
    name: Option<String>,
}

fn handle_agent(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let request: AgentMetricsRequest = match parse(frame) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let selector = match (request.agent_id, request.name) {
        (Some(id), _) => AgentSelector::Id(id),
        (None, Some(name)) if !name.is_empty() => AgentSelector::Name(name),
        _ => AgentSelector::Id(frame.agent_id),
    };

    match ctx.supervisor.agent_info(&selector) {
        Some(info) => reply(frame, json!({"success": true, "metrics": info})),
        None => fail(
            frame,
            ErrorKind::NotFound,
            format!("agent not found: {selector}"),
        ),
    }
}

fn handle_all_agents(ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    let agents = ctx.supervisor.list();
    reply(
        frame,
        json!({"success": true, "count": agents.len(), "agents": agents}),
    )
}

fn handle_cgroup(_ctx: &Arc<KernelContext>, frame: &Frame) -> Frame {
    fail(
        frame,
        ErrorKind::Unavailable,
        "cgroup metrics are produced by the external collector",
    )
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{call, harness};
    use roost_protocol::SyscallOp;
    use serde_json::json;

    #[test]
    fn system_metrics_reflect_kernel_state() {
        let (ctx, router) = harness();
        ctx.state.store(
            1,
            "k",
            json!(1),
            crate::kernel::state::Scope::Global,
            None,
        );
        ctx.worlds.create_world("w", &json!({}));

        let body = call(&router, 1, SyscallOp::MetricsSystem, json!({}));
        assert_eq!(body["success"], true);
        let metrics = &body["metrics"];
        assert_eq!(metrics["state_keys"], 1);
        assert_eq!(metrics["worlds"]["world_count"], 1);
        assert_eq!(metrics["agents"]["total"], 0);
        assert!(metrics["uptime_secs"].as_u64().is_some());
    }

    #[test]
    fn agent_metrics_not_found_for_unsupervised_caller() {
        let (_ctx, router) = harness();
        let body = call(&router, 1, SyscallOp::MetricsAgent, json!({}));
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "NOT_FOUND");
    }

    #[test]
    fn all_agents_empty_by_default() {
        let (_ctx, router) = harness();
        let body = call(&router, 1, SyscallOp::MetricsAllAgents, json!({}));
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 0);
    }

    #[test]
    fn cgroup_metrics_unavailable() {
        let (_ctx, router) = harness();
        let body = call(&router, 1, SyscallOp::MetricsCgroup, json!({}));
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "UNAVAILABLE");
    }
}
