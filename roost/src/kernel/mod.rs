//! Kernel core: the shared context owning every subsystem, the dispatch
//! entry point, and the run loop that ties the reactor, supervisor tick,
//! and tunnel pump together.

pub mod audit;
pub mod events;
pub mod mailbox;
pub mod permissions;
pub mod reactor;
pub mod replay;
pub mod router;
pub mod state;
pub mod syscalls;
pub mod tasks;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::json;

use roost_protocol::{Frame, SyscallOp};

use crate::config::Config;
use crate::kernel::audit::{AuditCategory, AuditLog};
use crate::kernel::events::EventBus;
use crate::kernel::mailbox::MailboxRegistry;
use crate::kernel::permissions::PermissionsStore;
use crate::kernel::replay::ExecutionLog;
use crate::kernel::router::SyscallRouter;
use crate::kernel::state::StateStore;
use crate::kernel::tasks::AsyncTaskManager;
use crate::supervisor::{IdAllocator, Supervisor};
use crate::tunnel::TunnelBridge;
use crate::world::WorldEngine;

/// Re-entrant dispatch handle used by subsystems that inject frames from
/// outside a client connection (tunnel pump, replay).
pub type DispatchFn = dyn Fn(&Frame) -> Frame + Send + Sync;

/// Shared state passed to every syscall handler.
pub struct KernelContext {
    pub config: Config,
    pub started_at: Instant,
    pub ids: Arc<IdAllocator>,
    pub mailboxes: MailboxRegistry,
    pub state: StateStore,
    pub events: Arc<EventBus>,
    pub permissions: PermissionsStore,
    pub tasks: AsyncTaskManager,
    pub worlds: WorldEngine,
    pub supervisor: Supervisor,
    pub audit: AuditLog,
    pub execution: ExecutionLog,
    pub tunnel: Arc<TunnelBridge>,
    /// Tokio runtime handle for pool workers that must drive async work
    /// (tunnel connect). Set once at kernel startup.
    pub runtime: OnceLock<tokio::runtime::Handle>,
    /// Set once after the router is built; never forms a strong cycle
    /// (the closure holds weak references).
    dispatcher: OnceLock<Arc<DispatchFn>>,
}

impl KernelContext {
    pub fn new(config: Config) -> Arc<Self> {
        let ids = Arc::new(IdAllocator::new());
        let events = Arc::new(EventBus::new());
        let supervisor = Supervisor::new(
            Arc::clone(&ids),
            Arc::clone(&events),
            config.sandbox.clone(),
        );
        let tunnel = Arc::new(TunnelBridge::new(config.tunnel.clone()));
        Arc::new(Self {
            started_at: Instant::now(),
            ids,
            mailboxes: MailboxRegistry::new(),
            state: StateStore::new(),
            events,
            permissions: PermissionsStore::new(),
            tasks: AsyncTaskManager::new(config.server.worker_threads),
            worlds: WorldEngine::new(),
            supervisor,
            audit: AuditLog::new(config.audit.clone()),
            execution: ExecutionLog::new(),
            tunnel,
            runtime: OnceLock::new(),
            dispatcher: OnceLock::new(),
            config,
        })
    }

    /// The re-entrant dispatcher, if the kernel has been assembled.
    pub fn dispatcher(&self) -> Option<Arc<DispatchFn>> {
        self.dispatcher.get().cloned()
    }

    /// Cleanup when a connection goes away: release the name, drop queued
    /// mail, subscriptions and undelivered async results, and leave any
    /// world. The permissions record is retained: ids are never reused,
    /// so a stale record is inert.
    pub fn disconnect_agent(&self, agent_id: u32) {
        self.mailboxes.remove(agent_id);
        self.events.remove(agent_id);
        self.tasks.discard(agent_id);
        let _ = self.worlds.leave_world(agent_id);
        tracing::debug!(agent_id, "agent state released");
    }
}

/// Dispatch one request: feed the recorder, audit, route, and contain any
/// handler panic as an IO_FAILURE response.
pub fn dispatch(ctx: &Arc<KernelContext>, router: &SyscallRouter, frame: &Frame) -> Frame {
    ctx.execution
        .record(frame.agent_id, frame.opcode, &frame.payload_str());
    ctx.audit.log(
        AuditCategory::Syscall,
        frame.opcode.name(),
        frame.agent_id,
        json!({"payload_bytes": frame.payload.len()}),
        true,
    );

    match catch_unwind(AssertUnwindSafe(|| router.handle(frame))) {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(
                agent_id = frame.agent_id,
                opcode = frame.opcode.name(),
                "handler panicked"
            );
            Frame::json(
                frame.agent_id,
                frame.opcode,
                &json!({
                    "success": false,
                    "error": "internal handler fault",
                    "error_kind": "IO_FAILURE",
                }),
            )
        }
    }
}

/// The assembled kernel: context plus the immutable dispatch table.
pub struct Kernel {
    ctx: Arc<KernelContext>,
    router: Arc<SyscallRouter>,
}

impl Kernel {
    pub fn new(config: Config) -> Self {
        let ctx = KernelContext::new(config);

        let mut router = SyscallRouter::new();
        syscalls::register_all(&mut router, &ctx);
        let router = Arc::new(router);

        let weak_ctx = Arc::downgrade(&ctx);
        let weak_router = Arc::downgrade(&router);
        let _ = ctx.dispatcher.set(Arc::new(move |frame: &Frame| {
            match (weak_ctx.upgrade(), weak_router.upgrade()) {
                (Some(ctx), Some(router)) => dispatch(&ctx, &router, frame),
                _ => frame.clone(),
            }
        }));

        Self { ctx, router }
    }

    pub fn context(&self) -> &Arc<KernelContext> {
        &self.ctx
    }

    pub fn router(&self) -> &Arc<SyscallRouter> {
        &self.router
    }

    /// Run the kernel until the process is asked to shut down.
    pub async fn run(&self) -> Result<()> {
        let _ = self.ctx.runtime.set(tokio::runtime::Handle::current());

        // Supervisor tick loop.
        let ctx = Arc::clone(&self.ctx);
        let tick = Duration::from_millis(ctx.config.server.tick_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                ctx.supervisor.tick();
            }
        });

        // Tunnel pump: remote syscalls re-enter the local router and their
        // responses travel back base64-encoded.
        if let Some(mut syscalls_rx) = self.ctx.tunnel.take_syscall_receiver() {
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                while let Some(remote) = syscalls_rx.recv().await {
                    let Ok(opcode) = SyscallOp::try_from(remote.opcode) else {
                        tracing::warn!(opcode = remote.opcode, "unknown remote opcode dropped");
                        continue;
                    };
                    let Some(dispatcher) = ctx.dispatcher() else {
                        break;
                    };
                    let frame = Frame::new(remote.agent_id, opcode, remote.payload);
                    let response = dispatcher(&frame);
                    if let Err(e) =
                        ctx.tunnel
                            .send_response(response.agent_id, response.opcode as u8, &response.payload)
                    {
                        tracing::warn!(error = %e, "failed to return remote response");
                    }
                }
            });
        }

        if self.ctx.config.tunnel.auto_connect {
            let tunnel = Arc::clone(&self.ctx.tunnel);
            tokio::spawn(async move {
                if let Err(e) = tunnel.connect().await {
                    tracing::warn!(error = %e, "tunnel auto-connect failed");
                }
            });
        }

        let serve = reactor::serve(Arc::clone(&self.ctx), Arc::clone(&self.router));
        tokio::select! {
            result = serve => result.context("socket server failed")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Stop agents, drain workers, and release the socket path.
    pub fn shutdown(&self) {
        self.ctx.supervisor.stop_all();
        self.ctx.tunnel.shutdown();
        self.ctx.tasks.shutdown();
        let _ = std::fs::remove_file(&self.ctx.config.server.socket_path);
        tracing::info!("kernel stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kernel() -> Kernel {
        Kernel::new(Config::default())
    }

    #[test]
    fn dispatch_routes_registered_opcode() {
        let kernel = test_kernel();
        let frame = Frame::json(1, SyscallOp::Noop, &json!({"ping": true}));
        let response = dispatch(kernel.context(), kernel.router(), &frame);
        let body: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(body["success"], true);
    }

    #[test]
    fn dispatch_feeds_execution_recorder() {
        let kernel = test_kernel();
        kernel.context().execution.start_recording();
        let frame = Frame::json(1, SyscallOp::Store, &json!({"key": "k", "value": 1}));
        dispatch(kernel.context(), kernel.router(), &frame);
        assert_eq!(kernel.context().execution.entry_count(), 1);
    }

    #[test]
    fn disconnect_releases_agent_state() {
        let kernel = test_kernel();
        let ctx = kernel.context();
        ctx.mailboxes.attach(5);
        ctx.mailboxes.register(5, "temp").unwrap();
        ctx.events
            .subscribe(5, &[events::KernelEventType::Custom]);
        let world = ctx.worlds.create_world("w", &json!({}));
        ctx.worlds.join_world(5, &world).unwrap();

        ctx.disconnect_agent(5);

        assert_eq!(ctx.mailboxes.resolve("temp"), None);
        assert!(ctx.worlds.world_of(5).is_none());
        // Name is free again.
        ctx.mailboxes.attach(6);
        assert!(ctx.mailboxes.register(6, "temp").is_ok());
    }

    #[test]
    fn dispatcher_handle_survives_via_weak_refs() {
        let kernel = test_kernel();
        let dispatcher = kernel.context().dispatcher().unwrap();
        let frame = Frame::json(2, SyscallOp::Hello, &json!({}));
        let response = dispatcher(&frame);
        let body: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["agent_id"], 2);
    }
}
