//! Agent process supervisor.
//!
//! Spawns worker processes, tracks their lifecycle states, reaps the dead
//! on a periodic tick, and applies the configured restart policy with
//! windowed exponential backoff. Exceeding the restart cap inside the
//! window escalates exactly once per window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::{Child, Command};

use crate::config::SandboxConfig;
use crate::kernel::events::{EventBus, KernelEventType};

/// Shared monotone allocator for agent ids. Ids are never reused within a
/// process lifetime; both socket connections and spawned processes draw
/// from the same sequence.
#[derive(Default)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Restart policy for automatic agent recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    Always,
    OnFailure,
}

impl RestartPolicy {
    pub fn parse(s: &str) -> RestartPolicy {
        match s {
            "always" => RestartPolicy::Always,
            "on-failure" | "on_failure" => RestartPolicy::OnFailure,
            _ => RestartPolicy::Never,
        }
    }
}

/// Configuration for automatic restart behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub policy: RestartPolicy,
    /// Max restarts within the window.
    pub max_restarts: u32,
    /// Rolling window for counting restarts, in seconds.
    pub restart_window_sec: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Never,
            max_restarts: 5,
            restart_window_sec: 300,
            backoff_initial_ms: 1000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// How to launch one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_sandboxed")]
    pub sandboxed: bool,
    #[serde(default)]
    pub restart: RestartConfig,
}

fn default_sandboxed() -> bool {
    true
}

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
            AgentState::Failed => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("agent already exists: {0}")]
    Exists(String),
    #[error("agent is not {expected}: {name}")]
    WrongState { name: String, expected: &'static str },
    #[error("failed to launch agent: {0}")]
    Launch(String),
}

struct AgentRecord {
    id: u32,
    name: String,
    state: AgentState,
    child: Child,
    pid: Option<u32>,
    spawned_at: Instant,
    /// Recorded at reap time, retained for diagnostics.
    #[allow(dead_code)]
    exit_code: Option<i32>,
}

#[derive(Default)]
struct RestartState {
    restart_count: u32,
    consecutive_failures: u32,
    window_start: Option<Instant>,
    escalated: bool,
}

struct PendingRestart {
    name: String,
    scheduled_at: Instant,
    spec: AgentSpec,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<u32, AgentRecord>,
    by_name: HashMap<String, u32>,
    restart_states: HashMap<String, RestartState>,
    saved_specs: HashMap<String, AgentSpec>,
    pending_restarts: Vec<PendingRestart>,
}

/// The agent supervisor.
pub struct Supervisor {
    inner: Mutex<Inner>,
    ids: Arc<IdAllocator>,
    events: Arc<EventBus>,
    sandbox: SandboxConfig,
}

impl Supervisor {
    pub fn new(ids: Arc<IdAllocator>, events: Arc<EventBus>, sandbox: SandboxConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ids,
            events,
            sandbox,
        }
    }

    /// Spawn an agent process. The name must be free.
    pub fn spawn(&self, spec: AgentSpec) -> Result<u32, SupervisorError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.by_name.contains_key(&spec.name) {
                return Err(SupervisorError::Exists(spec.name));
            }
        }

        let id = self.launch(&spec)?;

        let mut inner = self.inner.lock().unwrap();
        if spec.restart.policy != RestartPolicy::Never {
            inner.saved_specs.insert(spec.name.clone(), spec.clone());
            inner
                .restart_states
                .entry(spec.name.clone())
                .or_insert_with(|| RestartState {
                    window_start: Some(Instant::now()),
                    ..RestartState::default()
                });
        }
        drop(inner);

        self.events.emit(
            KernelEventType::AgentSpawned,
            json!({"agent_id": id, "name": spec.name}),
            0,
        );
        Ok(id)
    }

    /// Start the process and insert the live record.
    fn launch(&self, spec: &AgentSpec) -> Result<u32, SupervisorError> {
        let mut command = match (&self.sandbox.sandbox_command, spec.sandboxed) {
            (Some(wrapper), true) if self.sandbox.enable_sandboxing => {
                let mut c = Command::new(wrapper);
                c.arg(&spec.command);
                c.args(&spec.args);
                c
            }
            _ => {
                let mut c = Command::new(&spec.command);
                c.args(&spec.args);
                c
            }
        };
        command
            .envs(&spec.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| SupervisorError::Launch(format!("{}: {e}", spec.command)))?;

        let id = self.ids.allocate();
        let pid = child.id();
        tracing::info!(agent_id = id, name = %spec.name, pid, "agent started");

        let mut inner = self.inner.lock().unwrap();
        inner.by_name.insert(spec.name.clone(), id);
        inner.by_id.insert(
            id,
            AgentRecord {
                id,
                name: spec.name.clone(),
                state: AgentState::Running,
                child,
                pid,
                spawned_at: Instant::now(),
                exit_code: None,
            },
        );
        Ok(id)
    }

    fn resolve_id(&self, inner: &Inner, selector: &AgentSelector) -> Option<u32> {
        match selector {
            AgentSelector::Id(id) => inner.by_id.contains_key(id).then_some(*id),
            AgentSelector::Name(name) => inner.by_name.get(name.as_str()).copied(),
        }
    }

    /// Kill an agent and forget its restart bookkeeping.
    pub fn kill(&self, selector: &AgentSelector) -> Result<u32, SupervisorError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(id) = self.resolve_id(&inner, selector) else {
            return Err(SupervisorError::NotFound(selector.to_string()));
        };
        let mut record = inner.by_id.remove(&id).unwrap();
        inner.by_name.remove(&record.name);
        inner.saved_specs.remove(&record.name);
        inner.restart_states.remove(&record.name);
        inner.pending_restarts.retain(|p| p.name != record.name);
        let name = record.name.clone();
        let _ = record.child.start_kill();
        drop(inner);

        tracing::info!(agent_id = id, name = %name, "agent killed");
        self.events.emit(
            KernelEventType::AgentExited,
            json!({"agent_id": id, "name": name, "exit_code": Value::Null, "killed": true}),
            0,
        );
        Ok(id)
    }

    /// Deliver SIGSTOP and mark the agent paused.
    pub fn pause(&self, selector: &AgentSelector) -> Result<u32, SupervisorError> {
        self.signal_transition(selector, AgentState::Running, AgentState::Paused, libc::SIGSTOP)
    }

    /// Deliver SIGCONT and mark the agent running.
    pub fn resume(&self, selector: &AgentSelector) -> Result<u32, SupervisorError> {
        self.signal_transition(selector, AgentState::Paused, AgentState::Running, libc::SIGCONT)
    }

    fn signal_transition(
        &self,
        selector: &AgentSelector,
        from: AgentState,
        to: AgentState,
        signal: i32,
    ) -> Result<u32, SupervisorError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(id) = self.resolve_id(&inner, selector) else {
            return Err(SupervisorError::NotFound(selector.to_string()));
        };
        let record = inner.by_id.get_mut(&id).unwrap();
        if record.state != from {
            return Err(SupervisorError::WrongState {
                name: record.name.clone(),
                expected: from.as_str(),
            });
        }
        let Some(pid) = record.pid else {
            return Err(SupervisorError::NotFound(selector.to_string()));
        };
        unsafe {
            libc::kill(pid as i32, signal);
        }
        record.state = to;
        let name = record.name.clone();
        drop(inner);

        let event = if to == AgentState::Paused {
            KernelEventType::AgentPaused
        } else {
            KernelEventType::AgentResumed
        };
        self.events.emit(event, json!({"agent_id": id, "name": name}), 0);
        Ok(id)
    }

    /// Summaries of all supervised agents.
    pub fn list(&self) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        let mut agents: Vec<&AgentRecord> = inner.by_id.values().collect();
        agents.sort_by_key(|r| r.id);
        agents
            .iter()
            .map(|record| {
                let restarts = inner
                    .restart_states
                    .get(&record.name)
                    .map(|s| s.restart_count)
                    .unwrap_or(0);
                json!({
                    "id": record.id,
                    "name": record.name,
                    "state": record.state.as_str(),
                    "pid": record.pid,
                    "uptime_secs": record.spawned_at.elapsed().as_secs(),
                    "restart_count": restarts,
                })
            })
            .collect()
    }

    pub fn agent_info(&self, selector: &AgentSelector) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        let id = self.resolve_id(&inner, selector)?;
        let record = inner.by_id.get(&id)?;
        let restarts = inner
            .restart_states
            .get(&record.name)
            .map(|s| s.restart_count)
            .unwrap_or(0);
        Some(json!({
            "id": record.id,
            "name": record.name,
            "state": record.state.as_str(),
            "pid": record.pid,
            "uptime_secs": record.spawned_at.elapsed().as_secs(),
            "restart_count": restarts,
        }))
    }

    pub fn agent_count(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    pub fn counts_by_state(&self) -> HashMap<&'static str, usize> {
        let inner = self.inner.lock().unwrap();
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for record in inner.by_id.values() {
            *counts.entry(record.state.as_str()).or_default() += 1;
        }
        counts
    }

    /// Periodic tick: reap dead agents, decide restarts, launch due
    /// pending restarts.
    pub fn tick(&self) {
        self.reap_and_schedule();
        self.process_pending_restarts();
    }

    fn reap_and_schedule(&self) {
        let mut dead: Vec<(u32, String, i32)> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            for record in inner.by_id.values_mut() {
                if !matches!(record.state, AgentState::Running | AgentState::Paused) {
                    continue;
                }
                match record.child.try_wait() {
                    Ok(Some(status)) => {
                        let exit_code = status.code().unwrap_or(-1);
                        record.exit_code = Some(exit_code);
                        record.state = if exit_code == 0 {
                            AgentState::Stopped
                        } else {
                            AgentState::Failed
                        };
                        dead.push((record.id, record.name.clone(), exit_code));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(agent_id = record.id, error = %e, "try_wait failed");
                    }
                }
            }
            for (id, name, _) in &dead {
                inner.by_id.remove(id);
                inner.by_name.remove(name);
            }
        }

        for (id, name, exit_code) in dead {
            tracing::warn!(agent_id = id, name = %name, exit_code, "agent exited");
            self.events.emit(
                KernelEventType::AgentExited,
                json!({"agent_id": id, "name": name, "exit_code": exit_code}),
                0,
            );
            self.decide_restart(&name, exit_code);
        }
    }

    fn decide_restart(&self, name: &str, exit_code: i32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(spec) = inner.saved_specs.get(name).cloned() else {
            return;
        };

        let should_restart = match spec.restart.policy {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => exit_code != 0,
            RestartPolicy::Never => false,
        };
        if !should_restart {
            inner.saved_specs.remove(name);
            inner.restart_states.remove(name);
            return;
        }

        let state = inner.restart_states.entry(name.to_string()).or_default();
        let now = Instant::now();

        // Reset counters when the window has elapsed.
        let window = Duration::from_secs(spec.restart.restart_window_sec);
        match state.window_start {
            Some(start) if now.duration_since(start) < window => {}
            _ => {
                state.window_start = Some(now);
                state.restart_count = 0;
                state.consecutive_failures = 0;
                state.escalated = false;
            }
        }

        if state.restart_count >= spec.restart.max_restarts {
            if !state.escalated {
                state.escalated = true;
                let restart_count = state.restart_count;
                drop(inner);
                tracing::error!(
                    name,
                    max_restarts = spec.restart.max_restarts,
                    "agent exceeded restart cap, escalating"
                );
                self.events.emit(
                    KernelEventType::AgentEscalated,
                    json!({
                        "name": name,
                        "restart_count": restart_count,
                        "exit_code": exit_code,
                    }),
                    0,
                );
            }
            return;
        }

        let delay_ms = backoff_delay_ms(&spec.restart, state.consecutive_failures);
        state.restart_count += 1;
        state.consecutive_failures += 1;
        let restart_count = state.restart_count;

        inner.pending_restarts.push(PendingRestart {
            name: name.to_string(),
            scheduled_at: now + Duration::from_millis(delay_ms),
            spec: spec.clone(),
        });
        drop(inner);

        tracing::info!(
            name,
            delay_ms,
            attempt = restart_count,
            max = spec.restart.max_restarts,
            "agent restart scheduled"
        );
        self.events.emit(
            KernelEventType::AgentRestarting,
            json!({
                "name": name,
                "restart_count": restart_count,
                "exit_code": exit_code,
                "delay_ms": delay_ms,
            }),
            0,
        );
    }

    fn process_pending_restarts(&self) {
        let due: Vec<PendingRestart> = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            let (due, later): (Vec<_>, Vec<_>) = inner
                .pending_restarts
                .drain(..)
                .partition(|p| p.scheduled_at <= now);
            inner.pending_restarts = later;
            due
        };

        for pending in due {
            match self.launch(&pending.spec) {
                Ok(id) => {
                    tracing::info!(name = %pending.name, agent_id = id, "agent restarted");
                    // consecutive_failures is deliberately not reset here;
                    // it resets only when the window elapses, so sustained
                    // flapping still reaches the cap.
                    self.events.emit(
                        KernelEventType::AgentSpawned,
                        json!({"agent_id": id, "name": pending.name, "restarted": true}),
                        0,
                    );
                }
                Err(e) => {
                    tracing::error!(name = %pending.name, error = %e, "agent restart failed");
                    self.decide_restart(&pending.name, -1);
                }
            }
        }
    }

    /// Number of queued pending restarts (for metrics and tests).
    pub fn pending_restart_count(&self) -> usize {
        self.inner.lock().unwrap().pending_restarts.len()
    }

    /// Kill every supervised agent (shutdown path).
    pub fn stop_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        tracing::info!(count = inner.by_id.len(), "stopping all agents");
        for record in inner.by_id.values_mut() {
            let _ = record.child.start_kill();
        }
        inner.by_id.clear();
        inner.by_name.clear();
        inner.pending_restarts.clear();
    }
}

/// Address an agent by id or by registered name.
#[derive(Debug, Clone)]
pub enum AgentSelector {
    Id(u32),
    Name(String),
}

impl std::fmt::Display for AgentSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentSelector::Id(id) => write!(f, "{}", id),
            AgentSelector::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Delay before the next restart attempt:
/// `min(initial * multiplier^consecutive_failures, max)`.
fn backoff_delay_ms(config: &RestartConfig, consecutive_failures: u32) -> u64 {
    let mut delay = config.backoff_initial_ms as f64;
    for _ in 0..consecutive_failures {
        delay *= config.backoff_multiplier;
        if delay >= config.backoff_max_ms as f64 {
            return config.backoff_max_ms;
        }
    }
    delay as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_supervisor() -> Supervisor {
        Supervisor::new(
            Arc::new(IdAllocator::new()),
            Arc::new(EventBus::new()),
            SandboxConfig {
                enable_sandboxing: false,
                sandbox_command: None,
            },
        )
    }

    fn sleeper_spec(name: &str) -> AgentSpec {
        AgentSpec {
            name: name.to_string(),
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: HashMap::new(),
            sandboxed: false,
            restart: RestartConfig::default(),
        }
    }

    #[test]
    fn backoff_sequence_follows_spec() {
        let config = RestartConfig {
            backoff_initial_ms: 100,
            backoff_max_ms: 1000,
            backoff_multiplier: 2.0,
            ..RestartConfig::default()
        };
        // Delays for failures 1..5 (consecutive_failures 0..4).
        let delays: Vec<u64> = (0..5).map(|n| backoff_delay_ms(&config, n)).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
    }

    #[test]
    fn backoff_caps_at_max() {
        let config = RestartConfig {
            backoff_initial_ms: 1000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
            ..RestartConfig::default()
        };
        assert_eq!(backoff_delay_ms(&config, 10), 60_000);
    }

    #[test]
    fn restart_policy_parse() {
        assert_eq!(RestartPolicy::parse("always"), RestartPolicy::Always);
        assert_eq!(RestartPolicy::parse("on-failure"), RestartPolicy::OnFailure);
        assert_eq!(RestartPolicy::parse("on_failure"), RestartPolicy::OnFailure);
        assert_eq!(RestartPolicy::parse("never"), RestartPolicy::Never);
        assert_eq!(RestartPolicy::parse("bogus"), RestartPolicy::Never);
    }

    #[tokio::test]
    async fn spawn_list_kill_roundtrip() {
        let supervisor = test_supervisor();
        let id = supervisor.spawn(sleeper_spec("worker-a")).unwrap();

        let listed = supervisor.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], id);
        assert_eq!(listed[0]["name"], "worker-a");
        assert_eq!(listed[0]["state"], "running");
        assert!(listed[0]["pid"].as_u64().is_some());

        supervisor.kill(&AgentSelector::Name("worker-a".into())).unwrap();
        assert_eq!(supervisor.agent_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let supervisor = test_supervisor();
        supervisor.spawn(sleeper_spec("dup")).unwrap();
        assert!(matches!(
            supervisor.spawn(sleeper_spec("dup")),
            Err(SupervisorError::Exists(_))
        ));
    }

    #[tokio::test]
    async fn spawn_of_missing_binary_fails() {
        let supervisor = test_supervisor();
        let mut spec = sleeper_spec("ghost");
        spec.command = "/nonexistent/roost-test-binary".to_string();
        assert!(matches!(
            supervisor.spawn(spec),
            Err(SupervisorError::Launch(_))
        ));
        assert_eq!(supervisor.agent_count(), 0);
    }

    #[tokio::test]
    async fn pause_and_resume_transition_states() {
        let supervisor = test_supervisor();
        supervisor.spawn(sleeper_spec("pausable")).unwrap();

        supervisor.pause(&AgentSelector::Name("pausable".into())).unwrap();
        assert_eq!(supervisor.list()[0]["state"], "paused");

        // Pausing twice is a state error.
        assert!(matches!(
            supervisor.pause(&AgentSelector::Name("pausable".into())),
            Err(SupervisorError::WrongState { .. })
        ));

        supervisor.resume(&AgentSelector::Name("pausable".into())).unwrap();
        assert_eq!(supervisor.list()[0]["state"], "running");

        supervisor.kill(&AgentSelector::Name("pausable".into())).unwrap();
    }

    #[tokio::test]
    async fn reap_emits_exit_and_removes_record() {
        let events = Arc::new(EventBus::new());
        events.subscribe(99, &[KernelEventType::AgentExited]);
        let supervisor = Supervisor::new(
            Arc::new(IdAllocator::new()),
            Arc::clone(&events),
            SandboxConfig {
                enable_sandboxing: false,
                sandbox_command: None,
            },
        );

        let mut spec = sleeper_spec("shortlived");
        spec.command = "true".to_string();
        spec.args = Vec::new();
        supervisor.spawn(spec).unwrap();

        // Give the process a moment to exit, then reap.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            supervisor.tick();
            if supervisor.agent_count() == 0 {
                break;
            }
        }
        assert_eq!(supervisor.agent_count(), 0);

        let exited = events.poll(99, 10);
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0].data["name"], "shortlived");
        assert_eq!(exited[0].data["exit_code"], 0);
    }

    #[tokio::test]
    async fn failing_agent_is_rescheduled_with_backoff() {
        let events = Arc::new(EventBus::new());
        events.subscribe(
            99,
            &[KernelEventType::AgentRestarting, KernelEventType::AgentEscalated],
        );
        let supervisor = Supervisor::new(
            Arc::new(IdAllocator::new()),
            Arc::clone(&events),
            SandboxConfig {
                enable_sandboxing: false,
                sandbox_command: None,
            },
        );

        let spec = AgentSpec {
            name: "flappy".to_string(),
            command: "false".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            sandboxed: false,
            restart: RestartConfig {
                policy: RestartPolicy::OnFailure,
                max_restarts: 2,
                restart_window_sec: 300,
                backoff_initial_ms: 10,
                backoff_max_ms: 100,
                backoff_multiplier: 2.0,
            },
        };
        supervisor.spawn(spec).unwrap();

        // Drive ticks until escalation: 2 restarts allowed, third failure
        // escalates exactly once.
        let mut escalations = 0;
        let mut restarts = 0;
        for _ in 0..400 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            supervisor.tick();
            for event in events.poll(99, 10) {
                match event.event_type {
                    KernelEventType::AgentRestarting => restarts += 1,
                    KernelEventType::AgentEscalated => escalations += 1,
                    _ => {}
                }
            }
            if escalations > 0 {
                break;
            }
        }

        assert_eq!(restarts, 2);
        assert_eq!(escalations, 1);
        assert_eq!(supervisor.pending_restart_count(), 0);

        // Further ticks never escalate again within the window.
        for _ in 0..5 {
            supervisor.tick();
        }
        assert!(events.poll(99, 10).is_empty());
    }

    #[tokio::test]
    async fn never_policy_forgets_agent_on_exit() {
        let supervisor = test_supervisor();
        let mut spec = sleeper_spec("oneshot");
        spec.command = "false".to_string();
        spec.args = Vec::new();
        supervisor.spawn(spec).unwrap();

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            supervisor.tick();
            if supervisor.agent_count() == 0 {
                break;
            }
        }
        assert_eq!(supervisor.agent_count(), 0);
        assert_eq!(supervisor.pending_restart_count(), 0);
    }

    #[test]
    fn id_allocator_is_monotone() {
        let ids = IdAllocator::new();
        let a = ids.allocate();
        let b = ids.allocate();
        let c = ids.allocate();
        assert!(a < b && b < c);
    }

    #[test]
    fn agent_spec_deserializes_with_defaults() {
        let spec: AgentSpec = serde_json::from_value(json!({
            "name": "w",
            "command": "worker",
        }))
        .unwrap();
        assert!(spec.sandboxed);
        assert!(spec.args.is_empty());
        assert_eq!(spec.restart.policy, RestartPolicy::Never);
        assert_eq!(spec.restart.max_restarts, 5);

        let spec: AgentSpec = serde_json::from_value(json!({
            "name": "w2",
            "command": "worker",
            "restart": {"policy": "on-failure", "backoff_initial_ms": 50},
        }))
        .unwrap();
        assert_eq!(spec.restart.policy, RestartPolicy::OnFailure);
        assert_eq!(spec.restart.backoff_initial_ms, 50);
        assert_eq!(spec.restart.backoff_max_ms, 60_000);
    }
}
