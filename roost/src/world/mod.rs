//! Simulation worlds.
//!
//! A world is an isolated environment an agent can join: a virtual
//! filesystem, a network mock, and a chaos fault injector, plus membership
//! and usage metrics. An agent belongs to at most one world at a time;
//! file and network syscalls consult the agent's world before touching the
//! host.

pub mod chaos;
pub mod netmock;
pub mod vfs;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use chaos::ChaosEngine;
use netmock::NetworkMock;
use vfs::VirtualFs;

pub type WorldId = String;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("world not found: {0}")]
    NotFound(String),
    #[error("world has active agents: {0}")]
    NotEmpty(String),
    #[error("agent already in world: {0}")]
    AlreadyJoined(String),
    #[error("agent not in any world")]
    NotJoined,
    #[error("world already exists: {0}")]
    Exists(String),
}

#[derive(Default)]
struct WorldState {
    agents: HashSet<u32>,
    syscall_count: u64,
    last_activity_ms: i64,
}

/// One simulation world.
pub struct World {
    id: WorldId,
    name: Mutex<String>,
    description: Mutex<String>,
    vfs: VirtualFs,
    network: NetworkMock,
    chaos: ChaosEngine,
    state: Mutex<WorldState>,
    created_at_ms: i64,
}

impl World {
    fn new(id: WorldId) -> Self {
        Self {
            name: Mutex::new(id.clone()),
            id,
            description: Mutex::new(String::new()),
            vfs: VirtualFs::new(),
            network: NetworkMock::new(),
            chaos: ChaosEngine::new(),
            state: Mutex::new(WorldState {
                last_activity_ms: chrono::Utc::now().timestamp_millis(),
                ..WorldState::default()
            }),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn configure(&self, config: &Value) {
        if let Some(name) = config.get("name").and_then(|n| n.as_str()) {
            *self.name.lock().unwrap() = name.to_string();
        }
        if let Some(description) = config.get("description").and_then(|d| d.as_str()) {
            *self.description.lock().unwrap() = description.to_string();
        }
        if let Some(vfs_config) = config.get("virtual_filesystem") {
            self.vfs.configure(vfs_config);
        }
        if let Some(network_config) = config.get("network") {
            self.network.configure(network_config);
        }
        if let Some(chaos_config) = config.get("chaos") {
            self.chaos.configure(chaos_config);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn description(&self) -> String {
        self.description.lock().unwrap().clone()
    }

    pub fn vfs(&self) -> &VirtualFs {
        &self.vfs
    }

    pub fn network(&self) -> &NetworkMock {
        &self.network
    }

    pub fn chaos(&self) -> &ChaosEngine {
        &self.chaos
    }

    fn add_agent(&self, agent_id: u32) {
        let mut state = self.state.lock().unwrap();
        state.agents.insert(agent_id);
        state.last_activity_ms = chrono::Utc::now().timestamp_millis();
    }

    fn remove_agent(&self, agent_id: u32) {
        let mut state = self.state.lock().unwrap();
        state.agents.remove(&agent_id);
        state.last_activity_ms = chrono::Utc::now().timestamp_millis();
    }

    pub fn agent_count(&self) -> usize {
        self.state.lock().unwrap().agents.len()
    }

    pub fn agents(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        let mut agents: Vec<u32> = state.agents.iter().copied().collect();
        agents.sort();
        agents
    }

    /// Bump the syscall counter; called by handlers that touch the world.
    pub fn record_syscall(&self) {
        let mut state = self.state.lock().unwrap();
        state.syscall_count += 1;
        state.last_activity_ms = chrono::Utc::now().timestamp_millis();
    }

    pub fn metrics(&self) -> Value {
        let state = self.state.lock().unwrap();
        json!({
            "agent_count": state.agents.len(),
            "syscall_count": state.syscall_count,
            "created_at": self.created_at_ms,
            "last_activity": state.last_activity_ms,
        })
    }

    /// Serialize the whole world.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name(),
            "description": self.description(),
            "vfs": self.vfs.to_json(),
            "network": self.network.to_json(),
            "chaos": self.chaos.to_json(),
            "agents": self.agents(),
        })
    }

    /// Rebuild subsystems from a snapshot. Membership is intentionally not
    /// restored; agents must join the restored world themselves.
    fn from_json(&self, snapshot: &Value) {
        if let Some(name) = snapshot.get("name").and_then(|n| n.as_str()) {
            *self.name.lock().unwrap() = name.to_string();
        }
        if let Some(description) = snapshot.get("description").and_then(|d| d.as_str()) {
            *self.description.lock().unwrap() = description.to_string();
        }
        if let Some(vfs) = snapshot.get("vfs") {
            self.vfs.from_json(vfs);
        }
        if let Some(network) = snapshot.get("network") {
            self.network.from_json(network);
        }
        if let Some(chaos) = snapshot.get("chaos") {
            self.chaos.from_json(chaos);
        }
    }
}

#[derive(Default)]
struct EngineInner {
    worlds: BTreeMap<WorldId, Arc<World>>,
    agent_to_world: HashMap<u32, WorldId>,
}

/// Manages worlds and the agent→world map (one world per agent).
pub struct WorldEngine {
    inner: Mutex<EngineInner>,
    next_world_num: AtomicU64,
}

impl Default for WorldEngine {
    fn default() -> Self {
        Self {
            inner: Mutex::new(EngineInner::default()),
            next_world_num: AtomicU64::new(1),
        }
    }
}

impl WorldEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a world from a name and config, returning the generated id.
    pub fn create_world(&self, name: &str, config: &Value) -> WorldId {
        let id = self.generate_world_id(name);
        let world = Arc::new(World::new(id.clone()));
        world.configure(config);

        let mut inner = self.inner.lock().unwrap();
        inner.worlds.insert(id.clone(), world);
        tracing::info!(world_id = %id, name, "world created");
        id
    }

    /// Destroy a world. Refuses a non-empty world unless `force`, in which
    /// case members are evicted.
    pub fn destroy_world(&self, world_id: &str, force: bool) -> Result<(), WorldError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(world) = inner.worlds.get(world_id) else {
            return Err(WorldError::NotFound(world_id.to_string()));
        };
        if !force && world.agent_count() > 0 {
            return Err(WorldError::NotEmpty(world_id.to_string()));
        }
        let evicted = world.agents();
        for agent_id in &evicted {
            inner.agent_to_world.remove(agent_id);
        }
        inner.worlds.remove(world_id);
        tracing::info!(world_id, evicted = evicted.len(), "world destroyed");
        Ok(())
    }

    pub fn list_worlds(&self) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .worlds
            .values()
            .map(|world| {
                json!({
                    "id": world.id(),
                    "name": world.name(),
                    "description": world.description(),
                    "agent_count": world.agent_count(),
                    "syscall_count": world.metrics()["syscall_count"],
                    "vfs_enabled": world.vfs().is_enabled(),
                    "network_mock_enabled": world.network().is_enabled(),
                    "chaos_enabled": world.chaos().is_enabled(),
                })
            })
            .collect()
    }

    pub fn get_world(&self, world_id: &str) -> Option<Arc<World>> {
        self.inner.lock().unwrap().worlds.get(world_id).cloned()
    }

    /// Join an agent to a world. An agent may be in at most one world.
    pub fn join_world(&self, agent_id: u32, world_id: &str) -> Result<(), WorldError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = inner.agent_to_world.get(&agent_id) {
            return Err(WorldError::AlreadyJoined(current.clone()));
        }
        let Some(world) = inner.worlds.get(world_id) else {
            return Err(WorldError::NotFound(world_id.to_string()));
        };
        world.add_agent(agent_id);
        inner.agent_to_world.insert(agent_id, world_id.to_string());
        tracing::info!(agent_id, world_id, "agent joined world");
        Ok(())
    }

    pub fn leave_world(&self, agent_id: u32) -> Result<WorldId, WorldError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(world_id) = inner.agent_to_world.remove(&agent_id) else {
            return Err(WorldError::NotJoined);
        };
        if let Some(world) = inner.worlds.get(&world_id) {
            world.remove_agent(agent_id);
        }
        tracing::info!(agent_id, world_id = %world_id, "agent left world");
        Ok(world_id)
    }

    /// The world an agent currently inhabits, if any.
    pub fn world_of(&self, agent_id: u32) -> Option<Arc<World>> {
        let inner = self.inner.lock().unwrap();
        let world_id = inner.agent_to_world.get(&agent_id)?;
        inner.worlds.get(world_id).cloned()
    }

    pub fn inject_event(
        &self,
        world_id: &str,
        event_type: &str,
        params: Value,
    ) -> Result<(), WorldError> {
        let Some(world) = self.get_world(world_id) else {
            return Err(WorldError::NotFound(world_id.to_string()));
        };
        world.chaos().inject_event(event_type, params);
        Ok(())
    }

    /// Metrics bundle for one world.
    pub fn world_state(&self, world_id: &str) -> Result<Value, WorldError> {
        let Some(world) = self.get_world(world_id) else {
            return Err(WorldError::NotFound(world_id.to_string()));
        };
        Ok(json!({
            "world_id": world.id(),
            "name": world.name(),
            "metrics": world.metrics(),
            "vfs_metrics": world.vfs().metrics(),
            "network_metrics": world.network().metrics(),
            "chaos_metrics": world.chaos().metrics(),
            "agents": world.agents(),
        }))
    }

    pub fn snapshot_world(&self, world_id: &str) -> Result<Value, WorldError> {
        let Some(world) = self.get_world(world_id) else {
            return Err(WorldError::NotFound(world_id.to_string()));
        };
        let mut snapshot = world.to_json();
        snapshot["snapshot_time"] = json!(chrono::Utc::now().timestamp_millis());
        Ok(snapshot)
    }

    /// Rebuild a world from a snapshot under `new_world_id`, or a generated
    /// id when none is supplied.
    pub fn restore_world(
        &self,
        snapshot: &Value,
        new_world_id: Option<&str>,
    ) -> Result<WorldId, WorldError> {
        let id = match new_world_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let name = snapshot
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("restored");
                self.generate_world_id(name)
            }
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.worlds.contains_key(&id) {
            return Err(WorldError::Exists(id));
        }
        let world = Arc::new(World::new(id.clone()));
        world.from_json(snapshot);
        inner.worlds.insert(id.clone(), world);
        tracing::info!(world_id = %id, "world restored from snapshot");
        Ok(id)
    }

    pub fn metrics(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        json!({
            "world_count": inner.worlds.len(),
            "agents_in_worlds": inner.agent_to_world.len(),
        })
    }

    /// Sanitize the supplied name and append a monotonic 4-digit suffix.
    fn generate_world_id(&self, name: &str) -> WorldId {
        let mut safe_name = String::new();
        for c in name.chars() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                safe_name.push(c.to_ascii_lowercase());
            } else if c == ' ' {
                safe_name.push('-');
            }
        }
        if safe_name.is_empty() {
            safe_name = "world".to_string();
        }
        safe_name.truncate(32);
        let num = self.next_world_num.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:04}", safe_name, num)
    }
}
