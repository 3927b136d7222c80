//! Scoped key-value store with TTL.
//!
//! Scopes: `global` (shared, anyone may read), `agent` (physically keyed
//! under `agent:<id>:<key>`, readable only by the owner), and `session`
//! (stored under the flat namespace with global visibility). Expired
//! entries are removed lazily when a fetch or enumeration touches them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Agent,
    Session,
}

impl Scope {
    /// Unknown scope strings degrade to `global`.
    pub fn parse(s: &str) -> Scope {
        match s {
            "agent" => Scope::Agent,
            "session" => Scope::Session,
            _ => Scope::Global,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Agent => "agent",
            Scope::Session => "session",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    owner_agent_id: u32,
    scope: Scope,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }

    fn accessible_by(&self, agent_id: u32) -> bool {
        match self.scope {
            Scope::Global | Scope::Session => true,
            Scope::Agent => self.owner_agent_id == agent_id,
        }
    }
}

/// Result of a fetch: whether the key exists and, if so, its value and scope.
#[derive(Debug)]
pub struct Fetched {
    pub exists: bool,
    pub value: Value,
    pub scope: Option<Scope>,
}

/// In-memory scoped key-value store.
#[derive(Default)]
pub struct StateStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`. A missing or non-positive TTL stores a
    /// permanent entry. Returns the effective scope.
    pub fn store(
        &self,
        agent_id: u32,
        key: &str,
        value: Value,
        scope: Scope,
        ttl_secs: Option<i64>,
    ) -> Scope {
        let expires_at = ttl_secs
            .filter(|ttl| *ttl > 0)
            .map(|ttl| Instant::now() + Duration::from_secs(ttl as u64));

        let physical_key = match scope {
            Scope::Agent => agent_key(agent_id, key),
            _ => key.to_string(),
        };

        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            physical_key,
            StoredValue {
                value,
                owner_agent_id: agent_id,
                scope,
                expires_at,
            },
        );
        scope
    }

    /// Fetch `key` for `agent_id`: the bare key is tried first, then the
    /// agent-scoped key. Expired entries found along the way are erased.
    pub fn fetch(&self, agent_id: u32, key: &str) -> Fetched {
        let mut entries = self.entries.lock().unwrap();
        for try_key in [key.to_string(), agent_key(agent_id, key)] {
            let Some(entry) = entries.get(&try_key) else {
                continue;
            };
            if entry.is_expired() {
                entries.remove(&try_key);
                continue;
            }
            if !entry.accessible_by(agent_id) {
                continue;
            }
            return Fetched {
                exists: true,
                value: entry.value.clone(),
                scope: Some(entry.scope),
            };
        }
        Fetched {
            exists: false,
            value: Value::Null,
            scope: None,
        }
    }

    /// Erase `key` if the caller owns the entry or the entry is global.
    /// Returns whether an entry was deleted.
    pub fn erase(&self, agent_id: u32, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        for try_key in [key.to_string(), agent_key(agent_id, key)] {
            let Some(entry) = entries.get(&try_key) else {
                continue;
            };
            if entry.owner_agent_id == agent_id || entry.scope == Scope::Global {
                entries.remove(&try_key);
                return true;
            }
        }
        false
    }

    /// Enumerate keys the agent may access, with the internal
    /// `agent:<id>:` prefix stripped, filtered by `prefix` against the
    /// user-visible name. Expired entries are erased as they are found.
    pub fn keys(&self, agent_id: u32, prefix: &str) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, v| !v.is_expired());

        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, v)| v.accessible_by(agent_id))
            .map(|(k, _)| visible_name(k))
            .filter(|k| prefix.is_empty() || k.starts_with(prefix))
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn agent_key(agent_id: u32, key: &str) -> String {
    format!("agent:{}:{}", agent_id, key)
}

/// Strip the `agent:<id>:` prefix from a physical key.
fn visible_name(physical: &str) -> String {
    if let Some(rest) = physical.strip_prefix("agent:") {
        if let Some((_, user_key)) = rest.split_once(':') {
            return user_key.to_string();
        }
    }
    physical.to_string()
}
