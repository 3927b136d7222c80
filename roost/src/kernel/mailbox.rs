//! Agent name registry and per-agent FIFO mailboxes.
//!
//! A name is bound to at most one live agent id at a time. Mailboxes are
//! unbounded FIFO queues drained by RECV; delivery never blocks and never
//! drops silently.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;

/// One queued inter-agent message.
#[derive(Debug, Clone)]
pub struct MailboxEntry {
    pub from_id: u32,
    pub from_name: String,
    pub body: Value,
    pub enqueued_at: Instant,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("name already registered: {0}")]
    NameTaken(String),
    #[error("target agent not found: {0}")]
    UnknownTarget(String),
}

#[derive(Default)]
struct Inner {
    /// name -> agent id (at most one binding per name).
    names: HashMap<String, u32>,
    /// agent id -> name, for reverse lookups on send/broadcast.
    ids_to_names: HashMap<u32, String>,
    /// Mailbox per known agent. Presence of a queue defines "known".
    queues: HashMap<u32, VecDeque<MailboxEntry>>,
}

/// Registry of agent names and their mailboxes.
#[derive(Default)]
pub struct MailboxRegistry {
    inner: Mutex<Inner>,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an agent known to the registry (idempotent). Called on connect
    /// and when the supervisor spawns an agent.
    pub fn attach(&self, agent_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.entry(agent_id).or_default();
    }

    /// Bind `name` to `agent_id`. Fails if the name is held by another live
    /// agent; re-registering replaces the caller's previous binding.
    pub fn register(&self, agent_id: u32, name: &str) -> Result<(), MailboxError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&holder) = inner.names.get(name) {
            if holder != agent_id {
                return Err(MailboxError::NameTaken(name.to_string()));
            }
            return Ok(());
        }
        if let Some(old) = inner.ids_to_names.remove(&agent_id) {
            inner.names.remove(&old);
        }
        inner.names.insert(name.to_string(), agent_id);
        inner.ids_to_names.insert(agent_id, name.to_string());
        inner.queues.entry(agent_id).or_default();
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<u32> {
        self.inner.lock().unwrap().names.get(name).copied()
    }

    pub fn name_of(&self, agent_id: u32) -> String {
        self.inner
            .lock()
            .unwrap()
            .ids_to_names
            .get(&agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Enqueue a message for `target`. The target must be known.
    pub fn send(&self, from_id: u32, target: u32, body: Value) -> Result<(), MailboxError> {
        let mut inner = self.inner.lock().unwrap();
        let from_name = inner.ids_to_names.get(&from_id).cloned().unwrap_or_default();
        let Some(queue) = inner.queues.get_mut(&target) else {
            return Err(MailboxError::UnknownTarget(target.to_string()));
        };
        queue.push_back(MailboxEntry {
            from_id,
            from_name,
            body,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Drain up to `max` entries in FIFO order.
    pub fn recv(&self, agent_id: u32, max: usize) -> Vec<MailboxEntry> {
        let mut inner = self.inner.lock().unwrap();
        let Some(queue) = inner.queues.get_mut(&agent_id) else {
            return Vec::new();
        };
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    /// Enqueue to every known agent. Returns the delivered count.
    pub fn broadcast(&self, from_id: u32, body: Value, include_self: bool) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let from_name = inner.ids_to_names.get(&from_id).cloned().unwrap_or_default();
        let now = Instant::now();
        let mut delivered = 0;
        for (&id, queue) in inner.queues.iter_mut() {
            if id == from_id && !include_self {
                continue;
            }
            queue.push_back(MailboxEntry {
                from_id,
                from_name: from_name.clone(),
                body: body.clone(),
                enqueued_at: now,
            });
            delivered += 1;
        }
        delivered
    }

    /// Ids of all known agents (broadcast recipients).
    pub fn known_agents(&self) -> Vec<u32> {
        self.inner.lock().unwrap().queues.keys().copied().collect()
    }

    /// Remove an agent permanently: unbind its name, drop its queue.
    pub fn remove(&self, agent_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(name) = inner.ids_to_names.remove(&agent_id) {
            inner.names.remove(&name);
        }
        inner.queues.remove(&agent_id);
    }

    pub fn pending_count(&self, agent_id: u32) -> usize {
        self.inner
            .lock()
            .unwrap()
            .queues
            .get(&agent_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}
