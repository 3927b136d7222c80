//! Typed pub/sub event bus with per-subscriber queues.
//!
//! Emission appends the event to the queue of every subscriber whose
//! subscription set contains the event type; there is no fan-out thread and
//! emit never blocks. Queues are drained FIFO by POLL_EVENTS.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use serde_json::Value;

/// Kernel event types for the pub/sub system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelEventType {
    AgentSpawned,
    AgentExited,
    AgentPaused,
    AgentResumed,
    AgentRestarting,
    AgentEscalated,
    MessageReceived,
    StateChanged,
    SyscallBlocked,
    ResourceWarning,
    Custom,
}

impl KernelEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelEventType::AgentSpawned => "AGENT_SPAWNED",
            KernelEventType::AgentExited => "AGENT_EXITED",
            KernelEventType::AgentPaused => "AGENT_PAUSED",
            KernelEventType::AgentResumed => "AGENT_RESUMED",
            KernelEventType::AgentRestarting => "AGENT_RESTARTING",
            KernelEventType::AgentEscalated => "AGENT_ESCALATED",
            KernelEventType::MessageReceived => "MESSAGE_RECEIVED",
            KernelEventType::StateChanged => "STATE_CHANGED",
            KernelEventType::SyscallBlocked => "SYSCALL_BLOCKED",
            KernelEventType::ResourceWarning => "RESOURCE_WARNING",
            KernelEventType::Custom => "CUSTOM",
        }
    }

    /// Unknown names degrade to `Custom`.
    pub fn parse(s: &str) -> KernelEventType {
        match s {
            "AGENT_SPAWNED" => KernelEventType::AgentSpawned,
            "AGENT_EXITED" => KernelEventType::AgentExited,
            "AGENT_PAUSED" => KernelEventType::AgentPaused,
            "AGENT_RESUMED" => KernelEventType::AgentResumed,
            "AGENT_RESTARTING" => KernelEventType::AgentRestarting,
            "AGENT_ESCALATED" => KernelEventType::AgentEscalated,
            "MESSAGE_RECEIVED" => KernelEventType::MessageReceived,
            "STATE_CHANGED" => KernelEventType::StateChanged,
            "SYSCALL_BLOCKED" => KernelEventType::SyscallBlocked,
            "RESOURCE_WARNING" => KernelEventType::ResourceWarning,
            _ => KernelEventType::Custom,
        }
    }
}

/// One queued kernel event. `source_agent_id` 0 means the kernel itself.
#[derive(Debug, Clone)]
pub struct KernelEvent {
    pub event_type: KernelEventType,
    pub data: Value,
    pub source_agent_id: u32,
    pub timestamp_ms: i64,
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<u32, HashSet<KernelEventType>>,
    queues: HashMap<u32, VecDeque<KernelEvent>>,
}

/// Pub/sub bus for kernel events.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the event to every matched subscriber's queue.
    pub fn emit(&self, event_type: KernelEventType, data: Value, source_agent_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let event = KernelEvent {
            event_type,
            data,
            source_agent_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        let matched: Vec<u32> = inner
            .subscriptions
            .iter()
            .filter(|(_, types)| types.contains(&event_type))
            .map(|(&id, _)| id)
            .collect();
        for agent_id in matched {
            inner.queues.entry(agent_id).or_default().push_back(event.clone());
            tracing::debug!(
                event = event_type.as_str(),
                agent_id,
                "event queued for subscriber"
            );
        }
    }

    pub fn subscribe(&self, agent_id: u32, types: &[KernelEventType]) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscriptions
            .entry(agent_id)
            .or_default()
            .extend(types.iter().copied());
    }

    /// Remove specific subscriptions, or all of them for the agent.
    pub fn unsubscribe(&self, agent_id: u32, types: &[KernelEventType], all: bool) {
        let mut inner = self.inner.lock().unwrap();
        if all {
            inner.subscriptions.remove(&agent_id);
            return;
        }
        if let Some(subs) = inner.subscriptions.get_mut(&agent_id) {
            for t in types {
                subs.remove(t);
            }
        }
    }

    /// Drain up to `max` events in FIFO order.
    pub fn poll(&self, agent_id: u32, max: usize) -> Vec<KernelEvent> {
        let mut inner = self.inner.lock().unwrap();
        let Some(queue) = inner.queues.get_mut(&agent_id) else {
            return Vec::new();
        };
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    /// Drop all subscriptions and queued events for a removed agent.
    pub fn remove(&self, agent_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscriptions.remove(&agent_id);
        inner.queues.remove(&agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_reaches_only_matching_subscribers() {
        let bus = EventBus::new();
        bus.subscribe(1, &[KernelEventType::AgentSpawned]);
        bus.subscribe(2, &[KernelEventType::StateChanged]);

        bus.emit(KernelEventType::AgentSpawned, json!({"name": "w"}), 0);

        let events = bus.poll(1, 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, KernelEventType::AgentSpawned);
        assert_eq!(events[0].data["name"], "w");
        assert!(bus.poll(2, 10).is_empty());
    }

    #[test]
    fn exactly_one_entry_per_emit() {
        let bus = EventBus::new();
        bus.subscribe(
            1,
            &[KernelEventType::StateChanged, KernelEventType::Custom],
        );
        bus.emit(KernelEventType::StateChanged, json!({}), 3);
        bus.emit(KernelEventType::StateChanged, json!({}), 3);

        assert_eq!(bus.poll(1, 10).len(), 2);
    }

    #[test]
    fn poll_is_fifo_and_bounded() {
        let bus = EventBus::new();
        bus.subscribe(1, &[KernelEventType::Custom]);
        for n in 0..5 {
            bus.emit(KernelEventType::Custom, json!({"n": n}), 0);
        }

        let first = bus.poll(1, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].data["n"], 0);
        assert_eq!(first[1].data["n"], 1);

        let rest = bus.poll(1, 10);
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].data["n"], 2);
    }

    #[test]
    fn selective_unsubscribe() {
        let bus = EventBus::new();
        bus.subscribe(
            1,
            &[KernelEventType::AgentExited, KernelEventType::StateChanged],
        );
        bus.unsubscribe(1, &[KernelEventType::AgentExited], false);

        bus.emit(KernelEventType::AgentExited, json!({}), 0);
        bus.emit(KernelEventType::StateChanged, json!({}), 0);

        let events = bus.poll(1, 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, KernelEventType::StateChanged);
    }

    #[test]
    fn unsubscribe_all() {
        let bus = EventBus::new();
        bus.subscribe(1, &[KernelEventType::Custom]);
        bus.unsubscribe(1, &[], true);

        bus.emit(KernelEventType::Custom, json!({}), 0);
        assert!(bus.poll(1, 10).is_empty());
    }

    #[test]
    fn event_name_roundtrip_and_custom_fallback() {
        assert_eq!(
            KernelEventType::parse("AGENT_ESCALATED"),
            KernelEventType::AgentEscalated
        );
        assert_eq!(KernelEventType::parse("bogus"), KernelEventType::Custom);
        assert_eq!(
            KernelEventType::parse(KernelEventType::MessageReceived.as_str()),
            KernelEventType::MessageReceived
        );
    }

    #[test]
    fn events_carry_millisecond_timestamps() {
        let bus = EventBus::new();
        bus.subscribe(1, &[KernelEventType::Custom]);
        let before = chrono::Utc::now().timestamp_millis();
        bus.emit(KernelEventType::Custom, json!({}), 0);
        let events = bus.poll(1, 1);
        assert!(events[0].timestamp_ms >= before);
    }
}
