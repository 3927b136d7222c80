//! Append-only audit log.
//!
//! A size-capped ring of syscall/security/lifecycle events. Categories are
//! filtered at emit time by the active configuration, so disabled
//! categories cost nothing but the flag check.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;

use crate::config::AuditConfig;

/// Audit entry categories, each gated by a config flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditCategory {
    Syscall,
    Security,
    Lifecycle,
    Ipc,
    State,
    Resource,
    Network,
    World,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Syscall => "syscall",
            AuditCategory::Security => "security",
            AuditCategory::Lifecycle => "lifecycle",
            AuditCategory::Ipc => "ipc",
            AuditCategory::State => "state",
            AuditCategory::Resource => "resource",
            AuditCategory::Network => "network",
            AuditCategory::World => "world",
        }
    }

    pub fn parse(s: &str) -> Option<AuditCategory> {
        match s {
            "syscall" => Some(AuditCategory::Syscall),
            "security" => Some(AuditCategory::Security),
            "lifecycle" => Some(AuditCategory::Lifecycle),
            "ipc" => Some(AuditCategory::Ipc),
            "state" => Some(AuditCategory::State),
            "resource" => Some(AuditCategory::Resource),
            "network" => Some(AuditCategory::Network),
            "world" => Some(AuditCategory::World),
            _ => None,
        }
    }
}

/// One audit record.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub seq_id: u64,
    pub timestamp_ms: i64,
    pub category: AuditCategory,
    pub agent_id: u32,
    pub action: String,
    pub details: Value,
    pub success: bool,
}

impl AuditEntry {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "seq_id": self.seq_id,
            "timestamp": self.timestamp_ms,
            "category": self.category.as_str(),
            "agent_id": self.agent_id,
            "action": self.action,
            "details": self.details,
            "success": self.success,
        })
    }
}

struct Inner {
    entries: VecDeque<AuditEntry>,
    config: AuditConfig,
    next_seq_id: u64,
}

/// The kernel audit log.
pub struct AuditLog {
    inner: Mutex<Inner>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                config,
                next_seq_id: 1,
            }),
        }
    }

    fn enabled(config: &AuditConfig, category: AuditCategory) -> bool {
        match category {
            AuditCategory::Syscall => config.log_syscalls,
            AuditCategory::Security => config.log_security,
            AuditCategory::Lifecycle => config.log_lifecycle,
            AuditCategory::Ipc => config.log_ipc,
            AuditCategory::State => config.log_state,
            AuditCategory::Resource => config.log_resource,
            AuditCategory::Network => config.log_network,
            AuditCategory::World => config.log_world,
        }
    }

    /// Append an entry if its category is enabled. Oldest entries are
    /// evicted beyond `max_entries`.
    pub fn log(
        &self,
        category: AuditCategory,
        action: &str,
        agent_id: u32,
        details: Value,
        success: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if !Self::enabled(&inner.config, category) {
            return;
        }
        let seq_id = inner.next_seq_id;
        inner.next_seq_id += 1;
        inner.entries.push_back(AuditEntry {
            seq_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            category,
            agent_id,
            action: action.to_string(),
            details,
            success,
        });
        let cap = inner.config.max_entries;
        while inner.entries.len() > cap {
            inner.entries.pop_front();
        }
    }

    /// Read entries newer than `since_id`, optionally filtered by category
    /// and agent, up to `limit`.
    pub fn entries(
        &self,
        category: Option<AuditCategory>,
        agent_id: Option<u32>,
        since_id: u64,
        limit: usize,
    ) -> Vec<AuditEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.seq_id > since_id)
            .filter(|e| category.map_or(true, |c| e.category == c))
            .filter(|e| agent_id.map_or(true, |id| e.agent_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn config(&self) -> AuditConfig {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn set_config(&self, config: AuditConfig) {
        let mut inner = self.inner.lock().unwrap();
        inner.config = config;
        let cap = inner.config.max_entries;
        while inner.entries.len() > cap {
            inner.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_on() -> AuditConfig {
        AuditConfig {
            max_entries: 100,
            log_syscalls: true,
            log_security: true,
            log_lifecycle: true,
            log_ipc: true,
            log_state: true,
            log_resource: true,
            log_network: true,
            log_world: true,
        }
    }

    #[test]
    fn disabled_categories_are_dropped() {
        let mut config = all_on();
        config.log_ipc = false;
        let log = AuditLog::new(config);

        log.log(AuditCategory::Ipc, "SEND", 1, json!({}), true);
        log.log(AuditCategory::Security, "DENIED", 1, json!({}), false);

        let entries = log.entries(None, None, 0, 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].category, AuditCategory::Security);
    }

    #[test]
    fn seq_ids_are_monotone_and_survive_eviction() {
        let mut config = all_on();
        config.max_entries = 3;
        let log = AuditLog::new(config);

        for i in 0..5 {
            log.log(AuditCategory::Syscall, "OP", i, json!({}), true);
        }

        let entries = log.entries(None, None, 0, 10);
        assert_eq!(entries.len(), 3);
        // The two oldest entries were evicted; seq ids keep counting.
        assert_eq!(entries[0].seq_id, 3);
        assert_eq!(entries[2].seq_id, 5);
    }

    #[test]
    fn filters_by_category_agent_and_since() {
        let log = AuditLog::new(all_on());
        log.log(AuditCategory::State, "STORE", 1, json!({}), true);
        log.log(AuditCategory::State, "STORE", 2, json!({}), true);
        log.log(AuditCategory::World, "JOIN", 1, json!({}), true);

        assert_eq!(log.entries(Some(AuditCategory::State), None, 0, 10).len(), 2);
        assert_eq!(log.entries(None, Some(1), 0, 10).len(), 2);
        assert_eq!(
            log.entries(Some(AuditCategory::State), Some(1), 0, 10).len(),
            1
        );
        assert_eq!(log.entries(None, None, 2, 10).len(), 1);
    }

    #[test]
    fn limit_caps_returned_entries() {
        let log = AuditLog::new(all_on());
        for _ in 0..10 {
            log.log(AuditCategory::Syscall, "OP", 1, json!({}), true);
        }
        assert_eq!(log.entries(None, None, 0, 4).len(), 4);
    }

    #[test]
    fn set_config_shrinks_ring() {
        let log = AuditLog::new(all_on());
        for _ in 0..50 {
            log.log(AuditCategory::Syscall, "OP", 1, json!({}), true);
        }
        let mut config = all_on();
        config.max_entries = 16;
        log.set_config(config);
        assert_eq!(log.len(), 16);
    }

    #[test]
    fn entry_json_shape() {
        let log = AuditLog::new(all_on());
        log.log(
            AuditCategory::Security,
            "AUDIT_CONFIG_CHANGED",
            4,
            json!({"changed_by": 4}),
            true,
        );
        let json = log.entries(None, None, 0, 1)[0].to_json();
        assert_eq!(json["category"], "security");
        assert_eq!(json["action"], "AUDIT_CONFIG_CHANGED");
        assert_eq!(json["agent_id"], 4);
        assert_eq!(json["success"], true);
        assert!(json["seq_id"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn category_parse_roundtrip() {
        for cat in [
            AuditCategory::Syscall,
            AuditCategory::Security,
            AuditCategory::Lifecycle,
            AuditCategory::Ipc,
            AuditCategory::State,
            AuditCategory::Resource,
            AuditCategory::Network,
            AuditCategory::World,
        ] {
            assert_eq!(AuditCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(AuditCategory::parse("bogus"), None);
    }
}
