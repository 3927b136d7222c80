//! Per-agent capability records and preset levels.
//!
//! Path predicates are glob allow-lists evaluated by the file syscall
//! handlers before any I/O. Cross-agent mutation requires the caller to
//! hold `can_spawn`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::glob;

/// Preset capability levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Unrestricted,
    Standard,
    Sandboxed,
    Readonly,
    Minimal,
}

impl PermissionLevel {
    /// Unknown level strings degrade to `Standard`.
    pub fn parse(s: &str) -> PermissionLevel {
        match s {
            "unrestricted" => PermissionLevel::Unrestricted,
            "sandboxed" => PermissionLevel::Sandboxed,
            "readonly" => PermissionLevel::Readonly,
            "minimal" => PermissionLevel::Minimal,
            _ => PermissionLevel::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Unrestricted => "unrestricted",
            PermissionLevel::Standard => "standard",
            PermissionLevel::Sandboxed => "sandboxed",
            PermissionLevel::Readonly => "readonly",
            PermissionLevel::Minimal => "minimal",
        }
    }
}

/// Capability set for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPermissions {
    pub level: PermissionLevel,
    pub can_spawn: bool,
    pub can_exec: bool,
    pub can_network: bool,
    /// Glob allow-list for READ paths.
    pub read_paths: Vec<String>,
    /// Glob allow-list for WRITE paths.
    pub write_paths: Vec<String>,
}

impl Default for AgentPermissions {
    fn default() -> Self {
        AgentPermissions::from_level(PermissionLevel::Standard)
    }
}

impl AgentPermissions {
    pub fn from_level(level: PermissionLevel) -> Self {
        match level {
            PermissionLevel::Unrestricted => Self {
                level,
                can_spawn: true,
                can_exec: true,
                can_network: true,
                read_paths: vec!["/**".into()],
                write_paths: vec!["/**".into()],
            },
            PermissionLevel::Standard => Self {
                level,
                can_spawn: false,
                can_exec: true,
                can_network: true,
                read_paths: vec!["/**".into()],
                write_paths: vec!["/tmp/**".into(), "/var/tmp/**".into()],
            },
            PermissionLevel::Sandboxed => Self {
                level,
                can_spawn: false,
                can_exec: false,
                can_network: false,
                read_paths: vec!["/tmp/roost/**".into()],
                write_paths: vec!["/tmp/roost/**".into()],
            },
            PermissionLevel::Readonly => Self {
                level,
                can_spawn: false,
                can_exec: false,
                can_network: false,
                read_paths: vec!["/**".into()],
                write_paths: Vec::new(),
            },
            PermissionLevel::Minimal => Self {
                level,
                can_spawn: false,
                can_exec: false,
                can_network: false,
                read_paths: Vec::new(),
                write_paths: Vec::new(),
            },
        }
    }

    pub fn can_read_path(&self, path: &str) -> bool {
        glob::matches_any(path, &self.read_paths)
    }

    pub fn can_write_path(&self, path: &str) -> bool {
        glob::matches_any(path, &self.write_paths)
    }
}

/// Store of per-agent permission records.
#[derive(Default)]
pub struct PermissionsStore {
    records: Mutex<HashMap<u32, AgentPermissions>>,
}

impl PermissionsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The agent's record, initialized to the Standard preset on first use.
    pub fn get_or_create(&self, agent_id: u32) -> AgentPermissions {
        let mut records = self.records.lock().unwrap();
        records.entry(agent_id).or_default().clone()
    }

    pub fn set_permissions(&self, agent_id: u32, perms: AgentPermissions) {
        self.records.lock().unwrap().insert(agent_id, perms);
    }

    pub fn set_level(&self, agent_id: u32, level: PermissionLevel) {
        self.records
            .lock()
            .unwrap()
            .insert(agent_id, AgentPermissions::from_level(level));
    }
}
