//! Execution recording and deterministic replay.
//!
//! While recording, the reactor feeds every dispatched request into the
//! log (subject to the opcode/agent filter). A recording can be exported
//! as JSON, imported back, and replayed: entries are re-dispatched through
//! the router in order on an async-pool worker, with progress observable
//! via REPLAY_STATUS. Recording/replay-control and tunnel opcodes are
//! never re-executed; they count as skipped.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use roost_protocol::SyscallOp;

/// What gets captured while recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub include_think: bool,
    pub include_http: bool,
    pub include_exec: bool,
    pub max_entries: usize,
    /// Empty means all agents.
    pub filter_agents: Vec<u32>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            include_think: true,
            include_http: true,
            include_exec: true,
            max_entries: 10_000,
            filter_agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

impl ReplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayState::Idle => "idle",
            ReplayState::Running => "running",
            ReplayState::Paused => "paused",
            ReplayState::Completed => "completed",
            ReplayState::Error => "error",
        }
    }
}

/// One recorded syscall request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub seq_id: u64,
    pub timestamp_ms: i64,
    pub agent_id: u32,
    pub opcode: u8,
    pub payload: String,
}

/// Replay progress snapshot.
#[derive(Debug, Clone)]
pub struct ReplayProgress {
    pub state: ReplayState,
    pub total_entries: usize,
    pub current_entry: usize,
    pub entries_replayed: usize,
    pub entries_skipped: usize,
    pub last_error: String,
}

impl Default for ReplayProgress {
    fn default() -> Self {
        Self {
            state: ReplayState::Idle,
            total_entries: 0,
            current_entry: 0,
            entries_replayed: 0,
            entries_skipped: 0,
            last_error: String::new(),
        }
    }
}

/// Opcodes that must not be re-executed during replay: replaying them
/// would recurse into the recorder or drive the tunnel from stale state.
pub fn skip_on_replay(op: SyscallOp) -> bool {
    matches!(
        op,
        SyscallOp::RecordStart
            | SyscallOp::RecordStop
            | SyscallOp::RecordStatus
            | SyscallOp::ReplayStart
            | SyscallOp::ReplayStatus
            | SyscallOp::TunnelConnect
            | SyscallOp::TunnelDisconnect
            | SyscallOp::TunnelStatus
            | SyscallOp::TunnelListRemotes
            | SyscallOp::TunnelConfig
            | SyscallOp::Exit
    )
}

struct Inner {
    config: RecordingConfig,
    recording_state: RecordingState,
    entries: VecDeque<ExecutionEntry>,
    next_seq_id: u64,
    replay: ReplayProgress,
}

/// The execution log: recorder state plus replay progress.
pub struct ExecutionLog {
    inner: Mutex<Inner>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                config: RecordingConfig::default(),
                recording_state: RecordingState::Idle,
                entries: VecDeque::new(),
                next_seq_id: 1,
                replay: ReplayProgress::default(),
            }),
        }
    }

    pub fn config(&self) -> RecordingConfig {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn set_config(&self, config: RecordingConfig) {
        self.inner.lock().unwrap().config = config;
    }

    pub fn recording_state(&self) -> RecordingState {
        self.inner.lock().unwrap().recording_state
    }

    /// Begin recording. Clears previously captured entries.
    pub fn start_recording(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.recording_state == RecordingState::Recording {
            return false;
        }
        inner.entries.clear();
        inner.next_seq_id = 1;
        inner.recording_state = RecordingState::Recording;
        true
    }

    pub fn stop_recording(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.recording_state == RecordingState::Idle {
            return false;
        }
        inner.recording_state = RecordingState::Idle;
        true
    }

    /// Capture a dispatched request if recording and the filter admits it.
    pub fn record(&self, agent_id: u32, opcode: SyscallOp, payload: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.recording_state != RecordingState::Recording {
            return;
        }
        let admitted = match opcode {
            SyscallOp::Think => inner.config.include_think,
            SyscallOp::Http => inner.config.include_http,
            SyscallOp::Exec => inner.config.include_exec,
            _ => true,
        };
        if !admitted {
            return;
        }
        if !inner.config.filter_agents.is_empty()
            && !inner.config.filter_agents.contains(&agent_id)
        {
            return;
        }
        let seq_id = inner.next_seq_id;
        inner.next_seq_id += 1;
        inner.entries.push_back(ExecutionEntry {
            seq_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            agent_id,
            opcode: opcode as u8,
            payload: payload.to_string(),
        });
        let cap = inner.config.max_entries;
        while inner.entries.len() > cap {
            inner.entries.pop_front();
        }
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn last_seq_id(&self) -> u64 {
        self.inner.lock().unwrap().next_seq_id - 1
    }

    pub fn entries_page(&self, since_id: u64, limit: usize) -> Vec<ExecutionEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.seq_id > since_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Serialize the captured entries as a portable recording.
    pub fn export_recording(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        serde_json::json!({
            "recording_id": uuid::Uuid::new_v4().to_string(),
            "exported_at": chrono::Utc::now().timestamp_millis(),
            "entry_count": inner.entries.len(),
            "entries": inner.entries.iter().cloned().collect::<Vec<_>>(),
        })
    }

    /// Replace the captured entries with an imported recording.
    pub fn import_recording(&self, data: &Value) -> bool {
        let Some(entries) = data.get("entries").and_then(|e| e.as_array()) else {
            return false;
        };
        let parsed: Result<Vec<ExecutionEntry>, _> = entries
            .iter()
            .map(|e| serde_json::from_value(e.clone()))
            .collect();
        let Ok(parsed) = parsed else {
            return false;
        };
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq_id = parsed.iter().map(|e| e.seq_id).max().unwrap_or(0) + 1;
        inner.entries = parsed.into();
        true
    }

    // -----------------------------------------------------------------------
    // Replay lifecycle
    // -----------------------------------------------------------------------

    /// Transition to Running and hand back the entries to iterate. Fails if
    /// a replay is already running or there is nothing to replay.
    pub fn begin_replay(&self) -> Result<Vec<ExecutionEntry>, String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.replay.state == ReplayState::Running {
            return Err("replay already running".to_string());
        }
        if inner.entries.is_empty() {
            inner.replay = ReplayProgress {
                state: ReplayState::Error,
                last_error: "no entries to replay".to_string(),
                ..ReplayProgress::default()
            };
            return Err("no entries to replay".to_string());
        }
        let entries: Vec<ExecutionEntry> = inner.entries.iter().cloned().collect();
        inner.replay = ReplayProgress {
            state: ReplayState::Running,
            total_entries: entries.len(),
            ..ReplayProgress::default()
        };
        Ok(entries)
    }

    /// Record progress over one entry.
    pub fn replay_step(&self, replayed: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.replay.current_entry += 1;
        if replayed {
            inner.replay.entries_replayed += 1;
        } else {
            inner.replay.entries_skipped += 1;
        }
    }

    pub fn finish_replay(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.replay.state = ReplayState::Completed;
    }

    pub fn fail_replay(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.replay.state = ReplayState::Error;
        inner.replay.last_error = error.to_string();
    }

    pub fn replay_progress(&self) -> ReplayProgress {
        self.inner.lock().unwrap().replay.clone()
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_captures_only_while_active() {
        let log = ExecutionLog::new();
        log.record(1, SyscallOp::Store, "{}");
        assert_eq!(log.entry_count(), 0);

        assert!(log.start_recording());
        log.record(1, SyscallOp::Store, r#"{"key":"k"}"#);
        assert_eq!(log.entry_count(), 1);

        assert!(log.stop_recording());
        log.record(1, SyscallOp::Store, "{}");
        assert_eq!(log.entry_count(), 1);
    }

    #[test]
    fn start_recording_clears_previous_capture() {
        let log = ExecutionLog::new();
        log.start_recording();
        log.record(1, SyscallOp::Store, "{}");
        log.stop_recording();

        log.start_recording();
        assert_eq!(log.entry_count(), 0);
        assert_eq!(log.last_seq_id(), 0);
    }

    #[test]
    fn include_flags_filter_opcodes() {
        let log = ExecutionLog::new();
        log.set_config(RecordingConfig {
            include_exec: false,
            include_http: false,
            ..RecordingConfig::default()
        });
        log.start_recording();
        log.record(1, SyscallOp::Exec, "{}");
        log.record(1, SyscallOp::Http, "{}");
        log.record(1, SyscallOp::Think, "{}");
        log.record(1, SyscallOp::Store, "{}");
        assert_eq!(log.entry_count(), 2);
    }

    #[test]
    fn agent_filter_limits_capture() {
        let log = ExecutionLog::new();
        log.set_config(RecordingConfig {
            filter_agents: vec![2],
            ..RecordingConfig::default()
        });
        log.start_recording();
        log.record(1, SyscallOp::Store, "{}");
        log.record(2, SyscallOp::Store, "{}");
        assert_eq!(log.entry_count(), 1);
        assert_eq!(log.entries_page(0, 10)[0].agent_id, 2);
    }

    #[test]
    fn export_import_preserves_entry_order() {
        let log = ExecutionLog::new();
        log.start_recording();
        for n in 0..3 {
            log.record(1, SyscallOp::Store, &format!("{{\"n\":{n}}}"));
        }
        log.stop_recording();
        let exported = log.export_recording();
        assert_eq!(exported["entry_count"], 3);

        let other = ExecutionLog::new();
        assert!(other.import_recording(&exported));
        assert_eq!(other.entry_count(), 3);
        let entries = other.entries_page(0, 10);
        assert_eq!(entries[0].payload, "{\"n\":0}");
        assert_eq!(entries[2].payload, "{\"n\":2}");
        assert_eq!(entries[0].seq_id, 1);
    }

    #[test]
    fn import_rejects_malformed_data() {
        let log = ExecutionLog::new();
        assert!(!log.import_recording(&serde_json::json!({"nope": true})));
        assert!(!log.import_recording(&serde_json::json!({"entries": [{"bad": 1}]})));
    }

    #[test]
    fn replay_lifecycle_tracks_progress() {
        let log = ExecutionLog::new();
        log.start_recording();
        log.record(1, SyscallOp::Store, "{}");
        log.record(1, SyscallOp::RecordStatus, "{}");
        log.stop_recording();

        let entries = log.begin_replay().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(log.replay_progress().state, ReplayState::Running);

        log.replay_step(true);
        log.replay_step(false);
        log.finish_replay();

        let progress = log.replay_progress();
        assert_eq!(progress.state, ReplayState::Completed);
        assert_eq!(progress.total_entries, 2);
        assert_eq!(progress.current_entry, 2);
        assert_eq!(progress.entries_replayed, 1);
        assert_eq!(progress.entries_skipped, 1);
    }

    #[test]
    fn replay_with_no_entries_errors() {
        let log = ExecutionLog::new();
        assert!(log.begin_replay().is_err());
        let progress = log.replay_progress();
        assert_eq!(progress.state, ReplayState::Error);
        assert_eq!(progress.last_error, "no entries to replay");
    }

    #[test]
    fn replay_control_opcodes_are_skipped() {
        assert!(skip_on_replay(SyscallOp::RecordStart));
        assert!(skip_on_replay(SyscallOp::ReplayStart));
        assert!(skip_on_replay(SyscallOp::TunnelConnect));
        assert!(!skip_on_replay(SyscallOp::Store));
        assert!(!skip_on_replay(SyscallOp::Send));
    }
}
