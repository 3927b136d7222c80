//! Relay tunnel bridge.
//!
//! The bridge owns a relay proxy child process and speaks newline-delimited
//! JSON with it over stdin/stdout. A reader task classifies each line:
//! `{"event": ...}` lines update bridge state (and, for `syscall` events,
//! enqueue the decoded request for the kernel to dispatch), while
//! `{"id": ...}` lines resolve the matching request waiter. The bridge
//! never calls back into the router directly; remote syscalls travel over
//! a one-way queue and responses return through `send_response`.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::config::TunnelConfig;

/// A syscall request received from a remote agent, decoded and ready for
/// dispatch by the kernel.
#[derive(Debug)]
pub struct RemoteSyscall {
    pub agent_id: u32,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// A remote agent currently connected through the relay.
#[derive(Debug, Clone)]
pub struct RemoteAgentInfo {
    pub agent_id: u32,
    pub name: String,
    pub connected_at_ms: i64,
}

/// Maximum lifecycle events retained for inspection.
const MAX_RECENT_EVENTS: usize = 100;

struct Waiters {
    pending: HashMap<u64, oneshot::Sender<Value>>,
}

/// Bridge to the out-of-process relay proxy.
pub struct TunnelBridge {
    config: Mutex<TunnelConfig>,
    running: AtomicBool,
    connected: AtomicBool,
    next_request_id: AtomicU64,
    waiters: Mutex<Waiters>,
    remote_agents: Mutex<HashMap<u32, RemoteAgentInfo>>,
    recent_events: Mutex<VecDeque<Value>>,
    last_error: Mutex<String>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    syscall_tx: mpsc::UnboundedSender<RemoteSyscall>,
    syscall_rx: Mutex<Option<mpsc::UnboundedReceiver<RemoteSyscall>>>,
}

impl TunnelBridge {
    pub fn new(config: TunnelConfig) -> Self {
        let (syscall_tx, syscall_rx) = mpsc::unbounded_channel();
        Self {
            config: Mutex::new(config),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            next_request_id: AtomicU64::new(1),
            waiters: Mutex::new(Waiters {
                pending: HashMap::new(),
            }),
            remote_agents: Mutex::new(HashMap::new()),
            recent_events: Mutex::new(VecDeque::new()),
            last_error: Mutex::new(String::new()),
            outbound_tx: Mutex::new(None),
            syscall_tx,
            syscall_rx: Mutex::new(None),
        }
    }

    /// Take the remote-syscall receiver. The kernel drains it and feeds
    /// each request through the router. May be taken once.
    pub fn take_syscall_receiver(&self) -> Option<mpsc::UnboundedReceiver<RemoteSyscall>> {
        self.syscall_rx.lock().unwrap().take()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the relay proxy subprocess and its reader/writer tasks.
    /// Idempotent: a running bridge is left alone.
    pub async fn ensure_started(self: &Arc<Self>) -> Result<(), String> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let proxy_command = self.config.lock().unwrap().proxy_command.clone();
        let mut child = match Command::new(&proxy_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(format!("failed to start relay proxy '{proxy_command}': {e}"));
            }
        };

        let mut stdin = child.stdin.take().expect("proxy stdin piped");
        let stdout = child.stdout.take().expect("proxy stdout piped");
        tracing::info!(proxy = %proxy_command, pid = child.id(), "relay proxy started");

        // Writer task: serialize outbound request lines onto the proxy's
        // stdin. Senders are sync-safe, so handlers can enqueue without
        // blocking.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        *self.outbound_tx.lock().unwrap() = Some(outbound_tx);
        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // Reader task: classify each line as event or response.
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(data) if data.get("event").is_some() => bridge.handle_event(&data),
                    Ok(data) if data.get("id").is_some() => bridge.handle_response(data),
                    Ok(_) => {}
                    Err(_) => {
                        tracing::debug!(line = %line, "invalid JSON from relay proxy");
                    }
                }
            }
            tracing::warn!("relay proxy stdout closed");
            bridge.running.store(false, Ordering::Release);
            bridge.connected.store(false, Ordering::Release);

            // Keep the child from lingering as a zombie.
            let _ = child.wait().await;
        });

        Ok(())
    }

    fn handle_event(&self, data: &Value) {
        let event = data.get("event").and_then(|e| e.as_str()).unwrap_or("");
        let event_data = data.get("data").cloned().unwrap_or_else(|| json!({}));

        match event {
            "agent_connected" => {
                let agent_id = event_data.get("agent_id").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let name = event_data
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                tracing::info!(agent_id, name = %name, "remote agent connected");
                self.remote_agents.lock().unwrap().insert(
                    agent_id,
                    RemoteAgentInfo {
                        agent_id,
                        name,
                        connected_at_ms: chrono::Utc::now().timestamp_millis(),
                    },
                );
            }
            "agent_disconnected" => {
                let agent_id = event_data.get("agent_id").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                tracing::info!(agent_id, "remote agent disconnected");
                self.remote_agents.lock().unwrap().remove(&agent_id);
            }
            "syscall" => {
                let agent_id = event_data.get("agent_id").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let opcode = event_data.get("opcode").and_then(|v| v.as_u64()).unwrap_or(0) as u8;
                let payload_b64 = event_data.get("payload").and_then(|v| v.as_str()).unwrap_or("");
                let payload = BASE64.decode(payload_b64).unwrap_or_default();
                tracing::debug!(agent_id, opcode, "syscall from remote agent");
                let _ = self.syscall_tx.send(RemoteSyscall {
                    agent_id,
                    opcode,
                    payload,
                });
            }
            "disconnected" => {
                tracing::warn!("tunnel disconnected from relay");
                self.connected.store(false, Ordering::Release);
            }
            "reconnected" => {
                tracing::info!("tunnel reconnected to relay");
                self.connected.store(true, Ordering::Release);
            }
            "error" => {
                let message = event_data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                tracing::error!(error = %message, "tunnel error");
                *self.last_error.lock().unwrap() = message;
            }
            "ready" => {
                tracing::debug!("relay proxy ready");
            }
            other => {
                tracing::debug!(event = other, "unknown tunnel event, ignoring");
                return;
            }
        }

        let mut recent = self.recent_events.lock().unwrap();
        recent.push_back(json!({
            "event": event,
            "data": event_data,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        }));
        while recent.len() > MAX_RECENT_EVENTS {
            recent.pop_front();
        }
    }

    fn handle_response(&self, response: Value) {
        let Some(id) = response.get("id").and_then(|v| v.as_u64()) else {
            return;
        };
        if let Some(waiter) = self.waiters.lock().unwrap().pending.remove(&id) {
            let _ = waiter.send(response);
        }
    }

    /// Enqueue a request line without waiting for the reply.
    fn send_request(&self, method: &str, params: Value) -> Result<u64, String> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let line = json!({"id": id, "method": method, "params": params}).to_string();
        let tx = self.outbound_tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return Err("tunnel proxy not running".to_string());
        };
        tx.send(line).map_err(|_| "tunnel proxy not running".to_string())?;
        Ok(id)
    }

    /// Send a request and wait for its reply, up to `timeout`.
    async fn send_request_and_wait(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, String> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().pending.insert(id, tx);

        let line = json!({"id": id, "method": method, "params": params}).to_string();
        {
            let outbound = self.outbound_tx.lock().unwrap();
            let Some(outbound) = outbound.as_ref() else {
                self.waiters.lock().unwrap().pending.remove(&id);
                return Err("tunnel proxy not running".to_string());
            };
            if outbound.send(line).is_err() {
                self.waiters.lock().unwrap().pending.remove(&id);
                return Err("tunnel proxy not running".to_string());
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err("tunnel proxy closed".to_string()),
            Err(_) => {
                self.waiters.lock().unwrap().pending.remove(&id);
                Err(format!("tunnel request '{method}' timed out"))
            }
        }
    }

    fn result_success(response: &Value) -> bool {
        response
            .get("result")
            .and_then(|r| r.get("success"))
            .and_then(|s| s.as_bool())
            .unwrap_or(false)
    }

    /// Configure the proxy and connect to the relay server.
    pub async fn connect(self: &Arc<Self>) -> Result<(), String> {
        self.ensure_started().await?;

        let config = self.config.lock().unwrap().clone();
        if config.relay_url.is_empty() {
            return Err("relay_url not configured".to_string());
        }

        let configure_params = json!({
            "relay_url": config.relay_url,
            "machine_id": config.machine_id,
            "token": config.machine_token,
            "reconnect_interval": config.reconnect_interval_secs,
        });
        let response = self
            .send_request_and_wait("configure", configure_params, Duration::from_secs(5))
            .await?;
        if !Self::result_success(&response) {
            return Err("relay proxy rejected configuration".to_string());
        }

        let response = self
            .send_request_and_wait("connect", json!({}), Duration::from_secs(30))
            .await?;
        if Self::result_success(&response) {
            self.connected.store(true, Ordering::Release);
            tracing::info!(relay_url = %config.relay_url, "tunnel connected");
            Ok(())
        } else {
            let error = response
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            *self.last_error.lock().unwrap() = error.clone();
            Err(format!("tunnel connect failed: {error}"))
        }
    }

    /// Disconnect from the relay. Remote agents are forgotten.
    pub async fn disconnect(&self) -> Result<(), String> {
        if !self.is_running() {
            return Err("tunnel proxy not running".to_string());
        }
        let _ = self
            .send_request_and_wait("disconnect", json!({}), Duration::from_secs(5))
            .await;
        self.connected.store(false, Ordering::Release);
        self.remote_agents.lock().unwrap().clear();
        tracing::info!("tunnel disconnected");
        Ok(())
    }

    /// Return a base64-encoded response for a remote agent's syscall.
    pub fn send_response(&self, agent_id: u32, opcode: u8, payload: &[u8]) -> Result<(), String> {
        if !self.is_running() {
            return Err("tunnel proxy not running".to_string());
        }
        self.send_request(
            "send_response",
            json!({
                "agent_id": agent_id,
                "opcode": opcode,
                "payload": BASE64.encode(payload),
            }),
        )?;
        Ok(())
    }

    /// Update tunnel settings; a running proxy is reconfigured in place.
    pub fn set_config(&self, update: impl FnOnce(&mut TunnelConfig)) {
        let params = {
            let mut config = self.config.lock().unwrap();
            update(&mut config);
            json!({
                "relay_url": config.relay_url,
                "machine_id": config.machine_id,
                "token": config.machine_token,
                "reconnect_interval": config.reconnect_interval_secs,
            })
        };
        if self.is_running() {
            let _ = self.send_request("configure", params);
        }
    }

    pub fn config_snapshot(&self) -> TunnelConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn status(&self) -> Value {
        let config = self.config.lock().unwrap();
        json!({
            "connected": self.is_connected(),
            "relay_url": config.relay_url,
            "machine_id": config.machine_id,
            "remote_agent_count": self.remote_agents.lock().unwrap().len(),
            "error": self.last_error.lock().unwrap().clone(),
        })
    }

    pub fn list_remote_agents(&self) -> Vec<RemoteAgentInfo> {
        let mut agents: Vec<RemoteAgentInfo> =
            self.remote_agents.lock().unwrap().values().cloned().collect();
        agents.sort_by_key(|a| a.agent_id);
        agents
    }

    pub fn recent_events(&self) -> Vec<Value> {
        self.recent_events.lock().unwrap().iter().cloned().collect()
    }

    /// Ask the proxy to shut down and mark the bridge stopped.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.send_request("shutdown", json!({}));
        self.connected.store(false, Ordering::Release);
        *self.outbound_tx.lock().unwrap() = None;
        tracing::info!("tunnel bridge shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bridge() -> Arc<TunnelBridge> {
        Arc::new(TunnelBridge::new(TunnelConfig::default()))
    }

    #[test]
    fn syscall_event_is_decoded_and_queued() {
        let bridge = test_bridge();
        let mut rx = bridge.take_syscall_receiver().unwrap();

        bridge.handle_event(&json!({
            "event": "syscall",
            "data": {
                "agent_id": 1001,
                "opcode": 0x30,
                "payload": BASE64.encode(br#"{"key":"k","value":1}"#),
            },
        }));

        let syscall = rx.try_recv().unwrap();
        assert_eq!(syscall.agent_id, 1001);
        assert_eq!(syscall.opcode, 0x30);
        assert_eq!(syscall.payload, br#"{"key":"k","value":1}"#);
    }

    #[test]
    fn agent_connect_disconnect_tracks_remotes() {
        let bridge = test_bridge();

        bridge.handle_event(&json!({
            "event": "agent_connected",
            "data": {"agent_id": 7, "name": "remote-7"},
        }));
        let remotes = bridge.list_remote_agents();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].name, "remote-7");

        bridge.handle_event(&json!({
            "event": "agent_disconnected",
            "data": {"agent_id": 7},
        }));
        assert!(bridge.list_remote_agents().is_empty());
    }

    #[test]
    fn connection_state_follows_events() {
        let bridge = test_bridge();
        assert!(!bridge.is_connected());

        bridge.handle_event(&json!({"event": "reconnected", "data": {}}));
        assert!(bridge.is_connected());

        bridge.handle_event(&json!({"event": "disconnected", "data": {}}));
        assert!(!bridge.is_connected());
    }

    #[test]
    fn error_event_is_surfaced_in_status() {
        let bridge = test_bridge();
        bridge.handle_event(&json!({
            "event": "error",
            "data": {"message": "relay unreachable"},
        }));
        let status = bridge.status();
        assert_eq!(status["error"], "relay unreachable");
        assert_eq!(status["connected"], false);
    }

    #[test]
    fn response_resolves_matching_waiter() {
        let bridge = test_bridge();
        let (tx, mut rx) = oneshot::channel();
        bridge.waiters.lock().unwrap().pending.insert(42, tx);

        bridge.handle_response(json!({"id": 42, "result": {"success": true}}));
        let response = rx.try_recv().unwrap();
        assert!(TunnelBridge::result_success(&response));

        // Unknown ids are ignored.
        bridge.handle_response(json!({"id": 999, "result": {}}));
    }

    #[test]
    fn send_without_proxy_reports_not_running() {
        let bridge = test_bridge();
        assert!(bridge.send_response(1, 0x30, b"{}").is_err());
        assert!(bridge.send_request("configure", json!({})).is_err());
    }

    #[test]
    fn recent_events_are_capped() {
        let bridge = test_bridge();
        for _ in 0..(MAX_RECENT_EVENTS + 20) {
            bridge.handle_event(&json!({"event": "ready", "data": {}}));
        }
        assert_eq!(bridge.recent_events().len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn set_config_updates_snapshot() {
        let bridge = test_bridge();
        bridge.set_config(|config| {
            config.relay_url = "ws://relay:9100".to_string();
            config.machine_id = "m1".to_string();
        });
        let snapshot = bridge.config_snapshot();
        assert_eq!(snapshot.relay_url, "ws://relay:9100");
        assert_eq!(snapshot.machine_id, "m1");
    }

    #[tokio::test]
    async fn connect_requires_relay_url() {
        // An empty relay_url fails before any proxy interaction, using a
        // bridge whose proxy command would not exist anyway.
        let bridge = Arc::new(TunnelBridge::new(TunnelConfig {
            proxy_command: "cat".to_string(),
            ..TunnelConfig::default()
        }));
        let err = bridge.connect().await.unwrap_err();
        assert!(err.contains("relay_url"));
        bridge.shutdown();
    }
}
