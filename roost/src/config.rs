use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::env;

/// Top-level configuration for the roost kernel daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub tunnel: TunnelConfig,
    pub audit: AuditConfig,
    pub limits: LimitsConfig,
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        env::load_dotenv();
        if let Some(path) = env::var("ROOST_SOCKET_PATH") {
            self.server.socket_path = PathBuf::from(path);
        }
        if let Some(url) = env::var("ROOST_RELAY_URL") {
            self.tunnel.relay_url = url;
        }
        if let Some(id) = env::var("ROOST_MACHINE_ID") {
            self.tunnel.machine_id = id;
        }
        if let Some(token) = env::var("ROOST_MACHINE_TOKEN") {
            self.tunnel.machine_token = token;
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.server.worker_threads >= 1,
            "server.worker_threads must be >= 1"
        );
        anyhow::ensure!(
            self.server.tick_interval_ms >= 10,
            "server.tick_interval_ms must be >= 10"
        );
        anyhow::ensure!(
            self.limits.max_payload_bytes as u64 <= roost_protocol::MAX_PAYLOAD_SIZE as u64,
            "limits.max_payload_bytes must not exceed the protocol maximum ({})",
            roost_protocol::MAX_PAYLOAD_SIZE
        );
        anyhow::ensure!(
            self.limits.max_payload_bytes >= 1024,
            "limits.max_payload_bytes must be >= 1024"
        );
        anyhow::ensure!(
            self.limits.exec_timeout_secs >= 1,
            "limits.exec_timeout_secs must be >= 1"
        );
        anyhow::ensure!(self.audit.max_entries >= 16, "audit.max_entries must be >= 16");
        Ok(())
    }
}

/// Socket server and dispatch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path of the Unix stream socket agents connect to.
    pub socket_path: PathBuf,
    /// Worker threads in the async task pool (blocking syscalls).
    pub worker_threads: usize,
    /// Supervisor tick interval in milliseconds (reap + pending restarts).
    pub tick_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(roost_protocol::DEFAULT_SOCKET_PATH),
            worker_threads: 4,
            tick_interval_ms: 500,
        }
    }
}

/// Sandbox wrapping for spawned agents. The sandbox itself is an external
/// tool; when configured, the agent argv is prefixed with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enable_sandboxing: bool,
    /// Wrapper command, e.g. "bwrap" or a site-specific launcher script.
    pub sandbox_command: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enable_sandboxing: true,
            sandbox_command: None,
        }
    }
}

/// Relay tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Command used to start the relay proxy subprocess.
    pub proxy_command: String,
    /// Relay server URL (ws://...).
    pub relay_url: String,
    /// This machine's identity at the relay.
    pub machine_id: String,
    /// Authentication token presented to the relay.
    pub machine_token: String,
    /// Connect to the relay at startup.
    pub auto_connect: bool,
    /// Proxy-side reconnect interval in seconds.
    pub reconnect_interval_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            proxy_command: "roost-relay".into(),
            relay_url: String::new(),
            machine_id: String::new(),
            machine_token: String::new(),
            auto_connect: false,
            reconnect_interval_secs: 5,
        }
    }
}

/// Initial audit log configuration (mutable at runtime via SET_AUDIT_CONFIG).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub max_entries: usize,
    pub log_syscalls: bool,
    pub log_security: bool,
    pub log_lifecycle: bool,
    pub log_ipc: bool,
    pub log_state: bool,
    pub log_resource: bool,
    pub log_network: bool,
    pub log_world: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            log_syscalls: false,
            log_security: true,
            log_lifecycle: true,
            log_ipc: false,
            log_state: false,
            log_resource: true,
            log_network: false,
            log_world: true,
        }
    }
}

/// Resource limits for individual syscalls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Per-frame payload cap; must not exceed the protocol maximum.
    pub max_payload_bytes: u32,
    /// Default timeout for EXEC commands.
    pub exec_timeout_secs: u64,
    /// Timeout for passthrough HTTP requests.
    pub http_timeout_secs: u64,
    /// Captured stdout/stderr cap per EXEC (bytes).
    pub max_exec_output_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: roost_protocol::MAX_PAYLOAD_SIZE,
            exec_timeout_secs: 120,
            http_timeout_secs: 30,
            max_exec_output_bytes: 2 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(
            config.server.socket_path,
            PathBuf::from("/tmp/roost.sock")
        );
        assert_eq!(config.server.worker_threads, 4);
        assert_eq!(config.server.tick_interval_ms, 500);
        assert!(config.sandbox.enable_sandboxing);
        assert!(config.sandbox.sandbox_command.is_none());
        assert!(!config.tunnel.auto_connect);
        assert_eq!(config.tunnel.reconnect_interval_secs, 5);
        assert_eq!(config.audit.max_entries, 10_000);
        assert_eq!(config.limits.exec_timeout_secs, 120);
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let toml_content = r#"
[server]
socket_path = "/run/roost/test.sock"
worker_threads = 2

[tunnel]
relay_url = "ws://relay.example:9100"
auto_connect = true

[limits]
exec_timeout_secs = 30
"#;
        let path = std::env::temp_dir().join(format!("roost-test-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.server.socket_path, PathBuf::from("/run/roost/test.sock"));
        assert_eq!(config.server.worker_threads, 2);
        // Unset fields use defaults
        assert_eq!(config.server.tick_interval_ms, 500);
        assert_eq!(config.tunnel.relay_url, "ws://relay.example:9100");
        assert!(config.tunnel.auto_connect);
        assert_eq!(config.limits.exec_timeout_secs, 30);
    }

    #[test]
    fn config_validation_rejects_zero_workers() {
        let mut config = Config::default();
        config.server.worker_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_oversized_payload_cap() {
        let mut config = Config::default();
        config.limits.max_payload_bytes = roost_protocol::MAX_PAYLOAD_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_tiny_audit_ring() {
        let mut config = Config::default();
        config.audit.max_entries = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.server.socket_path, config.server.socket_path);
        assert_eq!(deserialized.limits.max_payload_bytes, config.limits.max_payload_bytes);
        assert_eq!(deserialized.audit.max_entries, config.audit.max_entries);
    }
}
