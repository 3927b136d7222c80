use serde::{Deserialize, Serialize};

/// Default path of the kernel's Unix stream socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/roost.sock";

/// Frame magic, little-endian "RST1".
pub const MAGIC: u32 = u32::from_le_bytes(*b"RST1");

/// Current protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes: magic(4) + version(1) + opcode(1) + agent_id(4) + len(4).
pub const HEADER_SIZE: usize = 14;

/// Maximum payload size (1 MiB) to prevent unbounded allocations.
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Framing: each message is a fixed 14-byte header followed by the payload.
/// All header integers are little-endian. Payloads are by convention UTF-8
/// JSON objects, but the envelope itself is opaque bytes.

// ---------------------------------------------------------------------------
// Syscall opcodes
// ---------------------------------------------------------------------------

/// System call operations handled by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyscallOp {
    /// Echo / connectivity test.
    Noop = 0x00,
    /// Prompt an LLM (delegated to an external service; always unavailable).
    Think = 0x01,
    /// Execute a host command.
    Exec = 0x02,
    /// Read a file (virtual or host).
    Read = 0x03,
    /// Write a file (virtual or host).
    Write = 0x04,

    /// Spawn a sandboxed agent process.
    Spawn = 0x10,
    /// Kill an agent.
    Kill = 0x11,
    /// List supervised agents.
    List = 0x12,
    /// Pause an agent (SIGSTOP).
    Pause = 0x14,
    /// Resume a paused agent (SIGCONT).
    Resume = 0x15,

    /// Send a message to another agent's mailbox.
    Send = 0x20,
    /// Drain pending mailbox messages.
    Recv = 0x21,
    /// Broadcast a message to every known agent.
    Broadcast = 0x22,
    /// Bind a unique name to the calling agent.
    Register = 0x23,

    /// Store a key-value pair.
    Store = 0x30,
    /// Fetch a value by key.
    Fetch = 0x31,
    /// Delete a key.
    Delete = 0x32,
    /// List accessible keys with optional prefix.
    Keys = 0x33,

    /// Get own permissions.
    GetPerms = 0x40,
    /// Set permissions or a preset level.
    SetPerms = 0x41,

    /// Make an HTTP request (mocked inside a world).
    Http = 0x50,

    /// Subscribe to kernel event types.
    Subscribe = 0x60,
    /// Unsubscribe from event types (or all).
    Unsubscribe = 0x61,
    /// Drain pending events.
    PollEvents = 0x62,
    /// Emit a custom event.
    Emit = 0x63,

    /// Start recording syscall execution.
    RecordStart = 0x70,
    /// Stop recording.
    RecordStop = 0x71,
    /// Recording status and optional export.
    RecordStatus = 0x72,
    /// Start replaying an imported recording.
    ReplayStart = 0x73,
    /// Replay progress.
    ReplayStatus = 0x74,

    /// Read audit log entries.
    GetAuditLog = 0x76,
    /// Change audit logging configuration.
    SetAuditConfig = 0x77,

    /// Drain completed async syscall results.
    AsyncPoll = 0x80,

    /// Create a simulation world.
    WorldCreate = 0xA0,
    /// Destroy a world.
    WorldDestroy = 0xA1,
    /// List worlds.
    WorldList = 0xA2,
    /// Join the calling agent to a world.
    WorldJoin = 0xA3,
    /// Leave the current world.
    WorldLeave = 0xA4,
    /// Inject a chaos event into a world.
    WorldEvent = 0xA5,
    /// World metrics bundle.
    WorldState = 0xA6,
    /// Serialize a whole world.
    WorldSnapshot = 0xA7,
    /// Rebuild a world from a snapshot.
    WorldRestore = 0xA8,

    /// Connect the kernel to its relay proxy.
    TunnelConnect = 0xB0,
    /// Disconnect from the relay.
    TunnelDisconnect = 0xB1,
    /// Tunnel connection status.
    TunnelStatus = 0xB2,
    /// List connected remote agents.
    TunnelListRemotes = 0xB3,
    /// Update tunnel settings.
    TunnelConfig = 0xB4,

    /// System-wide kernel metrics.
    MetricsSystem = 0xC0,
    /// Metrics for one agent.
    MetricsAgent = 0xC1,
    /// Metrics for all agents.
    MetricsAllAgents = 0xC2,
    /// Cgroup metrics (external collector; reported unavailable).
    MetricsCgroup = 0xC3,

    /// Handshake: returns the assigned agent id.
    Hello = 0xFE,
    /// Graceful connection shutdown.
    Exit = 0xFF,
}

impl SyscallOp {
    /// Stable human-readable name used in logs and async poll results.
    pub fn name(&self) -> &'static str {
        match self {
            SyscallOp::Noop => "NOOP",
            SyscallOp::Think => "THINK",
            SyscallOp::Exec => "EXEC",
            SyscallOp::Read => "READ",
            SyscallOp::Write => "WRITE",
            SyscallOp::Spawn => "SPAWN",
            SyscallOp::Kill => "KILL",
            SyscallOp::List => "LIST",
            SyscallOp::Pause => "PAUSE",
            SyscallOp::Resume => "RESUME",
            SyscallOp::Send => "SEND",
            SyscallOp::Recv => "RECV",
            SyscallOp::Broadcast => "BROADCAST",
            SyscallOp::Register => "REGISTER",
            SyscallOp::Store => "STORE",
            SyscallOp::Fetch => "FETCH",
            SyscallOp::Delete => "DELETE",
            SyscallOp::Keys => "KEYS",
            SyscallOp::GetPerms => "GET_PERMS",
            SyscallOp::SetPerms => "SET_PERMS",
            SyscallOp::Http => "HTTP",
            SyscallOp::Subscribe => "SUBSCRIBE",
            SyscallOp::Unsubscribe => "UNSUBSCRIBE",
            SyscallOp::PollEvents => "POLL_EVENTS",
            SyscallOp::Emit => "EMIT",
            SyscallOp::RecordStart => "RECORD_START",
            SyscallOp::RecordStop => "RECORD_STOP",
            SyscallOp::RecordStatus => "RECORD_STATUS",
            SyscallOp::ReplayStart => "REPLAY_START",
            SyscallOp::ReplayStatus => "REPLAY_STATUS",
            SyscallOp::GetAuditLog => "GET_AUDIT_LOG",
            SyscallOp::SetAuditConfig => "SET_AUDIT_CONFIG",
            SyscallOp::AsyncPoll => "ASYNC_POLL",
            SyscallOp::WorldCreate => "WORLD_CREATE",
            SyscallOp::WorldDestroy => "WORLD_DESTROY",
            SyscallOp::WorldList => "WORLD_LIST",
            SyscallOp::WorldJoin => "WORLD_JOIN",
            SyscallOp::WorldLeave => "WORLD_LEAVE",
            SyscallOp::WorldEvent => "WORLD_EVENT",
            SyscallOp::WorldState => "WORLD_STATE",
            SyscallOp::WorldSnapshot => "WORLD_SNAPSHOT",
            SyscallOp::WorldRestore => "WORLD_RESTORE",
            SyscallOp::TunnelConnect => "TUNNEL_CONNECT",
            SyscallOp::TunnelDisconnect => "TUNNEL_DISCONNECT",
            SyscallOp::TunnelStatus => "TUNNEL_STATUS",
            SyscallOp::TunnelListRemotes => "TUNNEL_LIST_REMOTES",
            SyscallOp::TunnelConfig => "TUNNEL_CONFIG",
            SyscallOp::MetricsSystem => "METRICS_SYSTEM",
            SyscallOp::MetricsAgent => "METRICS_AGENT",
            SyscallOp::MetricsAllAgents => "METRICS_ALL_AGENTS",
            SyscallOp::MetricsCgroup => "METRICS_CGROUP",
            SyscallOp::Hello => "HELLO",
            SyscallOp::Exit => "EXIT",
        }
    }

    /// Every opcode, in wire-value order. Used for capability reporting.
    pub const ALL: &'static [SyscallOp] = &[
        SyscallOp::Noop,
        SyscallOp::Think,
        SyscallOp::Exec,
        SyscallOp::Read,
        SyscallOp::Write,
        SyscallOp::Spawn,
        SyscallOp::Kill,
        SyscallOp::List,
        SyscallOp::Pause,
        SyscallOp::Resume,
        SyscallOp::Send,
        SyscallOp::Recv,
        SyscallOp::Broadcast,
        SyscallOp::Register,
        SyscallOp::Store,
        SyscallOp::Fetch,
        SyscallOp::Delete,
        SyscallOp::Keys,
        SyscallOp::GetPerms,
        SyscallOp::SetPerms,
        SyscallOp::Http,
        SyscallOp::Subscribe,
        SyscallOp::Unsubscribe,
        SyscallOp::PollEvents,
        SyscallOp::Emit,
        SyscallOp::RecordStart,
        SyscallOp::RecordStop,
        SyscallOp::RecordStatus,
        SyscallOp::ReplayStart,
        SyscallOp::ReplayStatus,
        SyscallOp::GetAuditLog,
        SyscallOp::SetAuditConfig,
        SyscallOp::AsyncPoll,
        SyscallOp::WorldCreate,
        SyscallOp::WorldDestroy,
        SyscallOp::WorldList,
        SyscallOp::WorldJoin,
        SyscallOp::WorldLeave,
        SyscallOp::WorldEvent,
        SyscallOp::WorldState,
        SyscallOp::WorldSnapshot,
        SyscallOp::WorldRestore,
        SyscallOp::TunnelConnect,
        SyscallOp::TunnelDisconnect,
        SyscallOp::TunnelStatus,
        SyscallOp::TunnelListRemotes,
        SyscallOp::TunnelConfig,
        SyscallOp::MetricsSystem,
        SyscallOp::MetricsAgent,
        SyscallOp::MetricsAllAgents,
        SyscallOp::MetricsCgroup,
        SyscallOp::Hello,
        SyscallOp::Exit,
    ];
}

impl TryFrom<u8> for SyscallOp {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        for op in SyscallOp::ALL {
            if *op as u8 == value {
                return Ok(*op);
            }
        }
        Err(FrameError::UnknownOpcode(value))
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Errors produced while decoding a frame from raw bytes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer too short: {0} bytes (header is {HEADER_SIZE})")]
    Truncated(usize),
    #[error("bad magic: 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(u32),
}

/// One syscall request or response on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub agent_id: u32,
    pub opcode: SyscallOp,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(agent_id: u32, opcode: SyscallOp, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            agent_id,
            opcode,
            payload: payload.into(),
        }
    }

    /// Build a frame whose payload is a serialized JSON value.
    pub fn json(agent_id: u32, opcode: SyscallOp, body: &serde_json::Value) -> Self {
        Self::new(agent_id, opcode, body.to_string().into_bytes())
    }

    /// Payload interpreted as UTF-8, with invalid sequences replaced.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Serialize to wire format: 14-byte header plus payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.push(PROTOCOL_VERSION);
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&self.agent_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame header from a byte buffer.
    ///
    /// Returns the decoded frame and the number of bytes consumed. The
    /// buffer must contain the complete payload; callers doing stream reads
    /// should use [`decode_header`] first to learn the payload length.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
        let (opcode, agent_id, len) = decode_header(buf)?;
        let total = HEADER_SIZE + len as usize;
        if buf.len() < total {
            return Err(FrameError::Truncated(buf.len()));
        }
        Ok((
            Frame {
                agent_id,
                opcode,
                payload: buf[HEADER_SIZE..total].to_vec(),
            },
            total,
        ))
    }
}

/// Validate and decode a 14-byte header, returning (opcode, agent_id, payload_len).
pub fn decode_header(buf: &[u8]) -> Result<(SyscallOp, u32, u32), FrameError> {
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::Truncated(buf.len()));
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let version = buf[4];
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let opcode = SyscallOp::try_from(buf[5])?;
    let agent_id = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let len = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(len));
    }
    Ok((opcode, agent_id, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::new(7, SyscallOp::Store, br#"{"key":"x","value":1}"#.to_vec());
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + frame.payload.len());

        let (decoded, consumed) = Frame::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn frame_header_layout() {
        let frame = Frame::new(0x01020304, SyscallOp::Send, b"hi".to_vec());
        let encoded = frame.encode();

        assert_eq!(&encoded[0..4], b"RST1");
        assert_eq!(encoded[4], PROTOCOL_VERSION);
        assert_eq!(encoded[5], SyscallOp::Send as u8);
        assert_eq!(&encoded[6..10], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&encoded[10..14], &[2, 0, 0, 0]);
        assert_eq!(&encoded[14..], b"hi");
    }

    #[test]
    fn empty_payload_roundtrip() {
        let frame = Frame::new(1, SyscallOp::Hello, Vec::new());
        let (decoded, consumed) = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(consumed, HEADER_SIZE);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let err = Frame::decode(&[0u8; 5]).unwrap_err();
        assert_eq!(err, FrameError::Truncated(5));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut encoded = Frame::new(1, SyscallOp::Noop, Vec::new()).encode();
        encoded[0] = b'X';
        assert!(matches!(
            Frame::decode(&encoded).unwrap_err(),
            FrameError::BadMagic(_)
        ));
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut encoded = Frame::new(1, SyscallOp::Noop, Vec::new()).encode();
        encoded[4] = 99;
        assert_eq!(
            Frame::decode(&encoded).unwrap_err(),
            FrameError::UnsupportedVersion(99)
        );
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let mut encoded = Frame::new(1, SyscallOp::Noop, Vec::new()).encode();
        encoded[5] = 0x13; // gap in the opcode space
        assert_eq!(
            Frame::decode(&encoded).unwrap_err(),
            FrameError::UnknownOpcode(0x13)
        );
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let mut encoded = Frame::new(1, SyscallOp::Noop, Vec::new()).encode();
        encoded[10..14].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_le_bytes());
        assert_eq!(
            Frame::decode(&encoded).unwrap_err(),
            FrameError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1)
        );
    }

    #[test]
    fn decode_rejects_incomplete_payload() {
        let encoded = Frame::new(1, SyscallOp::Noop, vec![1, 2, 3, 4]).encode();
        let err = Frame::decode(&encoded[..HEADER_SIZE + 2]).unwrap_err();
        assert_eq!(err, FrameError::Truncated(HEADER_SIZE + 2));
    }

    #[test]
    fn opcode_wire_values_are_stable() {
        assert_eq!(SyscallOp::Think as u8, 0x01);
        assert_eq!(SyscallOp::Spawn as u8, 0x10);
        assert_eq!(SyscallOp::Register as u8, 0x23);
        assert_eq!(SyscallOp::Keys as u8, 0x33);
        assert_eq!(SyscallOp::AsyncPoll as u8, 0x80);
        assert_eq!(SyscallOp::WorldRestore as u8, 0xA8);
        assert_eq!(SyscallOp::TunnelConfig as u8, 0xB4);
        assert_eq!(SyscallOp::MetricsCgroup as u8, 0xC3);
        assert_eq!(SyscallOp::Exit as u8, 0xFF);
    }

    #[test]
    fn opcode_u8_roundtrip_all() {
        for op in SyscallOp::ALL {
            assert_eq!(SyscallOp::try_from(*op as u8).unwrap(), *op);
        }
    }

    #[test]
    fn opcode_names_are_unique() {
        let mut names: Vec<&str> = SyscallOp::ALL.iter().map(|op| op.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), SyscallOp::ALL.len());
    }

    #[test]
    fn json_frame_payload() {
        let frame = Frame::json(3, SyscallOp::Fetch, &serde_json::json!({"key": "k"}));
        let body: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(body["key"], "k");
    }
}
