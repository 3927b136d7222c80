//! Unix socket server.
//!
//! Accepts agent connections, assigns each a fresh agent id, and runs one
//! task per connection that reads framed requests, dispatches them in
//! arrival order, and writes the responses back. A malformed frame closes
//! only the offending connection; the agent's kernel state is released on
//! disconnect.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use roost_protocol::{decode_header, Frame, SyscallOp, HEADER_SIZE};

use crate::kernel::router::SyscallRouter;
use crate::kernel::{dispatch, KernelContext};

/// Bind the kernel socket and accept connections until the task is
/// dropped.
pub async fn serve(ctx: Arc<KernelContext>, router: Arc<SyscallRouter>) -> Result<()> {
    let socket_path = ctx.config.server.socket_path.clone();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale socket: {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding socket: {}", socket_path.display()))?;
    tracing::info!(path = %socket_path.display(), "kernel socket listening");

    loop {
        let (stream, _addr) = listener.accept().await.context("accept failed")?;
        let agent_id = ctx.ids.allocate();
        ctx.mailboxes.attach(agent_id);
        tracing::info!(agent_id, "agent connected");

        let ctx = Arc::clone(&ctx);
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            if let Err(e) = connection(&ctx, &router, stream, agent_id).await {
                tracing::warn!(agent_id, error = %e, "connection closed with error");
            }
            ctx.disconnect_agent(agent_id);
            tracing::info!(agent_id, "agent disconnected");
        });
    }
}

/// Serve one connection: requests are handled strictly in arrival order,
/// so synchronous responses come back in request order.
async fn connection(
    ctx: &Arc<KernelContext>,
    router: &Arc<SyscallRouter>,
    mut stream: UnixStream,
    agent_id: u32,
) -> Result<()> {
    let max_payload = ctx.config.limits.max_payload_bytes;

    loop {
        let mut frame = match read_frame(&mut stream, max_payload).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        // The connection's assigned id is authoritative; a client cannot
        // speak for another agent.
        frame.agent_id = agent_id;

        let response = dispatch(ctx, router, &frame);
        write_frame(&mut stream, &response).await?;

        if frame.opcode == SyscallOp::Exit {
            tracing::debug!(agent_id, "agent requested exit");
            return Ok(());
        }
    }
}

/// Read one frame. Returns `Ok(None)` on clean EOF at a frame boundary;
/// any malformed header or short read is an error that closes the
/// connection.
pub async fn read_frame(
    stream: &mut (impl AsyncReadExt + Unpin),
    max_payload: u32,
) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_SIZE];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame header"),
    }

    let (opcode, agent_id, len) = decode_header(&header).context("malformed frame header")?;
    anyhow::ensure!(
        len <= max_payload,
        "payload too large: {} bytes (max {})",
        len,
        max_payload
    );

    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .context("failed to read frame payload")?;

    Ok(Some(Frame {
        agent_id,
        opcode,
        payload,
    }))
}

pub async fn write_frame(
    stream: &mut (impl AsyncWriteExt + Unpin),
    frame: &Frame,
) -> Result<()> {
    stream
        .write_all(&frame.encode())
        .await
        .context("failed to write frame")?;
    stream.flush().await.context("failed to flush")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let frame = Frame::json(3, SyscallOp::Fetch, &json!({"key": "k"}));
        write_frame(&mut client, &frame).await.unwrap();

        let read = read_frame(&mut server, roost_protocol::MAX_PAYLOAD_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let result = read_frame(&mut server, roost_protocol::MAX_PAYLOAD_SIZE)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn bad_magic_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut bytes = Frame::new(1, SyscallOp::Noop, Vec::new()).encode();
        bytes[0] = b'X';
        client.write_all(&bytes).await.unwrap();

        let err = read_frame(&mut server, roost_protocol::MAX_PAYLOAD_SIZE)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("malformed frame header"));
    }

    #[tokio::test]
    async fn configured_cap_overrides_protocol_max() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let frame = Frame::new(1, SyscallOp::Noop, vec![0u8; 2048]);
        write_frame(&mut client, &frame).await.unwrap();

        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert!(err.to_string().contains("payload too large"));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let bytes = Frame::new(1, SyscallOp::Noop, vec![7u8; 100]).encode();
        client.write_all(&bytes[..HEADER_SIZE + 10]).await.unwrap();
        drop(client);

        let err = read_frame(&mut server, roost_protocol::MAX_PAYLOAD_SIZE)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("payload"));
    }
}
