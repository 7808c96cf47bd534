//! Length-prefixed frame codec and a small RPC client
//!
//! Every nexus connection speaks the same framing: a 4-byte big-endian
//! length followed by that many bytes of bincode. Replies reuse the same
//! frame shape in the opposite direction.

use crate::{ProtoError, Result};
use crate::message::{ControlReply, ControlRequest, NodeMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on a single frame. Query payloads carry image blobs, so
/// this is generous; anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Write one framed message
pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

/// Client for the scheduler's control RPCs and for scheduler-to-node
/// pushes. Connections are short-lived; control traffic is low-cadence.
#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,
}

impl RpcClient {
    /// Create a client for a remote address
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// The remote address this client talks to
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Issue one control request and wait for its reply
    pub async fn call(&self, request: &ControlRequest) -> Result<ControlReply> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        write_frame(&mut stream, request).await?;
        let reply = read_frame(&mut stream).await?;
        debug!(addr = %self.addr, "Control call completed");
        Ok(reply)
    }

    /// Push one fire-and-forget node message
    pub async fn push(&self, message: &NodeMessage) -> Result<()> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        write_frame(&mut stream, message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{KeepAliveRequest, RpcReply};
    use nexus_core::CtrlStatus;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = ControlRequest::KeepAlive(KeepAliveRequest { node_id: 9 });
        write_frame(&mut a, &msg).await.unwrap();
        let back: ControlRequest = read_frame(&mut b).await.unwrap();
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn test_frame_length_prefix() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = RpcReply {
            status: CtrlStatus::Ok,
        };
        write_frame(&mut a, &msg).await.unwrap();

        let mut len_bytes = [0u8; 4];
        b.read_exact(&mut len_bytes).await.unwrap();
        let len = u32::from_be_bytes(len_bytes) as usize;
        assert_eq!(len, bincode::serialize(&msg).unwrap().len());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Hand-craft a frame header claiming an absurd length
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let result: Result<RpcReply> = read_frame(&mut b).await;
        assert!(matches!(result, Err(ProtoError::FrameTooLarge(_))));
    }
}
