//! Frame codec for protocol messages.
//!
//! A frame is a 4-byte big-endian length followed by the JSON body.

use crate::protocol::ReconMessage;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Serializes a message into a complete frame.
pub fn encode_message(message: &ReconMessage) -> io::Result<Vec<u8>> {
    let body = serde_json::to_vec(message).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("JSON encode error: {e}"))
    })?;
    check_size(body.len())?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parses a complete frame produced by [`encode_message`].
pub fn decode_message(frame: &[u8]) -> io::Result<ReconMessage> {
    if frame.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame header"));
    }
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    check_size(len)?;
    let body = &frame[4..];
    if body.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length mismatch: header {len}, body {}", body.len()),
        ));
    }
    decode_body(body)
}

/// Reads one length-prefixed message.
pub async fn read_message<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<ReconMessage> {
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    check_size(len)?;

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    decode_body(&buf)
}

/// Writes one length-prefixed message and flushes.
pub async fn write_message<T: AsyncWrite + Unpin>(
    io: &mut T,
    message: &ReconMessage,
) -> io::Result<()> {
    let frame = encode_message(message)?;
    io.write_all(&frame).await?;
    io.flush().await
}

fn decode_body(body: &[u8]) -> io::Result<ReconMessage> {
    serde_json::from_slice(body).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("JSON decode error: {e}"))
    })
}

fn check_size(len: usize) -> io::Result<()> {
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes"),
        ));
    }
    Ok(())
}
