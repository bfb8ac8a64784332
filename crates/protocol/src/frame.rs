//! Framing: a 4-byte big-endian length followed by a UTF-8 JSON payload.
//!
//! Async and blocking variants share the same encode/decode helpers so both
//! sides of the wire agree byte for byte.

use std::io::{ErrorKind, Read, Write};

use rlm_core::ProtocolError;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in either direction.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Serialize `value` into a complete frame (prefix + payload).
pub fn encode_frame(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn payload_len(prefix: [u8; PREFIX_LEN]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

fn decode_payload(payload: &[u8]) -> Result<Value, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

fn eof_is_closed(e: std::io::Error) -> ProtocolError {
    if e.kind() == ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(e)
    }
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed before sending any prefix byte.
/// A close anywhere after that is [`ProtocolError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Value>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    let mut filled = 0;
    while filled < PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::ConnectionClosed)
            };
        }
        filled += n;
    }

    let len = payload_len(prefix)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(eof_is_closed)?;
    decode_payload(&payload).map(Some)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, value: &Value) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking counterpart of [`read_frame`].
pub fn read_frame_blocking<R: Read>(reader: &mut R) -> Result<Option<Value>, ProtocolError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let mut filled = 0;
    while filled < PREFIX_LEN {
        let n = match reader.read(&mut prefix[filled..]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::ConnectionClosed)
            };
        }
        filled += n;
    }

    let len = payload_len(prefix)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(eof_is_closed)?;
    decode_payload(&payload).map(Some)
}

/// Blocking counterpart of [`write_frame`].
pub fn write_frame_blocking<W: Write>(writer: &mut W, value: &Value) -> Result<(), ProtocolError> {
    let frame = encode_frame(value)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}
