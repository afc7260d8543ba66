//! Frame codec.
//!
//! Each frame is a big-endian `u32` payload length followed by the CBOR
//! encoding of one [`Message`].

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes a message to CBOR.
pub fn encode_message(message: &Message) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a message from CBOR.
pub fn decode_message(bytes: &[u8]) -> ProtocolResult<Message> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Writes one framed message.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode_message(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload.len(),
        max: MAX_FRAME_LEN,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message. Returns None on a clean end of stream.
///
/// Not cancel-safe: a partially read frame is lost if the future is dropped.
pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_message(&payload).map(Some)
}
