//! Async framing of [`Message`]s over a byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::{Header, Message, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Read one message.
///
/// Returns `Ok(None)` when the peer closed the stream on a message boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: filled,
            });
        }
        filled += n;
    }

    let header = Header::unpack(&header_buf)?;
    let len = header.payload_len as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Message { header, payload }))
}

/// Write one message and flush it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = message.header.pack()?;
    writer.write_all(&header).await?;
    writer.write_all(&message.payload).await?;
    writer.flush().await?;
    Ok(())
}
