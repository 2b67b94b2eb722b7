//! Length-prefixed frames
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CollectorError;

/// Read one frame; `Ok(None)` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>, CollectorError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CollectorError::Frame(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(CollectorError::Frame(format!(
            "message too large: {} bytes (max {})",
            len, max_size
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| CollectorError::Frame(e.to_string()))?;

    Ok(Some(body))
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Serialize a message as JSON and write it as one frame
pub async fn write_json<W, T>(writer: &mut W, message: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    write_frame(writer, &body).await?;
    Ok(())
}
