//! Wire encoding primitives
// (c) 2024 Ross Younger
//!
//! Integers are big-endian. Variable-length fields are prefixed with a
//! two-byte length. These helpers exist in two flavours: async stream I/O
//! (for control and per-stream headers) and in-memory buffer codecs (for
//! datagram frames).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Maximum length a variable-length field can describe
pub const MAX_VAR_LEN: usize = u16::MAX as usize;

/// Decode errors for in-memory frames
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// Frame ended before the advertised length was reached
    #[error("truncated frame")]
    Truncated,
    /// A field exceeded the two-byte length prefix
    #[error("field too long for wire format ({0} bytes)")]
    Oversize(usize),
    /// A string field was not valid UTF-8
    #[error("malformed string field")]
    BadUtf8,
}

/// Writes a length-prefixed byte field to a stream
pub async fn write_varbytes<W>(w: &mut W, data: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(data.len()).map_err(|_| WireError::Oversize(data.len()))?;
    w.write_u16(len).await?;
    w.write_all(data).await?;
    Ok(())
}

/// Reads a length-prefixed byte field from a stream
pub async fn read_varbytes<R>(r: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u16().await?;
    let mut buf = vec![0u8; usize::from(len)];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes a length-prefixed UTF-8 string field to a stream
pub async fn write_varstring<W>(w: &mut W, s: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_varbytes(w, s.as_bytes()).await
}

/// Reads a length-prefixed UTF-8 string field from a stream
pub async fn read_varstring<R>(r: &mut R) -> anyhow::Result<String>
where
    R: AsyncRead + Unpin,
{
    let raw = read_varbytes(r).await?;
    Ok(String::from_utf8(raw).map_err(|_| WireError::BadUtf8)?)
}

/// Appends a length-prefixed byte field to a buffer
pub fn put_varbytes(buf: &mut BytesMut, data: &[u8]) -> Result<(), WireError> {
    let len = u16::try_from(data.len()).map_err(|_| WireError::Oversize(data.len()))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Splits a length-prefixed byte field off the front of a buffer
pub fn get_varbytes(buf: &mut Bytes) -> Result<Bytes, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(buf.split_to(len))
}

/// Splits a length-prefixed UTF-8 string field off the front of a buffer
pub fn get_varstring(buf: &mut Bytes) -> Result<String, WireError> {
    let raw = get_varbytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadUtf8)
}
