//! Per-request framing: TCP stream headers and UDP datagram frames
// (c) 2024 Ross Younger

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use super::wire::{self, WireError};

/// TCP request header, client to server.
/// Exactly one of these is sent at the start of each request stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRequest {
    /// Destination as `host:port`
    pub host: String,
    /// Optional padding to vary the first-packet length; the server discards it
    pub padding: Vec<u8>,
}

impl TcpRequest {
    /// Constructor with no padding
    #[must_use]
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            padding: Vec::new(),
        }
    }

    /// Serializer
    pub async fn write<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        wire::write_varstring(w, &self.host).await?;
        wire::write_varbytes(w, &self.padding).await?;
        w.flush().await?;
        Ok(())
    }

    /// Deserializer (server side; also used by tests)
    pub async fn read<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let host = wire::read_varstring(r).await?;
        let padding = wire::read_varbytes(r).await?;
        Ok(Self { host, padding })
    }
}

/// TCP response header, server to client.
/// Payload forwarding begins only after an OK response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpResponse {
    /// Whether the server connected to the destination
    pub ok: bool,
    /// On failure, the reason
    pub message: String,
}

impl TcpResponse {
    /// Serializer (server side; also used by tests)
    pub async fn write<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_u8(u8::from(self.ok)).await?;
        wire::write_varstring(w, &self.message).await?;
        w.flush().await?;
        Ok(())
    }

    /// Deserializer
    pub async fn read<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let ok = r.read_u8().await? != 0;
        let message = wire::read_varstring(r).await?;
        Ok(Self { ok, message })
    }
}

/// A UDP payload in flight, carried in a QUIC datagram.
/// Outbound, `addr` is the destination; inbound, it is the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    /// Session id assigned by the server at open time
    pub session_id: u32,
    /// `host:port` peer address
    pub addr: String,
    /// The datagram payload
    pub payload: Bytes,
}

impl UdpDatagram {
    /// Encodes to a wire frame ready for `send_datagram`
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(4 + 2 + self.addr.len() + 2 + self.payload.len());
        buf.put_u32(self.session_id);
        wire::put_varbytes(&mut buf, self.addr.as_bytes())?;
        wire::put_varbytes(&mut buf, &self.payload)?;
        Ok(buf.freeze())
    }

    /// Decodes a received datagram frame
    pub fn decode(mut frame: Bytes) -> Result<Self, WireError> {
        if frame.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let session_id = frame.get_u32();
        let addr = wire::get_varstring(&mut frame)?;
        let payload = wire::get_varbytes(&mut frame)?;
        Ok(Self {
            session_id,
            addr,
            payload,
        })
    }
}
