//! Control stream messages and helper types
// (c) 2024 Ross Younger
//!
//! The control stream is the first bidirectional stream the client opens on a
//! fresh QUIC connection. It starts with an authentication exchange:
//!
//! * C ➡️ S: [`ClientHello`] (protocol version, credential, declared rates)
//! * S ➡️ C: [`ServerHello`] (verdict, granted rates, message)
//!
//! The stream then stays open for the life of the connection and carries UDP
//! session management frames:
//!
//! * C ➡️ S: [`UdpSessionOpen`]; S ➡️ C: [`UdpSessionOpenReply`] with the
//!   assigned session id
//! * C ➡️ S: [`UdpSessionClose`] when the local consumer goes away
//!
//! The hello layouts are inherited from the deployed server and must not be
//! reordered.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use super::wire;

/// Frame tag for a UDP session open request
pub const FRAME_UDP_OPEN: u8 = 0x01;
/// Frame tag for a UDP session teardown
pub const FRAME_UDP_CLOSE: u8 = 0x02;

/// Authentication request, client to server
#[derive(Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Opaque credential blob (password or token, per server policy)
    pub credential: Vec<u8>,
    /// Client's declared maximum send rate, bytes per second
    pub send_bps: u64,
    /// Client's declared maximum receive rate, bytes per second
    pub recv_bps: u64,
}

impl std::fmt::Debug for ClientHello {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Deliberately does not print the credential.
        f.debug_struct("ClientHello")
            .field("credential length", &self.credential.len())
            .field("send_bps", &self.send_bps)
            .field("recv_bps", &self.recv_bps)
            .finish()
    }
}

impl ClientHello {
    /// Serializer. Writes the protocol version byte first.
    pub async fn write<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_u8(super::PROTOCOL_VERSION).await?;
        wire::write_varbytes(w, &self.credential).await?;
        w.write_u64(self.send_bps).await?;
        w.write_u64(self.recv_bps).await?;
        w.flush().await?;
        Ok(())
    }

    /// Deserializer (the server side of the exchange; also used by tests).
    /// Returns the version byte alongside the message so the caller can
    /// decide what to do about a mismatch.
    pub async fn read<R>(r: &mut R) -> Result<(u8, Self)>
    where
        R: AsyncRead + Unpin,
    {
        let version = r.read_u8().await?;
        let credential = wire::read_varbytes(r).await?;
        let send_bps = r.read_u64().await?;
        let recv_bps = r.read_u64().await?;
        Ok((
            version,
            Self {
                credential,
                send_bps,
                recv_bps,
            },
        ))
    }
}

/// Authentication verdict, server to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// Whether the credential was accepted
    pub ok: bool,
    /// Granted send rate for the client, bytes per second; 0 means uncapped
    pub send_bps: u64,
    /// Granted receive rate for the client, bytes per second; 0 means uncapped
    pub recv_bps: u64,
    /// Human-readable message; on rejection, the reason
    pub message: String,
}

impl ServerHello {
    /// Serializer
    pub async fn write<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_u8(u8::from(self.ok)).await?;
        w.write_u64(self.send_bps).await?;
        w.write_u64(self.recv_bps).await?;
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
        let send_bps = r.read_u64().await?;
        let recv_bps = r.read_u64().await?;
        let message = wire::read_varstring(r).await?;
        Ok(Self {
            ok,
            send_bps,
            recv_bps,
            message,
        })
    }
}

/// Request for a fresh UDP session id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpSessionOpen {}

impl UdpSessionOpen {
    /// Serializer
    pub async fn write<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_u8(FRAME_UDP_OPEN).await?;
        w.flush().await?;
        Ok(())
    }
}

/// Server's answer to [`UdpSessionOpen`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpSessionOpenReply {
    /// Whether a session was allocated
    pub ok: bool,
    /// The assigned session id, unique for the life of the connection
    pub session_id: u32,
}

impl UdpSessionOpenReply {
    /// Serializer (server side; also used by tests)
    pub async fn write<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_u8(FRAME_UDP_OPEN).await?;
        w.write_u8(u8::from(self.ok)).await?;
        w.write_u32(self.session_id).await?;
        w.flush().await?;
        Ok(())
    }

    /// Deserializer
    pub async fn read<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let tag = r.read_u8().await?;
        anyhow::ensure!(tag == FRAME_UDP_OPEN, "unexpected control frame {tag:#x}");
        let ok = r.read_u8().await? != 0;
        let session_id = r.read_u32().await?;
        Ok(Self { ok, session_id })
    }
}

/// Tears down a UDP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpSessionClose {
    /// The session to close
    pub session_id: u32,
}

impl UdpSessionClose {
    /// Serializer
    pub async fn write<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_u8(FRAME_UDP_CLOSE).await?;
        w.write_u32(self.session_id).await?;
        w.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn hello_roundtrip() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(256);
        let hello = ClientHello {
            credential: b"da5438aaa690a5748eb59de8f7bedcb0".to_vec(),
            send_bps: 2_500_000,
            recv_bps: 125_000_000,
        };
        hello.write(&mut a).await?;
        let (version, read_back) = ClientHello::read(&mut b).await?;
        assert_eq!(version, super::super::PROTOCOL_VERSION);
        assert_eq!(hello, read_back);
        Ok(())
    }

    #[tokio::test]
    async fn server_hello_roundtrip() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(256);
        let hello = ServerHello {
            ok: false,
            send_bps: 0,
            recv_bps: 0,
            message: "Wrong password".into(),
        };
        hello.write(&mut a).await?;
        assert_eq!(ServerHello::read(&mut b).await?, hello);
        Ok(())
    }

    #[tokio::test]
    async fn hello_byte_layout() -> Result<()> {
        // The layout is inherited from the deployed server; pin it down.
        let (mut a, mut b) = tokio::io::duplex(256);
        ClientHello {
            credential: b"AB".to_vec(),
            send_bps: 0x0102_0304,
            recv_bps: 5,
        }
        .write(&mut a)
        .await?;
        let mut raw = [0u8; 1 + 2 + 2 + 8 + 8];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut raw).await?;
        assert_eq!(raw[0], super::super::PROTOCOL_VERSION);
        assert_eq!(&raw[1..5], &[0x00, 0x02, b'A', b'B']);
        assert_eq!(
            &raw[5..13],
            &[0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04]
        );
        assert_eq!(&raw[13..21], &[0, 0, 0, 0, 0, 0, 0, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn udp_session_frames() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(64);
        UdpSessionOpenReply {
            ok: true,
            session_id: 42,
        }
        .write(&mut a)
        .await?;
        let reply = UdpSessionOpenReply::read(&mut b).await?;
        assert!(reply.ok);
        assert_eq!(reply.session_id, 42);
        Ok(())
    }
}
