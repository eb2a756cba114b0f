// QUIC transport configuration and the obfuscated packet conduit
// (c) 2024 Ross Younger

use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use human_repr::HumanCount as _;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, IdleTimeout, TransportConfig, UdpPoller, VarInt};
use tokio::io::ReadBuf;
use tracing::debug;

use crate::congestion::BrutalConfig;
use crate::obfs::Obfuscator;

/// QUIC datagram send buffer size (hard-wired)
pub const SEND_BUFFER_SIZE: usize = 1_048_576;

/// Kernel UDP buffer size to request on the conduit socket.
/// 2MB has proven sufficient to get close to line speed on fast links.
pub const UDP_BUFFER_SIZE: usize = 2_097_152;

/// Keep-alive interval; the tunnel is expected to sit idle between requests
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// How long a silent connection survives before we declare it lost
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The carrier protocol underneath QUIC.
///
/// The empty tag and `udp` both select the plain UDP carrier. The disguise
/// carriers need raw sockets, which this build does not have; selecting one
/// fails at construction time rather than at first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Carrier {
    /// Plain UDP datagrams (optionally obfuscated)
    #[strum(serialize = "udp", serialize = "")]
    Udp,
    /// UDP disguised as a well-known video call protocol
    #[strum(serialize = "wechat-video")]
    WechatVideo,
    /// TCP-mimicking raw socket carrier
    #[strum(serialize = "faketcp")]
    FakeTcp,
}

impl Carrier {
    /// Parses a protocol tag from configuration, rejecting both unknown and
    /// unsupported carriers.
    pub fn from_tag(tag: &str) -> Result<Self> {
        let carrier: Self = tag
            .parse()
            .map_err(|_| anyhow::anyhow!("unsupported protocol: {tag}"))?;
        match carrier {
            Self::Udp => Ok(carrier),
            Self::WechatVideo | Self::FakeTcp => Err(anyhow::anyhow!(
                "protocol '{carrier}' requires raw socket support, which is not available on this platform"
            )),
        }
    }
}

/// A UDP socket which runs every datagram through an [`Obfuscator`].
///
/// This sits between quinn and the wire: outbound packets are obfuscated
/// after QUIC has encrypted them, inbound packets are deobfuscated before
/// QUIC parses them. Malformed inbound packets are dropped silently, so a
/// port scanner sees only noise. With no obfuscator configured this is a
/// straight pass-through.
///
/// Segmentation offload is deliberately not offered (the trait's default
/// `max_transmit_segments` of 1 applies): each packet is transformed
/// individually, and XPlus changes packet sizes, which would break
/// kernel-coalesced reads.
pub struct ObfsUdpSocket {
    io: tokio::net::UdpSocket,
    obfs: Option<Arc<dyn Obfuscator>>,
}

impl std::fmt::Debug for ObfsUdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfsUdpSocket")
            .field("local_addr", &self.io.local_addr().ok())
            .field("obfuscated", &self.obfs.is_some())
            .finish()
    }
}

impl ObfsUdpSocket {
    /// Wraps an already-bound socket. The socket must be registered with the
    /// current tokio runtime.
    pub fn new(socket: std::net::UdpSocket, obfs: Option<Arc<dyn Obfuscator>>) -> Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            io: tokio::net::UdpSocket::from_std(socket)?,
            obfs,
        })
    }
}

#[derive(Debug)]
struct ConduitPoller(Arc<ObfsUdpSocket>);

impl UdpPoller for ConduitPoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.io.poll_send_ready(cx)
    }
}

impl AsyncUdpSocket for ObfsUdpSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(ConduitPoller(self))
    }

    fn try_send(&self, transmit: &Transmit<'_>) -> io::Result<()> {
        let _ = match &self.obfs {
            Some(o) => self
                .io
                .try_send_to(&o.obfuscate(transmit.contents), transmit.destination)?,
            None => self.io.try_send_to(transmit.contents, transmit.destination)?,
        };
        Ok(())
    }

    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        // One datagram per wakeup. We never advertise segment support, so
        // quinn only expects a single buffer to be filled.
        let buf = &mut bufs[0];
        loop {
            let mut read_buf = ReadBuf::new(&mut buf[..]);
            let addr = match self.io.poll_recv_from(cx, &mut read_buf) {
                Poll::Ready(Ok(addr)) => addr,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            let len = read_buf.filled().len();
            let len = match &self.obfs {
                Some(o) => {
                    let Some(clear) = o.deobfuscate(&buf[..len]) else {
                        // Malformed packet: drop silently, try for another.
                        continue;
                    };
                    buf[..clear.len()].copy_from_slice(&clear);
                    clear.len()
                }
                None => len,
            };
            let m = &mut meta[0];
            m.addr = addr;
            m.len = len;
            m.stride = len;
            m.ecn = None;
            m.dst_ip = None;
            return Poll::Ready(Ok(1));
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }
}

/// Creates a `quinn::TransportConfig` for the tunnel connection.
///
/// The congestion factory is passed in (rather than created here) because
/// the caller keeps hold of it to clamp the pacing rate once the server's
/// grant arrives. The receive windows come from configuration, already
/// validated and defaulted.
pub fn create_config(
    congestion: Arc<BrutalConfig>,
    recv_window_conn: u64,
    recv_window_stream: u64,
) -> Result<Arc<TransportConfig>> {
    let mut config = TransportConfig::default();
    let _ = config
        .receive_window(VarInt::from_u64(recv_window_conn).unwrap_or(VarInt::MAX))
        .stream_receive_window(VarInt::from_u64(recv_window_stream).unwrap_or(VarInt::MAX))
        .datagram_receive_buffer_size(Some(
            usize::try_from(recv_window_stream).unwrap_or(usize::MAX),
        ))
        .datagram_send_buffer_size(SEND_BUFFER_SIZE)
        .keep_alive_interval(Some(KEEP_ALIVE_INTERVAL))
        .max_idle_timeout(Some(IdleTimeout::try_from(MAX_IDLE_TIMEOUT)?))
        .congestion_controller_factory(congestion);

    debug!(
        "Receive windows: connection {conn}, stream {stream}; datagram send buffer {send}",
        conn = recv_window_conn.human_count_bytes(),
        stream = recv_window_stream.human_count_bytes(),
        send = SEND_BUFFER_SIZE.human_count_bytes(),
    );

    Ok(config.into())
}

#[cfg(test)]
mod test {
    use super::Carrier;

    #[test]
    fn plain_udp_tags() {
        assert_eq!(Carrier::from_tag("").unwrap(), Carrier::Udp);
        assert_eq!(Carrier::from_tag("udp").unwrap(), Carrier::Udp);
    }

    #[test]
    fn disguise_carriers_fail_at_construction() {
        assert!(Carrier::from_tag("wechat-video").is_err());
        assert!(Carrier::from_tag("faketcp").is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = Carrier::from_tag("carrier-pigeon").unwrap_err();
        assert!(err.to_string().contains("unsupported protocol"));
    }
}
