//! SOCKS5 front-end (RFC 1928, RFC 1929)
// (c) 2024 Ross Younger
//!
//! Supports CONNECT and UDP ASSOCIATE, with optional username/password
//! authentication. BIND is not supported. CONNECT requests go through the
//! shared [`Dispatcher`]; UDP ASSOCIATE sets up a local relay socket whose
//! datagrams are individually matched against the ACL and forwarded either
//! directly or through a tunnel UDP session.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::{BufMut as _, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use super::{splice, DispatchError, Dispatcher};
use crate::acl::Action;
use crate::tunnel::{TunnelError, UdpSession};

const VERSION: u8 = 0x05;

const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Options for the SOCKS5 front-end
#[derive(Clone)]
pub struct SocksOptions {
    /// Listen address, e.g. `127.0.0.1:1080`
    pub listen: String,
    /// Username/password pair; `None` disables authentication
    pub auth: Option<(String, String)>,
    /// Idle timeout applied to each spliced request
    pub idle_timeout: Option<Duration>,
    /// Whether UDP ASSOCIATE is offered at all
    pub udp_enabled: bool,
}

impl std::fmt::Debug for SocksOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Deliberately does not print the credentials.
        f.debug_struct("SocksOptions")
            .field("listen", &self.listen)
            .field("auth", &self.auth.is_some())
            .field("idle_timeout", &self.idle_timeout)
            .field("udp_enabled", &self.udp_enabled)
            .finish()
    }
}

/// The SOCKS5 server. One instance serves all connections.
#[derive(Debug)]
pub struct SocksServer {
    dispatcher: Arc<Dispatcher>,
    options: SocksOptions,
}

impl SocksServer {
    /// Constructor
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, options: SocksOptions) -> Self {
        Self {
            dispatcher,
            options,
        }
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn listen_and_serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.options.listen)
            .await
            .with_context(|| format!("unable to listen on {}", self.options.listen))?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            drop(tokio::spawn(async move {
                if let Err(e) = server.handle(stream, peer).await {
                    debug!("SOCKS5 request from {peer} closed: {e:#}");
                }
            }));
        }
    }

    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        self.negotiate_method(&mut stream).await?;
        let request = match read_request(&mut stream).await? {
            Some(r) => r,
            None => return Ok(()), // reply already sent
        };
        match request.cmd {
            CMD_CONNECT => {
                self.handle_connect(stream, peer, &request.host, request.port)
                    .await
            }
            CMD_UDP_ASSOCIATE if self.options.udp_enabled => {
                self.handle_udp_associate(stream, peer).await
            }
            _ => {
                write_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED, None).await?;
                Ok(())
            }
        }
    }

    async fn negotiate_method<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let version = stream.read_u8().await?;
        anyhow::ensure!(version == VERSION, "unsupported SOCKS version {version}");
        let n_methods = stream.read_u8().await?;
        let mut methods = vec![0u8; usize::from(n_methods)];
        stream.read_exact(&mut methods).await?;

        let wanted = if self.options.auth.is_some() {
            METHOD_USERPASS
        } else {
            METHOD_NONE
        };
        if !methods.contains(&wanted) {
            stream.write_all(&[VERSION, METHOD_UNACCEPTABLE]).await?;
            anyhow::bail!("client offered no acceptable auth method");
        }
        stream.write_all(&[VERSION, wanted]).await?;

        if let Some((user, password)) = &self.options.auth {
            // RFC 1929 subnegotiation
            let sub_version = stream.read_u8().await?;
            anyhow::ensure!(sub_version == 0x01, "bad auth subnegotiation version");
            let ulen = stream.read_u8().await?;
            let mut u = vec![0u8; usize::from(ulen)];
            stream.read_exact(&mut u).await?;
            let plen = stream.read_u8().await?;
            let mut p = vec![0u8; usize::from(plen)];
            stream.read_exact(&mut p).await?;

            let ok = u == user.as_bytes() && p == password.as_bytes();
            stream.write_all(&[0x01, u8::from(!ok)]).await?;
            anyhow::ensure!(ok, "authentication failed");
        }
        Ok(())
    }

    async fn handle_connect(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<()> {
        match self.dispatcher.dial(host, port).await {
            Ok(outbound) => {
                write_reply(&mut stream, REP_SUCCESS, None).await?;
                debug!(src = %peer, dst = %format!("{host}:{port}"), "SOCKS5 TCP established");
                match splice(stream, outbound, self.options.idle_timeout).await {
                    Ok((up, down)) => {
                        debug!(src = %peer, up, down, "SOCKS5 TCP request closed");
                    }
                    Err(e) => debug!(src = %peer, error = %e, "SOCKS5 TCP request aborted"),
                }
                Ok(())
            }
            Err(e) => {
                debug!(src = %peer, dst = %format!("{host}:{port}"), error = %e, "SOCKS5 TCP request failed");
                write_reply(&mut stream, reply_code(&e), None).await?;
                Ok(())
            }
        }
    }

    async fn handle_udp_associate(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        // The relay binds on the interface the client reached us through, so
        // the reply address is routable from the client's point of view.
        let local_ip = stream.local_addr()?.ip();
        let relay = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
        let relay_addr = relay.local_addr()?;

        // The tunnel session is established up front: if the server can't do
        // UDP, the associate request fails rather than blackholing traffic.
        let session = match self.dispatcher.tunnel().listen_udp().await {
            Ok(session) => session,
            Err(e) => {
                warn!("UDP associate failed: {e}");
                write_reply(&mut stream, REP_GENERAL_FAILURE, None).await?;
                return Ok(());
            }
        };
        let direct = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
        ))
        .await?;

        write_reply(&mut stream, REP_SUCCESS, Some(relay_addr)).await?;
        debug!(src = %peer, relay = %relay_addr, "SOCKS5 UDP associate established");

        // The association lives exactly as long as the TCP connection.
        let result = {
            let relay_fut = self.relay_udp(&relay, &direct, session);
            tokio::select! {
                () = wait_for_close(&mut stream) => Ok(()),
                r = relay_fut => r,
            }
        };
        if let Err(e) = &result {
            debug!(src = %peer, error = %e, "SOCKS5 UDP associate closed with error");
        } else {
            debug!(src = %peer, "SOCKS5 UDP associate closed");
        }
        Ok(())
    }

    /// The relay pump: client datagrams out (via ACL), return traffic back.
    async fn relay_udp(
        &self,
        relay: &UdpSocket,
        direct: &UdpSocket,
        mut session: UdpSession,
    ) -> Result<()> {
        let mut client: Option<SocketAddr> = None;
        let mut inbound = vec![0u8; 65536];
        let mut direct_buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                received = relay.recv_from(&mut inbound) => {
                    let (n, src) = received?;
                    // The first sender is our client; everyone else is noise.
                    let client = *client.get_or_insert(src);
                    if src != client {
                        continue;
                    }
                    let Some((host, port, payload)) = decode_udp_packet(&inbound[..n]) else {
                        continue;
                    };
                    self.forward_client_packet(&session, direct, &host, port, payload).await;
                }
                received = direct.recv_from(&mut direct_buf) => {
                    let (n, from) = received?;
                    if let Some(client) = client {
                        let packet = encode_udp_packet(&from.ip().to_string(), from.port(), &direct_buf[..n]);
                        let _ = relay.send_to(&packet, client).await;
                    }
                }
                received = session.read_from() => {
                    let (payload, addr) = received?;
                    if let Some(client) = client {
                        if let Some((host, port)) = super::split_host_port(&addr) {
                            let packet = encode_udp_packet(&host, port, &payload);
                            let _ = relay.send_to(&packet, client).await;
                        }
                    }
                }
            }
        }
    }

    async fn forward_client_packet(
        &self,
        session: &UdpSession,
        direct: &UdpSocket,
        host: &str,
        port: u16,
        payload: &[u8],
    ) {
        let matched = self.dispatcher.match_host(host);
        debug!(action = %matched.action, dst = %format!("{host}:{port}"), "SOCKS5 UDP packet");
        match matched.action {
            Action::Proxy => {
                if let Err(e) = session.write_to(payload, &format!("{host}:{port}")) {
                    debug!("UDP tunnel send failed: {e}");
                }
            }
            Action::Direct => {
                if matched.resolve_err.is_some() {
                    return;
                }
                if let Some(ip) = matched.resolved {
                    let _ = direct.send_to(payload, SocketAddr::new(ip, port)).await;
                }
            }
            Action::Block => {} // dropped on the floor
            Action::Hijack => {
                let target = matched.arg.unwrap_or_default();
                let resolved = target
                    .parse::<IpAddr>()
                    .ok()
                    .or_else(|| crate::util::resolve(&target).ok());
                if let Some(ip) = resolved {
                    let _ = direct.send_to(payload, SocketAddr::new(ip, port)).await;
                }
            }
        }
    }
}

/// Waits for the peer to hang up (or error), discarding anything it sends
async fn wait_for_close(stream: &mut TcpStream) {
    let mut scratch = [0u8; 256];
    loop {
        match stream.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {} // RFC 1928 defines no further traffic here; ignore
        }
    }
}

struct Request {
    cmd: u8,
    host: String,
    port: u16,
}

/// Reads a SOCKS5 request. Returns `None` (after replying) for address
/// types we do not speak.
async fn read_request<S>(stream: &mut S) -> Result<Option<Request>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    anyhow::ensure!(head[0] == VERSION, "bad request version {}", head[0]);
    let cmd = head[1];
    let host = match head[3] {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::from(octets).to_string()
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).context("request hostname is not UTF-8")?
        }
        other => {
            debug!("unsupported address type {other}");
            write_reply(stream, REP_ADDRESS_NOT_SUPPORTED, None).await?;
            return Ok(None);
        }
    };
    let port = stream.read_u16().await?;
    Ok(Some(Request { cmd, host, port }))
}

/// Writes a reply. `bound` is reported as BND.ADDR/BND.PORT where it
/// matters (UDP ASSOCIATE); otherwise the all-zero address convention.
async fn write_reply<S>(stream: &mut S, rep: u8, bound: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = BytesMut::with_capacity(22);
    reply.put_slice(&[VERSION, rep, 0x00]);
    match bound {
        Some(SocketAddr::V4(addr)) => {
            reply.put_u8(ATYP_V4);
            reply.put_slice(&addr.ip().octets());
            reply.put_u16(addr.port());
        }
        Some(SocketAddr::V6(addr)) => {
            reply.put_u8(ATYP_V6);
            reply.put_slice(&addr.ip().octets());
            reply.put_u16(addr.port());
        }
        None => {
            reply.put_u8(ATYP_V4);
            reply.put_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// Maps a dispatch failure onto its RFC 1928 reply code
fn reply_code(e: &DispatchError) -> u8 {
    match e {
        DispatchError::Blocked => REP_NOT_ALLOWED,
        DispatchError::Resolve { .. } => REP_HOST_UNREACHABLE,
        DispatchError::Tunnel(TunnelError::RemoteRefused { .. }) => REP_CONNECTION_REFUSED,
        DispatchError::Tunnel(_) => REP_GENERAL_FAILURE,
        DispatchError::Io(e) => match e.kind() {
            std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
            std::io::ErrorKind::TimedOut => REP_HOST_UNREACHABLE,
            _ => REP_GENERAL_FAILURE,
        },
    }
}

/// Parses a SOCKS5 UDP request datagram: RSV(2) FRAG(1) ATYP addr port data.
/// Fragmented packets (FRAG != 0) are not supported and dropped.
fn decode_udp_packet(buf: &[u8]) -> Option<(String, u16, &[u8])> {
    if buf.len() < 4 || buf[0] != 0 || buf[1] != 0 || buf[2] != 0 {
        return None;
    }
    let (host, rest) = match buf[3] {
        ATYP_V4 => {
            let octets: [u8; 4] = buf.get(4..8)?.try_into().ok()?;
            (IpAddr::from(octets).to_string(), buf.get(8..)?)
        }
        ATYP_V6 => {
            let octets: [u8; 16] = buf.get(4..20)?.try_into().ok()?;
            (IpAddr::from(octets).to_string(), buf.get(20..)?)
        }
        ATYP_DOMAIN => {
            let len = usize::from(*buf.get(4)?);
            let name = buf.get(5..5 + len)?;
            (
                String::from_utf8(name.to_vec()).ok()?,
                buf.get(5 + len..)?,
            )
        }
        _ => return None,
    };
    if rest.len() < 2 {
        return None;
    }
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    Some((host, port, &rest[2..]))
}

/// Builds a SOCKS5 UDP datagram for return traffic
fn encode_udp_packet(host: &str, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(22 + host.len() + payload.len());
    packet.put_slice(&[0, 0, 0]);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            packet.put_u8(ATYP_V4);
            packet.put_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            packet.put_u8(ATYP_V6);
            packet.put_slice(&ip.octets());
        }
        Err(_) => {
            packet.put_u8(ATYP_DOMAIN);
            // SOCKS5 limits names to 255 bytes
            let name = &host.as_bytes()[..host.len().min(255)];
            packet.put_u8(name.len() as u8);
            packet.put_slice(name);
        }
    }
    packet.put_u16(port);
    packet.put_slice(payload);
    packet.to_vec()
}
