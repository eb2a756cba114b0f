//! The QUIC tunnel client
// (c) 2024 Ross Younger
//!
//! A [`TunnelClient`] owns (at most) one authenticated QUIC session to the
//! remote server and hands out per-request streams on top of it. All
//! front-end tasks share one client; stream creation is the only
//! serialization point and that lives inside quinn.
//!
//! Session lifecycle: the session is established lazily on first use. If it
//! dies, in-flight streams observe a terminal error, and the next call
//! re-establishes a fresh session (one attempt per call; no silent retry
//! loops).

mod udp;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{anyhow, Context as _};
use bytes::Bytes;
use human_repr::HumanThroughput as _;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::EndpointConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::congestion::BrutalConfig;
use crate::obfs::Obfuscator;
use crate::protocol::control::{
    ClientHello, ServerHello, UdpSessionClose, UdpSessionOpen, UdpSessionOpenReply,
};
use crate::protocol::session::{TcpRequest, TcpResponse, UdpDatagram};
use crate::protocol::StreamPair;
use crate::transport::{self, ObfsUdpSocket, UDP_BUFFER_SIZE};
use crate::util::socket::{bind_unspecified_for, set_udp_buffer_sizes};

use udp::UdpDemux;

/// Errors surfaced by the tunnel client.
/// Front-ends translate these into SOCKS5 reply codes and HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The server rejected our credential; carries the server's message
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// The server could not (or would not) reach the destination
    #[error("remote refused connection to {host}: {message}")]
    RemoteRefused {
        /// The requested destination
        host: String,
        /// The server's reason
        message: String,
    },
    /// The server does not speak QUIC datagrams
    #[error("server does not support UDP forwarding")]
    UdpUnsupported,
    /// The QUIC session died underneath us
    #[error("tunnel session lost")]
    SessionLost(#[from] quinn::ConnectionError),
    /// Anything else (socket setup, TLS configuration, protocol violations)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Everything needed to construct a [`TunnelClient`]
#[derive(Clone)]
pub struct TunnelOptions {
    /// Server `host:port`
    pub server_addr: String,
    /// Opaque authentication credential
    pub credential: Vec<u8>,
    /// ALPN token; must match the server deployment
    pub alpn: String,
    /// Declared maximum upload rate, bytes/sec (> 0)
    pub up_bps: u64,
    /// Declared maximum download rate, bytes/sec (> 0)
    pub down_bps: u64,
    /// Connection-level receive window
    pub recv_window_conn: u64,
    /// Per-stream receive window
    pub recv_window_stream: u64,
    /// Optional custom CA file (PEM)
    pub ca_file: Option<PathBuf>,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Optional per-packet obfuscator
    pub obfs: Option<Arc<dyn Obfuscator>>,
}

impl std::fmt::Debug for TunnelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Deliberately does not print the credential.
        f.debug_struct("TunnelOptions")
            .field("server_addr", &self.server_addr)
            .field("alpn", &self.alpn)
            .field("up_bps", &self.up_bps)
            .field("down_bps", &self.down_bps)
            .field("obfs", &self.obfs)
            .finish_non_exhaustive()
    }
}

/// A connected, authenticated QUIC session plus its negotiated state
struct Session {
    connection: quinn::Connection,
    control: Mutex<StreamPair>,
    udp: UdpDemux,
    // Kept so the endpoint (and its driver) lives exactly as long as the session.
    _endpoint: quinn::Endpoint,
}

impl Session {
    /// Dials, handshakes and authenticates. Returns only once the server has
    /// said hello; streams must not be opened before that.
    async fn establish(options: &TunnelOptions) -> Result<Arc<Self>, TunnelError> {
        let server_addr = resolve_server(&options.server_addr).await?;
        let server_name = host_part(&options.server_addr);

        let socket = bind_unspecified_for(&server_addr)?;
        let _ = set_udp_buffer_sizes(&socket, Some(UDP_BUFFER_SIZE), Some(UDP_BUFFER_SIZE))?;
        let conduit = ObfsUdpSocket::new(socket, options.obfs.clone())?;

        let tls = crate::tls::client_config(
            &options.alpn,
            options.ca_file.as_deref(),
            options.insecure,
        )?;
        let congestion = Arc::new(BrutalConfig::new(options.up_bps));
        let transport_config = transport::create_config(
            congestion.clone(),
            options.recv_window_conn,
            options.recv_window_stream,
        )?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(
            QuicClientConfig::try_from(Arc::new(tls)).context("TLS configuration rejected")?,
        ));
        let _ = client_config.transport_config(transport_config);

        let runtime = quinn::default_runtime().ok_or_else(|| anyhow!("no async runtime found"))?;
        let mut endpoint = quinn::Endpoint::new_with_abstract_socket(
            EndpointConfig::default(),
            None,
            Arc::new(conduit),
            runtime,
        )
        .context("unable to create QUIC endpoint")?;
        endpoint.set_default_client_config(client_config);

        debug!("opening QUIC connection to {server_addr} (SNI {server_name})");
        let connection = endpoint
            .connect(server_addr, server_name)
            .context("invalid connection parameters")?
            .await?;

        // Auth exchange on the control stream. No other streams until OK.
        let mut control: StreamPair = connection.open_bi().await?.into();
        ClientHello {
            credential: options.credential.clone(),
            send_bps: options.up_bps,
            recv_bps: options.down_bps,
        }
        .write(&mut control.send)
        .await?;
        let hello = ServerHello::read(&mut control.recv).await?;
        if !hello.ok {
            connection.close(1u8.into(), b"auth rejected");
            return Err(TunnelError::AuthRejected(hello.message));
        }

        let negotiated = match hello.send_bps {
            0 => options.up_bps,
            granted => options.up_bps.min(granted),
        };
        congestion.set_bandwidth(negotiated);
        info!(
            "connected to {addr}; pacing at {rate}",
            addr = connection.remote_address(),
            rate = negotiated.human_throughput_bytes(),
        );
        if !hello.message.is_empty() {
            debug!("server says: {}", hello.message);
        }

        let demux = UdpDemux::default();
        drop(tokio::spawn(demux.clone().run(connection.clone())));

        Ok(Arc::new(Self {
            connection,
            control: Mutex::new(control),
            udp: demux,
            _endpoint: endpoint,
        }))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.connection.remote_address())
            .finish_non_exhaustive()
    }
}

/// The tunnel client. Cheap to share behind an [`Arc`]; all methods take
/// `&self` and may be called concurrently.
pub struct TunnelClient {
    options: TunnelOptions,
    session: Mutex<Option<Arc<Session>>>,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("server_addr", &self.options.server_addr)
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    /// Constructor. Does not dial; see [`TunnelClient::connect`].
    #[must_use]
    pub fn new(options: TunnelOptions) -> Self {
        Self {
            options,
            session: Mutex::new(None),
        }
    }

    /// Eagerly establishes the session, so that a bad server address or
    /// rejected credential is reported at startup rather than on first use.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let _ = self.session().await?;
        Ok(())
    }

    /// Returns the live session, establishing one if need be
    async fn session(&self) -> Result<Arc<Session>, TunnelError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.connection.close_reason().is_none() {
                return Ok(session.clone());
            }
            debug!("tunnel session is dead, redialling");
        }
        let fresh = Session::establish(&self.options).await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Forgets a dead session so the next call redials
    async fn invalidate(&self, dead: &Arc<Session>) {
        let mut guard = self.session.lock().await;
        if let Some(current) = guard.as_ref() {
            if Arc::ptr_eq(current, dead) {
                *guard = None;
            }
        }
    }

    /// Opens a tunnelled TCP connection to `host` (a `host:port` string).
    ///
    /// On success the returned stream is a plain duplex byte pipe; bytes in
    /// order, independent of any other stream. Concurrent calls are fine.
    pub async fn dial_tcp(&self, host: &str) -> Result<TunnelStream, TunnelError> {
        let session = self.session().await?;
        let result = Self::open_request(&session, host).await;
        if let Err(TunnelError::SessionLost(_)) = &result {
            self.invalidate(&session).await;
        }
        result
    }

    async fn open_request(
        session: &Arc<Session>,
        host: &str,
    ) -> Result<TunnelStream, TunnelError> {
        let (mut send, mut recv) = session.connection.open_bi().await?;
        TcpRequest::new(host).write(&mut send).await?;
        let response = TcpResponse::read(&mut recv).await?;
        if !response.ok {
            let _ = send.finish();
            return Err(TunnelError::RemoteRefused {
                host: host.to_string(),
                message: response.message,
            });
        }
        debug!("tunnel stream open to {host}");
        Ok(TunnelStream { send, recv })
    }

    /// Opens a UDP relay session over the tunnel.
    ///
    /// Fails with [`TunnelError::UdpUnsupported`] if the server did not
    /// negotiate datagram support.
    pub async fn listen_udp(&self) -> Result<UdpSession, TunnelError> {
        let session = self.session().await?;
        if session.connection.max_datagram_size().is_none() {
            return Err(TunnelError::UdpUnsupported);
        }
        let reply = {
            // One lock covers request and response, serializing concurrent opens.
            let mut control = session.control.lock().await;
            UdpSessionOpen {}.write(&mut control.send).await?;
            UdpSessionOpenReply::read(&mut control.recv).await?
        };
        if !reply.ok {
            return Err(TunnelError::Other(anyhow!("server refused UDP session")));
        }
        let rx = session.udp.register(reply.session_id);
        debug!("UDP session {} open", reply.session_id);
        Ok(UdpSession {
            session,
            session_id: reply.session_id,
            rx,
            closed: false,
        })
    }
}

/// A tunnelled TCP connection: reads and writes map straight onto the
/// underlying QUIC stream
#[derive(Debug)]
pub struct TunnelStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

/// A UDP relay session over the tunnel.
///
/// Datagrams may be reordered or dropped as usual for UDP; nothing here
/// retransmits. Dropping the session stops delivery; calling
/// [`UdpSession::close`] additionally tells the server to free the id.
#[derive(Debug)]
pub struct UdpSession {
    session: Arc<Session>,
    session_id: u32,
    rx: mpsc::Receiver<(Bytes, String)>,
    closed: bool,
}

impl UdpSession {
    /// The server-assigned session id
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Sends a payload to `addr` (a `host:port` string) through the tunnel
    pub fn write_to(&self, payload: &[u8], addr: &str) -> Result<(), TunnelError> {
        let frame = UdpDatagram {
            session_id: self.session_id,
            addr: addr.to_string(),
            payload: Bytes::copy_from_slice(payload),
        }
        .encode()
        .map_err(|e| anyhow!(e))?;
        use quinn::SendDatagramError as E;
        self.session.connection.send_datagram(frame).map_err(|e| match e {
            E::UnsupportedByPeer | E::Disabled => TunnelError::UdpUnsupported,
            E::ConnectionLost(e) => TunnelError::SessionLost(e),
            E::TooLarge => TunnelError::Other(anyhow!("datagram exceeds path MTU")),
        })
    }

    /// Receives the next inbound payload and its source `host:port`.
    /// Errors once the tunnel session is gone.
    pub async fn read_from(&mut self) -> Result<(Bytes, String), TunnelError> {
        self.rx.recv().await.ok_or_else(|| {
            TunnelError::SessionLost(
                self.session
                    .connection
                    .close_reason()
                    .unwrap_or(quinn::ConnectionError::LocallyClosed),
            )
        })
    }

    /// Graceful teardown: tells the server to free the session id
    pub async fn close(mut self) -> Result<(), TunnelError> {
        self.closed = true;
        self.session.udp.unregister(self.session_id);
        let mut control = self.session.control.lock().await;
        UdpSessionClose {
            session_id: self.session_id,
        }
        .write(&mut control.send)
        .await?;
        debug!("UDP session {} closed", self.session_id);
        Ok(())
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        if !self.closed {
            // Best effort: without an async context the teardown frame is
            // left to the server's session idle timer.
            self.session.udp.unregister(self.session_id);
        }
    }
}

/// Resolves the configured `host:port` server address
async fn resolve_server(server_addr: &str) -> Result<SocketAddr, TunnelError> {
    Ok(tokio::net::lookup_host(server_addr)
        .await
        .with_context(|| format!("server address lookup for {server_addr} failed"))?
        .next()
        .ok_or_else(|| anyhow!("server address {server_addr} did not resolve"))?)
}

/// The hostname part of a `host:port` string, for SNI
fn host_part(server_addr: &str) -> &str {
    let host = server_addr
        .rsplit_once(':')
        .map_or(server_addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}
