// Local proxy front-ends and the request dispatcher
// (c) 2024 Ross Younger

//! The proxy layer: everything between a local client application and the
//! tunnel. The SOCKS5 and HTTP front-ends accept connections, extract the
//! requested destination, and hand it to the shared [`Dispatcher`], which
//! consults the ACL and picks one of four routes:
//!
//! | ACL result | behaviour |
//! |---|---|
//! | Proxy (default) | open a tunnel stream to the destination |
//! | Direct | dial the resolved address from this machine |
//! | Block  | fail the request; nothing is dialled |
//! | Hijack | dial the substitute host from this machine |
//!
//! Once a route is dialled, bytes are spliced both ways with independent
//! per-direction EOF (see [`splice`]).

pub mod http;
pub mod socks5;
mod splice;

pub(crate) use splice::splice;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::acl::{AclResult, Action, Engine};
use crate::tunnel::{TunnelClient, TunnelError};

/// Anything that can be spliced: a duplex byte stream
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

impl std::fmt::Debug for dyn Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Duplex>")
    }
}

/// Why a request could not be served.
/// Front-ends map these onto their own failure vocabulary (SOCKS5 reply
/// codes, HTTP status lines).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The ACL said no. Nothing was dialled.
    #[error("blocked by ACL")]
    Blocked,
    /// The action needed a local address and resolution failed
    #[error("could not resolve {host}")]
    Resolve {
        /// The name that would not resolve
        host: String,
        /// The underlying lookup failure
        #[source]
        source: anyhow::Error,
    },
    /// Tunnel-side failure (includes the server refusing the destination)
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// Local dial failure
    #[error("dial failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The action switch shared by every front-end.
///
/// Holds the ACL (read-only) and the tunnel client; owns no per-request
/// state, so a single instance serves all connections concurrently.
#[derive(Debug)]
pub struct Dispatcher {
    tunnel: Arc<TunnelClient>,
    acl: Option<Engine>,
}

impl Dispatcher {
    /// Constructor. `acl: None` means everything is proxied.
    #[must_use]
    pub fn new(tunnel: Arc<TunnelClient>, acl: Option<Engine>) -> Self {
        Self { tunnel, acl }
    }

    /// Access to the tunnel client (for UDP session setup)
    #[must_use]
    pub fn tunnel(&self) -> &Arc<TunnelClient> {
        &self.tunnel
    }

    /// Consults the ACL for one destination host
    #[must_use]
    pub fn match_host(&self, host: &str) -> AclResult {
        match &self.acl {
            Some(engine) => engine.resolve_and_match(host),
            None => AclResult {
                action: Action::Proxy,
                arg: None,
                resolved: None,
                resolve_err: None,
            },
        }
    }

    /// Resolves the ACL and dials one TCP destination.
    /// The returned stream is ready for payload bytes.
    pub async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn Duplex>, DispatchError> {
        let matched = self.match_host(host);
        let dst = format!("{host}:{port}");
        debug!(action = %matched.action, dst = %dst, "dispatching TCP request");
        match matched.action {
            Action::Proxy => {
                let stream = self.tunnel.dial_tcp(&dst).await?;
                Ok(Box::new(stream))
            }
            Action::Direct => {
                // A resolution failure is fatal here; falling back to the
                // tunnel would bypass the operator's routing policy.
                if let Some(e) = matched.resolve_err {
                    return Err(DispatchError::Resolve {
                        host: host.to_string(),
                        source: e,
                    });
                }
                let ip = matched.resolved.ok_or_else(|| DispatchError::Resolve {
                    host: host.to_string(),
                    source: anyhow::anyhow!("no address available"),
                })?;
                Ok(Box::new(dial_direct(ip, port).await?))
            }
            Action::Block => Err(DispatchError::Blocked),
            Action::Hijack => {
                let target = matched.arg.unwrap_or_default();
                let ip = target.parse::<IpAddr>().or_else(|_| {
                    crate::util::resolve(&target).map_err(|e| DispatchError::Resolve {
                        host: target.clone(),
                        source: e,
                    })
                })?;
                debug!("hijacking {host}:{port} to {ip}:{port}");
                Ok(Box::new(dial_direct(ip, port).await?))
            }
        }
    }
}

async fn dial_direct(ip: IpAddr, port: u16) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(SocketAddr::new(ip, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Splits a `host:port` string, handling bracketed IPv6 literals
pub(crate) fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tunnel::TunnelOptions;

    fn test_dispatcher(acl: &str) -> Dispatcher {
        let tunnel = Arc::new(TunnelClient::new(TunnelOptions {
            server_addr: "127.0.0.1:1".into(),
            credential: b"secret".to_vec(),
            alpn: "hysteria-proxy".into(),
            up_bps: 1_000_000,
            down_bps: 1_000_000,
            recv_window_conn: 67_108_864,
            recv_window_stream: 15_728_640,
            ca_file: None,
            insecure: true,
            obfs: None,
        }));
        Dispatcher::new(tunnel, Some(Engine::parse(acl).unwrap()))
    }

    #[tokio::test]
    async fn blocked_destination_opens_nothing() {
        let d = test_dispatcher("block domain evil.example\n");
        // An unreachable tunnel server would error differently; Blocked
        // proves we bailed before dialling anything.
        let err = d.dial("evil.example", 443).await.unwrap_err();
        assert!(matches!(err, DispatchError::Blocked));
    }

    #[tokio::test]
    async fn direct_with_failed_resolution_fails() {
        let d = test_dispatcher("direct domain nxdomain.invalid\n");
        let err = d.dial("nxdomain.invalid", 80).await.unwrap_err();
        assert!(matches!(err, DispatchError::Resolve { .. }));
    }

    #[tokio::test]
    async fn hijack_dials_the_substitute() -> anyhow::Result<()> {
        // A local listener stands in for the hijack target.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let d = test_dispatcher("hijack domain ads.example 127.0.0.1\n");

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = d.dial("ads.example", port).await;
        assert!(stream.is_ok());
        let (_conn, _peer) = accept.await??;
        Ok(())
    }

    #[test]
    fn no_acl_defaults_to_proxy() {
        let d = Dispatcher::new(
            test_dispatcher("").tunnel().clone(),
            None,
        );
        assert_eq!(d.match_host("anything.example").action, Action::Proxy);
    }

    #[test]
    fn split_host_port_forms() {
        assert_eq!(
            split_host_port("example.com:443"),
            Some(("example.com".into(), 443))
        );
        assert_eq!(
            split_host_port("[2001:db8::1]:53"),
            Some(("2001:db8::1".into(), 53))
        );
        assert_eq!(split_host_port("no-port"), None);
        assert_eq!(split_host_port("bad:port:"), None);
    }
}
