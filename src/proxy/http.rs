//! HTTP forward-proxy front-end
// (c) 2024 Ross Younger
//!
//! Handles CONNECT tunnelling and absolute-form requests (`GET
//! http://host/path HTTP/1.1`), with optional Basic authentication and an
//! optional TLS listener. Everything upstream is HTTP/1.1 with `Connection:
//! close`; HTTP/2 is deliberately not offered, so tunnelled bytes stay
//! byte-accurate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use base64::Engine as _;
use rustls_pki_types::pem::PemObject as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};
use url::Url;

use super::{splice, DispatchError, Dispatcher, Duplex};
use crate::tunnel::TunnelError;

/// Hard cap on the request head; anything bigger is a bad client
const MAX_HEAD: usize = 65536;

/// Headers that must not be forwarded upstream
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Options for the HTTP front-end
#[derive(Clone)]
pub struct HttpOptions {
    /// Listen address, e.g. `127.0.0.1:8080`
    pub listen: String,
    /// Username/password pair for Basic auth; `None` disables authentication
    pub auth: Option<(String, String)>,
    /// Idle timeout applied to each spliced request
    pub idle_timeout: Option<Duration>,
    /// Optional TLS certificate and key files (PEM); serves HTTPS when set
    pub tls: Option<(std::path::PathBuf, std::path::PathBuf)>,
}

impl std::fmt::Debug for HttpOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Deliberately does not print the credentials.
        f.debug_struct("HttpOptions")
            .field("listen", &self.listen)
            .field("auth", &self.auth.is_some())
            .field("idle_timeout", &self.idle_timeout)
            .field("tls", &self.tls)
            .finish()
    }
}

/// The HTTP proxy server. One instance serves all connections.
pub struct HttpServer {
    dispatcher: Arc<Dispatcher>,
    options: HttpOptions,
    acceptor: Option<TlsAcceptor>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("options", &self.options)
            .field("tls", &self.acceptor.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpServer {
    /// Constructor. Loads the TLS credentials (if any) immediately, so a bad
    /// cert file fails at startup.
    pub fn new(dispatcher: Arc<Dispatcher>, options: HttpOptions) -> Result<Self> {
        let acceptor = match &options.tls {
            Some((cert, key)) => {
                let certs = CertificateDer::pem_file_iter(cert)
                    .with_context(|| format!("unable to load certificate {}", cert.display()))?
                    .collect::<Result<Vec<_>, _>>()?;
                let key = PrivateKeyDer::from_pem_file(key)
                    .with_context(|| format!("unable to load key {}", key.display()))?;
                let config = tokio_rustls::rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .context("TLS configuration rejected")?;
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => None,
        };
        Ok(Self {
            dispatcher,
            options,
            acceptor,
        })
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn listen_and_serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.options.listen)
            .await
            .with_context(|| format!("unable to listen on {}", self.options.listen))?;
        info!(
            "HTTP{} proxy listening on {}",
            if self.acceptor.is_some() { "S" } else { "" },
            listener.local_addr()?
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            drop(tokio::spawn(async move {
                let result = match server.acceptor.clone() {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls) => server.handle(tls).await,
                        Err(e) => Err(anyhow::anyhow!("TLS accept failed: {e}")),
                    },
                    None => server.handle(stream).await,
                };
                if let Err(e) = result {
                    debug!("HTTP request from {peer} closed: {e:#}");
                }
            }));
        }
    }

    async fn handle<S: Duplex>(&self, mut stream: S) -> Result<()> {
        let (head, leftover) = read_head(&mut stream).await?;
        let request = parse_head(&head)?;

        if !self.authorized(&request) {
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"proxy\"\r\n\
                      Connection: close\r\n\r\n",
                )
                .await?;
            return Ok(());
        }

        if request.method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(stream, &request, leftover).await
        } else {
            self.handle_absolute(stream, &request, leftover).await
        }
    }

    fn authorized(&self, request: &RequestHead) -> bool {
        let Some((user, password)) = &self.options.auth else {
            return true;
        };
        let Some(value) = request.header("proxy-authorization") else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        decoded == format!("{user}:{password}").into_bytes()
    }

    async fn handle_connect<S: Duplex>(
        &self,
        mut stream: S,
        request: &RequestHead,
        leftover: Vec<u8>,
    ) -> Result<()> {
        let Some((host, port)) = super::split_host_port(&request.target) else {
            stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                .await?;
            return Ok(());
        };
        match self.dispatcher.dial(&host, port).await {
            Ok(mut outbound) => {
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;
                // Anything the client pipelined after the CONNECT head
                // belongs to the tunnelled protocol.
                if !leftover.is_empty() {
                    outbound.write_all(&leftover).await?;
                }
                debug!(dst = %request.target, "HTTP CONNECT established");
                match splice(stream, outbound, self.options.idle_timeout).await {
                    Ok((up, down)) => debug!(dst = %request.target, up, down, "HTTP CONNECT closed"),
                    Err(e) => debug!(dst = %request.target, error = %e, "HTTP CONNECT aborted"),
                }
                Ok(())
            }
            Err(e) => {
                debug!(dst = %request.target, error = %e, "HTTP CONNECT failed");
                respond_dispatch_error(&mut stream, &e).await
            }
        }
    }

    async fn handle_absolute<S: Duplex>(
        &self,
        mut stream: S,
        request: &RequestHead,
        leftover: Vec<u8>,
    ) -> Result<()> {
        let url = match Url::parse(&request.target) {
            Ok(url) if url.scheme() == "http" && url.host_str().is_some() => url,
            _ => {
                stream
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                    .await?;
                return Ok(());
            }
        };
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        match self.dispatcher.dial(&host, port).await {
            Ok(mut outbound) => {
                let upstream_head = build_upstream_head(request, &url);
                outbound.write_all(&upstream_head).await?;
                if !leftover.is_empty() {
                    outbound.write_all(&leftover).await?;
                }
                debug!(dst = %format!("{host}:{port}"), method = %request.method, "HTTP request forwarded");
                // The remainder (request body up, response down) is a plain
                // byte relay; Connection: close bounds the exchange.
                let _ = splice(stream, outbound, self.options.idle_timeout).await;
                Ok(())
            }
            Err(e) => {
                debug!(dst = %format!("{host}:{port}"), error = %e, "HTTP request failed");
                respond_dispatch_error(&mut stream, &e).await
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reads up to and including the blank line ending the request head.
/// Returns the head bytes and whatever was read beyond them.
async fn read_head<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        anyhow::ensure!(n != 0, "connection closed before request head");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        anyhow::ensure!(buf.len() <= MAX_HEAD, "request head too large");
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_head(head: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(head).context("request head is not valid UTF-8")?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty request line"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("request line has no target"))?
        .to_string();
    anyhow::ensure!(
        parts.next().is_some_and(|v| v.starts_with("HTTP/")),
        "malformed request line"
    );

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed header line"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

/// Rewrites an absolute-form request into origin form for the upstream
/// server, dropping hop-by-hop headers and pinning `Connection: close`.
fn build_upstream_head(request: &RequestHead, url: &Url) -> Vec<u8> {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, path);
    let mut saw_host = false;
    for (name, value) in &request.headers {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        if lower == "host" {
            saw_host = true;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !saw_host {
        let host = url.host_str().unwrap_or_default();
        match url.port() {
            Some(port) => head.push_str(&format!("Host: {host}:{port}\r\n")),
            None => head.push_str(&format!("Host: {host}\r\n")),
        }
    }
    head.push_str("Connection: close\r\n\r\n");
    head.into_bytes()
}

async fn respond_dispatch_error<S>(stream: &mut S, e: &DispatchError) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let status = status_for(e);
    stream
        .write_all(format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n").as_bytes())
        .await?;
    Ok(())
}

fn status_for(e: &DispatchError) -> &'static str {
    match e {
        DispatchError::Blocked => "403 Forbidden",
        DispatchError::Resolve { .. } => "502 Bad Gateway",
        DispatchError::Tunnel(TunnelError::RemoteRefused { .. }) => "502 Bad Gateway",
        DispatchError::Tunnel(_) | DispatchError::Io(_) => "502 Bad Gateway",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[test]
    fn parses_connect_head() {
        let head = parse_head(
            b"CONNECT www.example.com:443 HTTP/1.1\r\nHost: www.example.com:443\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "www.example.com:443");
        assert_eq!(
            head.header("proxy-authorization"),
            Some("Basic dXNlcjpwYXNz")
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_head(b"not http\r\n\r\n").is_err());
        assert!(parse_head(b"GET\r\n\r\n").is_err());
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nBODY"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn absolute_form_is_rewritten_to_origin_form() {
        let request = parse_head(
            b"GET http://example.com/a/b?c=d HTTP/1.1\r\n\
              Host: example.com\r\n\
              Proxy-Connection: keep-alive\r\n\
              Accept: */*\r\n\r\n",
        )
        .unwrap();
        let url = Url::parse(&request.target).unwrap();
        let upstream = String::from_utf8(build_upstream_head(&request, &url)).unwrap();
        assert!(upstream.starts_with("GET /a/b?c=d HTTP/1.1\r\n"));
        assert!(upstream.contains("Accept: */*\r\n"));
        assert!(upstream.contains("Host: example.com\r\n"));
        assert!(!upstream.to_ascii_lowercase().contains("proxy-connection"));
        assert!(upstream.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn missing_host_header_is_synthesised() {
        let request = parse_head(b"GET http://example.com:8080/x HTTP/1.1\r\n\r\n").unwrap();
        let url = Url::parse(&request.target).unwrap();
        let upstream = String::from_utf8(build_upstream_head(&request, &url)).unwrap();
        assert!(upstream.contains("Host: example.com:8080\r\n"));
    }

    fn test_server(auth: Option<(String, String)>, acl: &str) -> HttpServer {
        use crate::acl::Engine;
        use crate::tunnel::{TunnelClient, TunnelOptions};
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
        let dispatcher = Arc::new(Dispatcher::new(
            tunnel,
            Some(Engine::parse(acl).unwrap()),
        ));
        HttpServer::new(
            dispatcher,
            HttpOptions {
                listen: "127.0.0.1:0".into(),
                auth,
                idle_timeout: None,
                tls: None,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn connect_to_blocked_host_gets_403() -> Result<()> {
        let server = test_server(None, "block domain evil.example\n");
        let (mut client, service) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { server.handle(service).await });
        client
            .write_all(b"CONNECT evil.example:443 HTTP/1.1\r\nHost: evil.example:443\r\n\r\n")
            .await?;
        let mut response = [0u8; 16];
        client.read_exact(&mut response).await?;
        assert!(response.starts_with(b"HTTP/1.1 403"));
        task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn missing_auth_gets_407() -> Result<()> {
        let server = test_server(Some(("user".into(), "pass".into())), "");
        let (mut client, service) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { server.handle(service).await });
        client
            .write_all(b"CONNECT www.example.com:443 HTTP/1.1\r\n\r\n")
            .await?;
        let mut response = [0u8; 16];
        client.read_exact(&mut response).await?;
        assert!(response.starts_with(b"HTTP/1.1 407"));
        task.await??;
        Ok(())
    }
}
