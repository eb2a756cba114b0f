// (c) 2024 Ross Younger

//! Protocol definitions
//!
//! # The qpx tunnel protocol
//!
//! Everything rides a single QUIC connection to the server. The connection is
//! established over an (optionally obfuscated) UDP socket, with TLS 1.3 and a
//! negotiated ALPN token.
//!
//! The protocol flow looks like this:
//!
//! 1. The client opens a bidirectional QUIC stream, the _control stream_, and
//!    sends a [`ClientHello`](control::ClientHello): protocol version,
//!    credential, declared send and receive rates.
//! 1. The server answers with a [`ServerHello`](control::ServerHello). If the
//!    credential was rejected, `ok` is false and no further streams may be
//!    opened. Otherwise the hello carries the server-granted rates; the client
//!    paces its sends at min(declared, granted).
//! 1. For each proxied TCP connection, the client opens a fresh bidirectional
//!    stream and sends a [`TcpRequest`](session::TcpRequest) naming the
//!    destination. The server dials out and answers with a
//!    [`TcpResponse`](session::TcpResponse); after an OK response the stream
//!    carries raw payload bytes in both directions until either side closes.
//! 1. UDP flows are multiplexed over QUIC datagrams, each framed as a
//!    [`UdpDatagram`](session::UdpDatagram) tagged with a server-assigned
//!    session id. Sessions are opened and torn down with control-stream
//!    frames ([`control::UdpSessionOpen`], [`control::UdpSessionClose`]).
//!
//! All integers are big-endian; variable-length fields carry a two-byte length
//! prefix (see [`wire`]). The byte layout must match the deployed server
//! exactly, which is why these frames are encoded by hand rather than through
//! a serialization library.

pub mod control;
pub mod session;
pub mod wire;

/// Protocol version carried in the client hello
pub const PROTOCOL_VERSION: u8 = 3;

/// Helper type definition (syntactic sugar)
pub(crate) type RawStreamPair = (quinn::SendStream, quinn::RecvStream);

/// Syntactic sugar type for a bidirectional QUIC stream
#[derive(Debug)]
pub(crate) struct StreamPair {
    /// outbound data
    pub send: quinn::SendStream,
    /// inbound data
    pub recv: quinn::RecvStream,
    // The underlying Send/Recv stream objects have Drop handlers which do the Right Thing.
}

impl From<RawStreamPair> for StreamPair {
    fn from(value: RawStreamPair) -> Self {
        Self {
            send: value.0,
            recv: value.1,
        }
    }
}
