// (c) 2024 Ross Younger

//! qpx is a client-side proxy gateway: local applications speak SOCKS5 or
//! HTTP to it, and their traffic leaves the machine as a single obfuscated,
//! congestion-controlled QUIC connection to a remote server.
//!
//! ## Overview
//! - 🧦 SOCKS5 (CONNECT + UDP ASSOCIATE) and HTTP (absolute-form + CONNECT)
//!   front-ends, with optional authentication
//! - 🗺️ Per-destination routing through an access control list: proxy,
//!   direct, block, or hijack to a substitute host
//! - 🚀 A declared-rate congestion controller ("Brutal") that holds the
//!   configured bandwidth on lossy paths where loss-based algorithms stall
//! - 🎭 Optional per-packet obfuscation beneath QUIC, to resist protocol
//!   fingerprinting
//!
//! ## How it works
//!
//! 1. At startup the client opens a QUIC connection to the configured
//!    server (TLS 1.3, custom ALPN) over a UDP socket which may be wrapped
//!    in an [obfuscator](obfs).
//! 1. A hello exchange on a dedicated control stream authenticates the
//!    client and negotiates effective bandwidths; the send-side pacer is
//!    clamped to min(declared, granted). See [protocol] for the framing.
//! 1. Each proxied TCP connection becomes one bidirectional QUIC stream;
//!    UDP flows ride QUIC datagrams tagged with a session id.
//! 1. The [SOCKS5](proxy::socks5) and [HTTP](proxy::http) front-ends share
//!    one [dispatcher](proxy::Dispatcher), which consults the [ACL](acl)
//!    per destination and splices bytes between the local connection and
//!    whichever route won.
//!
//! ## Configuration
//!
//! Options come from a TOML file (`--config`) merged with command-line
//! overrides; see [config]. A minimal client configuration:
//!
//! ```toml
//! server = "example.com:36712"
//! password = "yubiyubi"
//! socks5_addr = "127.0.0.1:1080"
//! up_mbps = 20
//! down_mbps = 100
//! ```
//!
//! ## MSRV policy
//!
//! As this is an application crate, the MSRV is not guaranteed to remain
//! stable. The MSRV may be upgraded from time to time to take advantage of
//! new language features.

mod cli;
pub use cli::cli; // needs to be re-exported for the binary crate

pub mod acl;
mod client;
pub mod config;
pub mod congestion;
pub mod obfs;
pub mod protocol;
pub mod proxy;
pub mod tls;
pub mod transport;
pub mod tunnel;
pub mod util;

pub mod os;
