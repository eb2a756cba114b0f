//! Configuration structure
// (c) 2024 Ross Younger

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::obfs::{Obfuscator, XPlusObfuscator, XorObfuscator};
use crate::transport::Carrier;
use crate::tunnel::TunnelOptions;

/// Conversion factor from the configured Mbps figures to bytes per second
pub const MBPS_TO_BPS: u64 = 125_000;

/// Smallest acceptable receive window (QUIC flow control falls apart below this)
pub const MIN_RECEIVE_WINDOW: u64 = 65536;

/// Default per-stream receive window (15 MB)
pub const DEFAULT_STREAM_RECEIVE_WINDOW: u64 = 15_728_640;

/// Default connection receive window (64 MB)
pub const DEFAULT_CONNECTION_RECEIVE_WINDOW: u64 = 67_108_864;

fn default_alpn() -> String {
    "hysteria-proxy".into()
}

fn default_obfs_type() -> String {
    "xplus".into()
}

/// The set of configurable options supported by qpx.
///
/// `default()` returns the hard-wired defaults. Unset string options are
/// empty strings rather than `Option`s, mirroring their representation in
/// the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Configuration {
    // FRONT-ENDS ======================================================================
    /// SOCKS5 listen address (e.g. `127.0.0.1:1080`); empty disables SOCKS5
    pub socks5_addr: String,
    /// SOCKS5 idle timeout in seconds; 0 disables, otherwise must be > 4
    pub socks5_timeout: u16,
    /// Disables SOCKS5 UDP ASSOCIATE support
    pub socks5_disable_udp: bool,
    /// SOCKS5 auth username; empty (with empty password) disables auth
    pub socks5_user: String,
    /// SOCKS5 auth password
    pub socks5_password: String,

    /// HTTP proxy listen address; empty disables HTTP
    pub http_addr: String,
    /// HTTP idle timeout in seconds; 0 disables, otherwise must be > 4
    pub http_timeout: u16,
    /// HTTP Basic auth username
    pub http_user: String,
    /// HTTP Basic auth password
    pub http_password: String,
    /// TLS certificate file; set together with `https_key` to serve HTTPS
    pub https_cert: String,
    /// TLS key file
    pub https_key: String,

    /// Access control list file; empty means proxy everything
    pub acl: String,

    // SERVER ==========================================================================
    /// Server address, `host:port`
    pub server: String,
    /// Carrier protocol tag (empty or `udp`; see [`Carrier`])
    pub protocol: String,
    /// Authentication username (optional; combined with `password`)
    pub username: String,
    /// Authentication password (or standalone token)
    pub password: String,
    /// ALPN token for the tunnel TLS handshake
    #[serde(default = "default_alpn")]
    pub alpn: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Custom CA file (PEM)
    pub ca: String,

    // TRANSPORT =======================================================================
    /// Maximum upload speed in Mbps; must be > 0
    pub up_mbps: u64,
    /// Maximum download speed in Mbps; must be > 0
    pub down_mbps: u64,
    /// Connection-level receive window in bytes; 0 means default
    pub recv_window_conn: u64,
    /// Per-stream receive window in bytes; 0 means default
    pub recv_window_stream: u64,
    /// Obfuscation key; empty disables obfuscation
    pub obfs: String,
    /// Obfuscation variant: `xplus` (salted) or `xor`
    #[serde(default = "default_obfs_type")]
    pub obfs_type: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            socks5_addr: String::new(),
            socks5_timeout: 0,
            socks5_disable_udp: false,
            socks5_user: String::new(),
            socks5_password: String::new(),
            http_addr: String::new(),
            http_timeout: 0,
            http_user: String::new(),
            http_password: String::new(),
            https_cert: String::new(),
            https_key: String::new(),
            acl: String::new(),
            server: String::new(),
            protocol: String::new(),
            username: String::new(),
            password: String::new(),
            alpn: default_alpn(),
            insecure: false,
            ca: String::new(),
            up_mbps: 0,
            down_mbps: 0,
            recv_window_conn: 0,
            recv_window_stream: 0,
            obfs: String::new(),
            obfs_type: default_obfs_type(),
        }
    }
}

impl Configuration {
    /// Cross-field validation. Call once after merging all sources.
    pub fn check(&self) -> Result<()> {
        anyhow::ensure!(
            !self.socks5_addr.is_empty() || !self.http_addr.is_empty(),
            "no SOCKS5 or HTTP listen address"
        );
        anyhow::ensure!(
            self.socks5_timeout == 0 || self.socks5_timeout > 4,
            "invalid SOCKS5 timeout"
        );
        anyhow::ensure!(
            self.http_timeout == 0 || self.http_timeout > 4,
            "invalid HTTP timeout"
        );
        anyhow::ensure!(!self.server.is_empty(), "no server address");
        anyhow::ensure!(
            self.up_mbps > 0 && self.down_mbps > 0,
            "invalid speed (up_mbps and down_mbps must both be set)"
        );
        anyhow::ensure!(
            self.recv_window_conn == 0 || self.recv_window_conn >= MIN_RECEIVE_WINDOW,
            "invalid receive window size"
        );
        anyhow::ensure!(
            self.recv_window_stream == 0 || self.recv_window_stream >= MIN_RECEIVE_WINDOW,
            "invalid receive window size"
        );
        anyhow::ensure!(
            self.https_cert.is_empty() == self.https_key.is_empty(),
            "https_cert and https_key must be set together"
        );
        if !self.obfs.is_empty() {
            anyhow::ensure!(
                matches!(self.obfs_type.as_str(), "xplus" | "xor"),
                "unknown obfs_type '{}'",
                self.obfs_type
            );
        }
        let _ = Carrier::from_tag(&self.protocol)?;
        Ok(())
    }

    /// Declared upload rate, bytes per second
    #[must_use]
    pub fn up_bps(&self) -> u64 {
        self.up_mbps * MBPS_TO_BPS
    }

    /// Declared download rate, bytes per second
    #[must_use]
    pub fn down_bps(&self) -> u64 {
        self.down_mbps * MBPS_TO_BPS
    }

    /// Effective connection receive window (0 resolved to the default)
    #[must_use]
    pub fn recv_window_conn(&self) -> u64 {
        match self.recv_window_conn {
            0 => DEFAULT_CONNECTION_RECEIVE_WINDOW,
            n => n,
        }
    }

    /// Effective per-stream receive window (0 resolved to the default)
    #[must_use]
    pub fn recv_window_stream(&self) -> u64 {
        match self.recv_window_stream {
            0 => DEFAULT_STREAM_RECEIVE_WINDOW,
            n => n,
        }
    }

    /// The credential blob sent in the client hello
    #[must_use]
    pub fn credential(&self) -> Vec<u8> {
        if self.username.is_empty() {
            self.password.clone().into_bytes()
        } else {
            format!("{}:{}", self.username, self.password).into_bytes()
        }
    }

    /// Builds the configured obfuscator, if any
    #[must_use]
    pub fn obfuscator(&self) -> Option<Arc<dyn Obfuscator>> {
        if self.obfs.is_empty() {
            return None;
        }
        let key = self.obfs.as_bytes();
        Some(match self.obfs_type.as_str() {
            "xor" => Arc::new(XorObfuscator::new(key)),
            _ => Arc::new(XPlusObfuscator::new(key)),
        })
    }

    /// SOCKS5 idle timeout as a [`Duration`]
    #[must_use]
    pub fn socks5_timeout(&self) -> Option<Duration> {
        match self.socks5_timeout {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    /// HTTP idle timeout as a [`Duration`]
    #[must_use]
    pub fn http_timeout(&self) -> Option<Duration> {
        match self.http_timeout {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    /// Optional CA file path
    #[must_use]
    pub fn ca_file(&self) -> Option<PathBuf> {
        if self.ca.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.ca))
        }
    }

    /// Optional ACL file path
    #[must_use]
    pub fn acl_file(&self) -> Option<&Path> {
        if self.acl.is_empty() {
            None
        } else {
            Some(Path::new(&self.acl))
        }
    }

    /// Assembles the tunnel client construction parameters
    pub fn tunnel_options(&self) -> Result<TunnelOptions> {
        let _ = Carrier::from_tag(&self.protocol)?;
        Ok(TunnelOptions {
            server_addr: self.server.clone(),
            credential: self.credential(),
            alpn: self.alpn.clone(),
            up_bps: self.up_bps(),
            down_bps: self.down_bps(),
            recv_window_conn: self.recv_window_conn(),
            recv_window_stream: self.recv_window_stream(),
            ca_file: self.ca_file(),
            insecure: self.insecure,
            obfs: self.obfuscator(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid() -> Configuration {
        Configuration {
            socks5_addr: "127.0.0.1:1080".into(),
            server: "example.com:36712".into(),
            password: "da5438aaa690a5748eb59de8f7bedcb0".into(),
            up_mbps: 20,
            down_mbps: 1000,
            ..Configuration::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        valid().check().unwrap();
    }

    #[test]
    fn no_front_end_rejected() {
        let config = Configuration {
            socks5_addr: String::new(),
            ..valid()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn short_timeouts_rejected() {
        for t in 1..=4 {
            let config = Configuration {
                socks5_timeout: t,
                ..valid()
            };
            assert!(config.check().is_err(), "timeout {t} should be rejected");
        }
        let config = Configuration {
            socks5_timeout: 5,
            ..valid()
        };
        config.check().unwrap();
    }

    #[test]
    fn missing_server_rejected() {
        let config = Configuration {
            server: String::new(),
            ..valid()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn zero_speed_rejected() {
        let config = Configuration {
            up_mbps: 0,
            ..valid()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn small_receive_windows_rejected() {
        let config = Configuration {
            recv_window_conn: 65535,
            ..valid()
        };
        assert!(config.check().is_err());
        let config = Configuration {
            recv_window_stream: 1,
            ..valid()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn zero_windows_mean_defaults() {
        let config = valid();
        config.check().unwrap();
        assert_eq!(config.recv_window_conn(), DEFAULT_CONNECTION_RECEIVE_WINDOW);
        assert_eq!(config.recv_window_stream(), DEFAULT_STREAM_RECEIVE_WINDOW);
    }

    #[test]
    fn unsupported_carrier_rejected() {
        let config = Configuration {
            protocol: "faketcp".into(),
            ..valid()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn mbps_conversion() {
        let config = valid();
        assert_eq!(config.up_bps(), 2_500_000);
        assert_eq!(config.down_bps(), 125_000_000);
    }

    #[test]
    fn credential_forms() {
        let config = valid();
        assert_eq!(config.credential(), b"da5438aaa690a5748eb59de8f7bedcb0");
        let config = Configuration {
            username: "alice".into(),
            password: "secret".into(),
            ..valid()
        };
        assert_eq!(config.credential(), b"alice:secret");
    }

    #[test]
    fn obfuscator_selection() {
        assert!(valid().obfuscator().is_none());
        let config = Configuration {
            obfs: "f561508f56ed".into(),
            ..valid()
        };
        assert!(config.obfuscator().is_some());
    }
}
