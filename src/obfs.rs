//! Per-packet obfuscation
// (c) 2024 Ross Younger
//!
//! Every UDP datagram underneath QUIC can be run through a symmetric
//! transform to defeat protocol fingerprinting. Two transforms interoperate
//! with existing deployments: a plain key-cycling XOR, and the salted "XPlus"
//! variant which prefixes each packet with a fresh random salt and XORs
//! against SHA-256(key ‖ salt).
//!
//! Obfuscation is not encryption. QUIC's own TLS layer provides
//! confidentiality; this layer only makes the packets look like noise.

use rand::RngCore as _;
use sha2::{Digest as _, Sha256};

/// Salt length for the XPlus transform
pub const XPLUS_SALT_LEN: usize = 16;

/// A symmetric per-packet transform.
///
/// Implementations must satisfy `deobfuscate(obfuscate(x)) == x` for all `x`.
pub trait Obfuscator: Send + Sync + std::fmt::Debug + 'static {
    /// Transforms an outbound packet into its wire form
    fn obfuscate(&self, packet: &[u8]) -> Vec<u8>;
    /// Reverses the transform on a received packet.
    /// `None` means the packet is malformed and must be dropped silently.
    fn deobfuscate(&self, wire: &[u8]) -> Option<Vec<u8>>;
}

/// Key-cycling XOR. Stateless; byte `i` is XORed with `key[i % key.len()]`.
#[derive(Clone)]
pub struct XorObfuscator {
    key: Vec<u8>,
}

impl std::fmt::Debug for XorObfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("XorObfuscator")
    }
}

impl XorObfuscator {
    /// Constructor. The key may be any non-empty byte string.
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty(), "obfuscation key must not be empty");
        Self { key: key.to_vec() }
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl Obfuscator for XorObfuscator {
    fn obfuscate(&self, packet: &[u8]) -> Vec<u8> {
        self.apply(packet)
    }

    fn deobfuscate(&self, wire: &[u8]) -> Option<Vec<u8>> {
        Some(self.apply(wire))
    }
}

/// Salted XOR. Each outbound packet gains a fresh 16-byte salt; the payload
/// is XORed against SHA-256(key ‖ salt), cycling the digest as needed.
/// Identical plaintexts therefore produce different wire bytes.
#[derive(Clone)]
pub struct XPlusObfuscator {
    key: Vec<u8>,
}

impl std::fmt::Debug for XPlusObfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("XPlusObfuscator")
    }
}

impl XPlusObfuscator {
    /// Constructor. The key may be any non-empty byte string.
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty(), "obfuscation key must not be empty");
        Self { key: key.to_vec() }
    }

    fn packet_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(salt);
        hasher.finalize().into()
    }
}

impl Obfuscator for XPlusObfuscator {
    fn obfuscate(&self, packet: &[u8]) -> Vec<u8> {
        let mut salt = [0u8; XPLUS_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = self.packet_key(&salt);
        let mut out = Vec::with_capacity(XPLUS_SALT_LEN + packet.len());
        out.extend_from_slice(&salt);
        out.extend(packet.iter().zip(key.iter().cycle()).map(|(b, k)| b ^ k));
        out
    }

    fn deobfuscate(&self, wire: &[u8]) -> Option<Vec<u8>> {
        // A packet without a full salt carries no payload at all.
        if wire.len() <= XPLUS_SALT_LEN {
            return None;
        }
        let (salt, body) = wire.split_at(XPLUS_SALT_LEN);
        let key = self.packet_key(salt);
        Some(
            body.iter()
                .zip(key.iter().cycle())
                .map(|(b, k)| b ^ k)
                .collect(),
        )
    }
}
