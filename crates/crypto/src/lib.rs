// Path: crates/crypto/src/lib.rs
//! Identity, trust and transport security for Gantry.
//!
//! Every node owns a long-lived self-signed certificate; the SHA-256 of
//! its DER encoding is the node's *fingerprint* and its stable identity.
//! Data-plane connections run mutual TLS 1.3 and are refused unless the
//! presented peer fingerprint is pinned for the session or present in
//! the trust store.

pub mod identity;
pub mod kdf;
pub mod tls;
pub mod trust;

pub use identity::Identity;
pub use trust::TrustStore;

use sha2::{Digest, Sha256};

/// Lowercase-hex SHA-256 of a DER-encoded certificate.
pub fn fingerprint_der(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint_der(b"certificate bytes");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Stable across calls.
        assert_eq!(fp, fingerprint_der(b"certificate bytes"));
        assert_ne!(fp, fingerprint_der(b"other bytes"));
    }
}
