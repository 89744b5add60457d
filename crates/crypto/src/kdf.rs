// Path: crates/crypto/src/kdf.rs
//! Key derivation for pairing sessions.

use gantry_types::error::CryptoError;
use hkdf::Hkdf;
use sha2::Sha256;

const SESSION_KEY_INFO: &[u8] = b"gantry-pairing-session-v1";

/// Derives the 32-byte pairing session key from an X25519 shared secret
/// via HKDF-SHA256 with a fixed info string.
pub fn derive_session_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(SESSION_KEY_INFO, &mut okm)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_secret_dependent() {
        let a = derive_session_key(b"shared secret one").unwrap();
        let b = derive_session_key(b"shared secret one").unwrap();
        let c = derive_session_key(b"shared secret two").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
