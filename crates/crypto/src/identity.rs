// Path: crates/crypto/src/identity.rs
//! The node's long-lived keypair and self-signed certificate.
//!
//! Layout under `<data_dir>/certs/`:
//!   server.crt      PEM certificate
//!   server.key      PEM private key, owner-only permissions
//!   identity.json   issuance metadata (expiry, fingerprint)
//!
//! All writes are tempfile + rename. The certificate is regenerated when
//! it has expired; peers must then re-pair, since the fingerprint changes.

use crate::fingerprint_der;
use gantry_types::error::CryptoError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

const CERT_FILE: &str = "server.crt";
const KEY_FILE: &str = "server.key";
const META_FILE: &str = "identity.json";

/// Certificate validity; expired identities are rotated at startup.
const VALIDITY_DAYS: i64 = 365;

/// Issuance metadata persisted beside the certificate so expiry can be
/// checked without an X.509 parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityMeta {
    created_at_unix: i64,
    not_after_unix: i64,
    fingerprint: String,
}

/// A loaded node identity.
pub struct Identity {
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
    fingerprint: String,
    not_after_unix: i64,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .field("not_after_unix", &self.not_after_unix)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Loads the identity from `<data_dir>/certs/`, generating a fresh
    /// one when absent or expired. Failure here is fatal at startup.
    pub fn load_or_generate(data_dir: &Path, common_name: &str) -> Result<Self, CryptoError> {
        let dir = data_dir.join("certs");
        match Self::load(&dir)? {
            Some(identity) if !identity.is_expired(OffsetDateTime::now_utc()) => Ok(identity),
            Some(identity) => {
                tracing::warn!(
                    fingerprint = %identity.fingerprint,
                    "identity certificate expired; generating a new keypair"
                );
                Self::generate_and_persist(&dir, common_name)
            }
            None => Self::generate_and_persist(&dir, common_name),
        }
    }

    fn load(dir: &Path) -> Result<Option<Self>, CryptoError> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_pem = std::fs::read_to_string(&cert_path)
            .map_err(|e| CryptoError::IdentityLoad(format!("{}: {e}", cert_path.display())))?;
        let key_pem = std::fs::read_to_string(&key_path)
            .map_err(|e| CryptoError::IdentityLoad(format!("{}: {e}", key_path.display())))?;

        let cert_der = parse_cert_pem(&cert_pem)?;
        let key_der = parse_key_pem(&key_pem)?;
        let fingerprint = fingerprint_der(cert_der.as_ref());

        let meta: Option<IdentityMeta> = gantry_types::persist::read_json(&dir.join(META_FILE))
            .map_err(|e| CryptoError::IdentityLoad(e.to_string()))?;
        // A missing or mismatched metadata file means the cert was
        // replaced out of band; treat it as expired to force a rotation.
        let not_after_unix = match meta {
            Some(m) if m.fingerprint == fingerprint => m.not_after_unix,
            _ => 0,
        };

        Ok(Some(Self {
            cert_pem,
            key_pem,
            cert_der,
            key_der,
            fingerprint,
            not_after_unix,
        }))
    }

    fn generate_and_persist(dir: &Path, common_name: &str) -> Result<Self, CryptoError> {
        let now = OffsetDateTime::now_utc();
        let mut params = rcgen::CertificateParams::new(vec![common_name.to_string()]);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.not_before = now;
        params.not_after = now + Duration::days(VALIDITY_DAYS);

        let cert = rcgen::Certificate::from_params(params)
            .map_err(|e| CryptoError::IdentityPersist(format!("certificate generation: {e}")))?;
        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| CryptoError::IdentityPersist(format!("certificate encoding: {e}")))?;
        let key_pem = cert.serialize_private_key_pem();

        std::fs::create_dir_all(dir)
            .map_err(|e| CryptoError::IdentityPersist(format!("{}: {e}", dir.display())))?;
        write_atomic(&dir.join(CERT_FILE), cert_pem.as_bytes(), 0o644)?;
        write_atomic(&dir.join(KEY_FILE), key_pem.as_bytes(), 0o600)?;

        let cert_der = parse_cert_pem(&cert_pem)?;
        let key_der = parse_key_pem(&key_pem)?;
        let fingerprint = fingerprint_der(cert_der.as_ref());

        let meta = IdentityMeta {
            created_at_unix: now.unix_timestamp(),
            not_after_unix: (now + Duration::days(VALIDITY_DAYS)).unix_timestamp(),
            fingerprint: fingerprint.clone(),
        };
        gantry_types::persist::write_json_atomic(&dir.join(META_FILE), &meta)
            .map_err(|e| CryptoError::IdentityPersist(e.to_string()))?;

        tracing::info!(fingerprint = %fingerprint, "generated node identity");

        Ok(Self {
            cert_pem,
            key_pem,
            cert_der,
            key_der,
            fingerprint,
            not_after_unix: meta.not_after_unix,
        })
    }

    fn is_expired(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() >= self.not_after_unix
    }

    /// The node's stable identity.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The certificate, PEM-encoded (carried in pairing messages).
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The certificate, DER-encoded.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// A clone of the private key for TLS configuration.
    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        self.key_der.clone_key()
    }

    #[allow(dead_code)]
    fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

fn parse_cert_pem(pem: &str) -> Result<CertificateDer<'static>, CryptoError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let mut certs = rustls_pemfile::certs(&mut reader);
    let cert = certs
        .next()
        .ok_or_else(|| CryptoError::InvalidCertificate("no certificate in PEM".into()))?
        .map_err(|e| CryptoError::InvalidCertificate(e.to_string()));
    cert
}

fn parse_key_pem(pem: &str) -> Result<PrivateKeyDer<'static>, CryptoError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CryptoError::IdentityLoad(e.to_string()))?
        .ok_or_else(|| CryptoError::IdentityLoad("no private key in PEM".into()))
}

/// Parses a peer certificate PEM into DER, for trust-store entries.
pub fn peer_cert_from_pem(pem: &str) -> Result<CertificateDer<'static>, CryptoError> {
    parse_cert_pem(pem)
}

fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<(), CryptoError> {
    let dir: PathBuf = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| CryptoError::IdentityPersist(format!("{}: {e}", path.display())))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| CryptoError::IdentityPersist(format!("{}: {e}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        tmp.as_file()
            .set_permissions(perms)
            .map_err(|e| CryptoError::IdentityPersist(format!("{}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path)
        .map_err(|e| CryptoError::IdentityPersist(format!("{}: {}", path.display(), e.error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_load_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = Identity::load_or_generate(dir.path(), "host-a").unwrap();
        let second = Identity::load_or_generate(dir.path(), "host-a").unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.fingerprint().len(), 64);
    }

    #[test]
    fn expired_identity_is_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let first = Identity::load_or_generate(dir.path(), "host-a").unwrap();

        // Backdate the metadata so the certificate reads as expired.
        let meta_path = dir.path().join("certs").join(META_FILE);
        let meta = IdentityMeta {
            created_at_unix: 0,
            not_after_unix: 1,
            fingerprint: first.fingerprint().to_string(),
        };
        gantry_types::persist::write_json_atomic(&meta_path, &meta).unwrap();

        let rotated = Identity::load_or_generate(dir.path(), "host-a").unwrap();
        assert_ne!(rotated.fingerprint(), first.fingerprint());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        Identity::load_or_generate(dir.path(), "host-a").unwrap();
        let meta = std::fs::metadata(dir.path().join("certs").join(KEY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
