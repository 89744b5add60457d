// Path: crates/crypto/src/tls.rs
//! Mutual-TLS configuration for the data plane.
//!
//! Certificates are self-signed, so chain validation is meaningless;
//! authentication is by certificate fingerprint. Both directions use a
//! custom verifier that accepts a handshake iff the presented
//! certificate's fingerprint passes the configured authorizer. TLS 1.3
//! only, on both ends.

use crate::fingerprint_der;
use crate::identity::Identity;
use crate::trust::TrustStore;
use gantry_types::error::CryptoError;
use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, Error as TlsError,
    ServerConfig, SignatureScheme,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Decides whether a peer fingerprint may complete the handshake.
pub trait FingerprintAuthorizer: Send + Sync {
    /// True when the fingerprint is acceptable.
    fn is_authorized(&self, fingerprint: &str) -> bool;
    /// Short label for log lines.
    fn describe(&self) -> String;
}

/// Accepts exactly one expected fingerprint.
pub struct PinnedFingerprint(pub String);

impl FingerprintAuthorizer for PinnedFingerprint {
    fn is_authorized(&self, fingerprint: &str) -> bool {
        // Fingerprints are fixed-width lowercase hex; plain equality.
        self.0 == fingerprint
    }

    fn describe(&self) -> String {
        format!("pinned:{}", &self.0[..self.0.len().min(12)])
    }
}

impl FingerprintAuthorizer for TrustStore {
    fn is_authorized(&self, fingerprint: &str) -> bool {
        self.contains(fingerprint)
    }

    fn describe(&self) -> String {
        "trust-store".to_string()
    }
}

/// A mutable fingerprint set for session-scoped authorization: the
/// target worker pins the source fingerprint named by its start command
/// here for the duration of the migration.
#[derive(Default)]
pub struct AllowList {
    entries: RwLock<HashSet<String>>,
}

impl AllowList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorizes a fingerprint.
    pub fn allow(&self, fingerprint: String) {
        self.entries.write().insert(fingerprint);
    }

    /// Withdraws a fingerprint.
    pub fn revoke(&self, fingerprint: &str) {
        self.entries.write().remove(fingerprint);
    }
}

impl FingerprintAuthorizer for AllowList {
    fn is_authorized(&self, fingerprint: &str) -> bool {
        self.entries.read().contains(fingerprint)
    }

    fn describe(&self) -> String {
        "allow-list".to_string()
    }
}

/// Accepts a fingerprint that any member authorizer accepts.
pub struct AnyOf(pub Vec<Arc<dyn FingerprintAuthorizer>>);

impl FingerprintAuthorizer for AnyOf {
    fn is_authorized(&self, fingerprint: &str) -> bool {
        self.0.iter().any(|a| a.is_authorized(fingerprint))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|a| a.describe()).collect();
        format!("any-of[{}]", parts.join(","))
    }
}

/// Certificate verifier for both handshake directions: fingerprint
/// authorization plus standard signature verification.
struct FingerprintVerifier {
    authorizer: Arc<dyn FingerprintAuthorizer>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl FingerprintVerifier {
    fn new(authorizer: Arc<dyn FingerprintAuthorizer>) -> Self {
        Self {
            authorizer,
            algorithms: ring::default_provider().signature_verification_algorithms,
        }
    }

    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), TlsError> {
        let fingerprint = fingerprint_der(end_entity.as_ref());
        if self.authorizer.is_authorized(&fingerprint) {
            Ok(())
        } else {
            tracing::warn!(
                fingerprint = %fingerprint,
                authorizer = %self.authorizer.describe(),
                "rejected peer certificate"
            );
            Err(TlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }
}

impl std::fmt::Debug for FingerprintVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintVerifier")
            .field("authorizer", &self.authorizer.describe())
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for FingerprintVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Server-side mutual-TLS config: presents the node certificate and
/// requires a client certificate the authorizer accepts.
pub fn server_tls_config(
    identity: &Identity,
    authorizer: Arc<dyn FingerprintAuthorizer>,
) -> Result<Arc<ServerConfig>, CryptoError> {
    let verifier = Arc::new(FingerprintVerifier::new(authorizer));
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| CryptoError::TlsConfig(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![identity.cert_der().clone()], identity.key_der())
        .map_err(|e| CryptoError::TlsConfig(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Client-side mutual-TLS config: presents the node certificate and
/// requires a server certificate the authorizer accepts.
pub fn client_tls_config(
    identity: &Identity,
    authorizer: Arc<dyn FingerprintAuthorizer>,
) -> Result<Arc<ClientConfig>, CryptoError> {
    let verifier = Arc::new(FingerprintVerifier::new(authorizer));
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| CryptoError::TlsConfig(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(vec![identity.cert_der().clone()], identity.key_der())
        .map_err(|e| CryptoError::TlsConfig(e.to_string()))?;
    Ok(Arc::new(config))
}

/// The SNI name used on data-plane connections. Peers are identified by
/// fingerprint, not by name; this value is constant.
pub fn data_plane_server_name() -> ServerName<'static> {
    ServerName::try_from("gantry").expect("constant DNS name")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::persist::StateHandle;

    #[test]
    fn pinned_authorizer_is_exact() {
        let pin = PinnedFingerprint("ab".repeat(32));
        assert!(pin.is_authorized(&"ab".repeat(32)));
        assert!(!pin.is_authorized(&"cd".repeat(32)));
    }

    #[test]
    fn allow_list_grants_and_revokes() {
        let list = AllowList::new();
        assert!(!list.is_authorized("ff00"));
        list.allow("ff00".into());
        assert!(list.is_authorized("ff00"));
        list.revoke("ff00");
        assert!(!list.is_authorized("ff00"));
    }

    #[test]
    fn any_of_is_a_union() {
        let list = Arc::new(AllowList::new());
        list.allow("11".repeat(32));
        let union = AnyOf(vec![
            Arc::new(PinnedFingerprint("22".repeat(32))) as Arc<dyn FingerprintAuthorizer>,
            list,
        ]);
        assert!(union.is_authorized(&"11".repeat(32)));
        assert!(union.is_authorized(&"22".repeat(32)));
        assert!(!union.is_authorized(&"33".repeat(32)));
    }

    #[test]
    fn tls_configs_build_from_generated_identity() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::load_or_generate(dir.path(), "host-a").unwrap();
        let state = Arc::new(StateHandle::load_or_default(dir.path().join("config.json")).unwrap());
        let store = Arc::new(TrustStore::new(state));

        server_tls_config(&identity, store.clone()).unwrap();
        client_tls_config(&identity, Arc::new(PinnedFingerprint("00".repeat(32)))).unwrap();
        client_tls_config(&identity, store).unwrap();
    }
}
