// Path: crates/pairing/src/session.rs
//! Pairing session management: code generation, the ephemeral key
//! exchange, and promotion of verified peers into the trust store.

use crate::rate_limit::RateLimiter;
use crate::CODE_TTL_SECS;
use base64::Engine;
use gantry_crypto::{fingerprint_der, kdf, Identity, TrustStore};
use gantry_ipc::v1::PairingEnvelope;
use gantry_types::error::PairingError;
use gantry_types::model::TrustedPeer;
use gantry_types::time::now_unix_ms;
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use x25519_dalek::{PublicKey, StaticSecret};

const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;

/// How long an expired session lingers so a late message gets the
/// expired-code error instead of an unknown-session error.
const EXPIRY_GRACE: Duration = Duration::from_secs(60);

/// An initiator-side session: this host generated the code and waits
/// for the peer to dial in.
struct OpenSession {
    code_hash: [u8; 32],
    secret: StaticSecret,
    public: PublicKey,
    expires_at: Instant,
    completed: bool,
}

/// The result of a completed pairing, on either side.
#[derive(Debug)]
pub struct PairingOutcome {
    /// Fingerprint of the newly trusted peer.
    pub peer_fingerprint: String,
    /// The peer's self-reported display name. Cosmetic only.
    pub peer_display_name: String,
    /// Session key derived from the ephemeral shared secret.
    pub session_key: [u8; 32],
}

/// A responder-side session: the host where the operator typed the code.
pub struct RedeemSession {
    code_hash: [u8; 32],
    secret: StaticSecret,
    public: PublicKey,
}

/// Owns pairing sessions and the exchange endpoint's rate limiter.
pub struct PairingManager {
    identity: Arc<Identity>,
    trust: Arc<TrustStore>,
    display_name: String,
    sessions: Mutex<Vec<OpenSession>>,
    limiter: Mutex<RateLimiter>,
}

impl PairingManager {
    /// A manager bound to this node's identity and trust store.
    pub fn new(identity: Arc<Identity>, trust: Arc<TrustStore>, display_name: String) -> Self {
        Self {
            identity,
            trust,
            display_name,
            sessions: Mutex::new(Vec::new()),
            limiter: Mutex::new(RateLimiter::new()),
        }
    }

    /// Generates a fresh single-use code and opens an initiator session.
    /// Returns the code and its expiry as Unix milliseconds.
    pub fn generate_code(&self) -> (String, u64) {
        let mut rng = rand::thread_rng();
        let code: String = (0..CODE_LEN)
            .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
            .collect();

        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        let session = OpenSession {
            code_hash: hash_code(&code),
            secret,
            public,
            expires_at: Instant::now() + Duration::from_secs(CODE_TTL_SECS),
            completed: false,
        };

        let mut sessions = self.sessions.lock();
        purge_sessions(&mut sessions);
        sessions.push(session);

        (code, now_unix_ms() + CODE_TTL_SECS * 1000)
    }

    /// Handles an incoming exchange message on the initiator side:
    /// verifies the code binding, promotes the peer's certificate, and
    /// returns the reply envelope for the peer to verify in turn.
    pub fn handle_exchange(
        &self,
        source_addr: &str,
        envelope: PairingEnvelope,
    ) -> Result<(PairingEnvelope, PairingOutcome), PairingError> {
        self.limiter.lock().check(source_addr, Instant::now())?;

        let peer_public = parse_public_key(&envelope.public_key)?;
        let now = Instant::now();

        let mut sessions = self.sessions.lock();
        purge_sessions(&mut sessions);

        let mut matched: Option<usize> = None;
        let mut matched_expired = false;
        for (i, session) in sessions.iter().enumerate() {
            let expected = verifier(peer_public.as_bytes(), &session.code_hash);
            if expected[..] == envelope.verifier[..] {
                if now >= session.expires_at {
                    matched_expired = true;
                    continue;
                }
                matched = Some(i);
                break;
            }
        }

        let index = match matched {
            Some(i) => i,
            None if matched_expired => return Err(PairingError::ExpiredCode),
            None if sessions.is_empty() => return Err(PairingError::UnknownSession),
            None => return Err(PairingError::InvalidVerifier),
        };
        if sessions[index].completed {
            return Err(PairingError::AlreadyCompleted);
        }

        let outcome = self.promote_peer(&envelope, Some(source_addr))?;
        let session = &mut sessions[index];
        let shared = session.secret.diffie_hellman(&peer_public);
        let session_key = kdf::derive_session_key(shared.as_bytes())
            .map_err(|e| PairingError::Transport(e.to_string()))?;
        session.completed = true;

        let reply = PairingEnvelope {
            display_name: self.display_name.clone(),
            public_key: session.public.as_bytes().to_vec(),
            verifier: verifier(session.public.as_bytes(), &session.code_hash).to_vec(),
            certificate_der: self.identity.cert_der().as_ref().to_vec(),
        };

        tracing::info!(
            peer = %outcome.peer_fingerprint,
            name = %outcome.peer_display_name,
            "pairing completed (initiator)"
        );

        Ok((
            reply,
            PairingOutcome {
                session_key,
                ..outcome
            },
        ))
    }

    /// Opens a responder session from an operator-entered code. The
    /// returned session produces the envelope to send to the initiator.
    pub fn begin_redeem(&self, code: &str) -> RedeemSession {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        RedeemSession {
            code_hash: hash_code(code),
            secret,
            public,
        }
    }

    /// Builds the responder's outbound envelope.
    pub fn redeem_envelope(&self, session: &RedeemSession) -> PairingEnvelope {
        PairingEnvelope {
            display_name: self.display_name.clone(),
            public_key: session.public.as_bytes().to_vec(),
            verifier: verifier(session.public.as_bytes(), &session.code_hash).to_vec(),
            certificate_der: self.identity.cert_der().as_ref().to_vec(),
        }
    }

    /// Verifies the initiator's reply and promotes its certificate.
    pub fn complete_redeem(
        &self,
        session: RedeemSession,
        reply: PairingEnvelope,
    ) -> Result<PairingOutcome, PairingError> {
        let peer_public = parse_public_key(&reply.public_key)?;
        let expected = verifier(peer_public.as_bytes(), &session.code_hash);
        if expected[..] != reply.verifier[..] {
            return Err(PairingError::InvalidVerifier);
        }

        let outcome = self.promote_peer(&reply, None)?;
        let shared = session.secret.diffie_hellman(&peer_public);
        let session_key = kdf::derive_session_key(shared.as_bytes())
            .map_err(|e| PairingError::Transport(e.to_string()))?;

        tracing::info!(
            peer = %outcome.peer_fingerprint,
            name = %outcome.peer_display_name,
            "pairing completed (responder)"
        );

        Ok(PairingOutcome {
            session_key,
            ..outcome
        })
    }

    fn promote_peer(
        &self,
        envelope: &PairingEnvelope,
        source_addr: Option<&str>,
    ) -> Result<PairingOutcome, PairingError> {
        if envelope.certificate_der.is_empty() {
            return Err(PairingError::MalformedCertificate(
                "empty certificate".into(),
            ));
        }
        let fingerprint = fingerprint_der(&envelope.certificate_der);
        let peer = TrustedPeer {
            peer_id: fingerprint.clone(),
            display_name: envelope.display_name.clone(),
            fingerprint: fingerprint.clone(),
            last_known_address: source_addr.map(str::to_string),
            first_seen: 0,
            last_seen: 0,
            peer_cert_pem: der_to_pem(&envelope.certificate_der),
        };
        self.trust
            .promote(peer)
            .map_err(|e| PairingError::Transport(format!("trust store: {e}")))?;
        Ok(PairingOutcome {
            peer_fingerprint: fingerprint,
            peer_display_name: envelope.display_name.clone(),
            session_key: [0u8; 32],
        })
    }

    #[cfg(test)]
    fn expire_open_sessions(&self) {
        let mut sessions = self.sessions.lock();
        for s in sessions.iter_mut() {
            s.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }
}

fn hash_code(code: &str) -> [u8; 32] {
    // Codes are case-insensitive for the operator's sake.
    Sha256::digest(code.to_ascii_uppercase().as_bytes()).into()
}

fn verifier(public_key: &[u8], code_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hasher.update(code_hash);
    hasher.finalize().into()
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, PairingError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| PairingError::InvalidVerifier)?;
    Ok(PublicKey::from(array))
}

fn purge_sessions(sessions: &mut Vec<OpenSession>) {
    let now = Instant::now();
    sessions.retain(|s| now < s.expires_at + EXPIRY_GRACE);
}

fn der_to_pem(der: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::persist::StateHandle;

    fn manager(name: &str) -> (PairingManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(Identity::load_or_generate(dir.path(), name).unwrap());
        let state =
            Arc::new(StateHandle::load_or_default(dir.path().join("config.json")).unwrap());
        let trust = Arc::new(TrustStore::new(state));
        (
            PairingManager::new(identity, trust, name.to_string()),
            dir,
        )
    }

    #[test]
    fn full_exchange_establishes_mutual_trust() {
        let (alpha, _da) = manager("alpha");
        let (beta, _db) = manager("beta");

        let (code, expires_at_ms) = alpha.generate_code();
        assert_eq!(code.len(), CODE_LEN);
        assert!(expires_at_ms > now_unix_ms());

        let redeem = beta.begin_redeem(&code);
        let envelope = beta.redeem_envelope(&redeem);
        let (reply, alpha_outcome) = alpha.handle_exchange("10.0.0.2", envelope).unwrap();
        let beta_outcome = beta.complete_redeem(redeem, reply).unwrap();

        assert_eq!(
            alpha_outcome.peer_fingerprint,
            beta.identity.fingerprint()
        );
        assert_eq!(
            beta_outcome.peer_fingerprint,
            alpha.identity.fingerprint()
        );
        // Both sides derived the same session key from the ECDH secret.
        assert_eq!(alpha_outcome.session_key, beta_outcome.session_key);
        assert_ne!(alpha_outcome.session_key, [0u8; 32]);

        assert!(alpha.trust.contains(beta.identity.fingerprint()));
        assert!(beta.trust.contains(alpha.identity.fingerprint()));
    }

    #[test]
    fn wrong_code_is_rejected() {
        let (alpha, _da) = manager("alpha");
        let (beta, _db) = manager("beta");

        let _ = alpha.generate_code();
        let redeem = beta.begin_redeem("WRONG1");
        let envelope = beta.redeem_envelope(&redeem);
        let result = alpha.handle_exchange("10.0.0.2", envelope);
        assert!(matches!(result, Err(PairingError::InvalidVerifier)));
        assert!(!alpha.trust.contains(beta.identity.fingerprint()));
    }

    #[test]
    fn expired_code_is_reported_distinctly() {
        let (alpha, _da) = manager("alpha");
        let (beta, _db) = manager("beta");

        let (code, _) = alpha.generate_code();
        alpha.expire_open_sessions();

        let redeem = beta.begin_redeem(&code);
        let envelope = beta.redeem_envelope(&redeem);
        let result = alpha.handle_exchange("10.0.0.2", envelope);
        assert!(matches!(result, Err(PairingError::ExpiredCode)));
    }

    #[test]
    fn sessions_are_single_use() {
        let (alpha, _da) = manager("alpha");
        let (beta, _db) = manager("beta");

        let (code, _) = alpha.generate_code();
        let redeem = beta.begin_redeem(&code);
        let envelope = beta.redeem_envelope(&redeem);
        alpha.handle_exchange("10.0.0.2", envelope.clone()).unwrap();

        let replay = alpha.handle_exchange("10.0.0.2", envelope);
        assert!(matches!(replay, Err(PairingError::AlreadyCompleted)));
    }

    #[test]
    fn no_open_session_yields_unknown() {
        let (alpha, _da) = manager("alpha");
        let (beta, _db) = manager("beta");

        let redeem = beta.begin_redeem("ABC123");
        let envelope = beta.redeem_envelope(&redeem);
        let result = alpha.handle_exchange("10.0.0.2", envelope);
        assert!(matches!(result, Err(PairingError::UnknownSession)));
    }

    #[test]
    fn tampered_reply_fails_on_responder() {
        let (alpha, _da) = manager("alpha");
        let (beta, _db) = manager("beta");

        let (code, _) = alpha.generate_code();
        let redeem = beta.begin_redeem(&code);
        let envelope = beta.redeem_envelope(&redeem);
        let (mut reply, _) = alpha.handle_exchange("10.0.0.2", envelope).unwrap();
        reply.verifier[0] ^= 0xFF;

        let result = beta.complete_redeem(redeem, reply);
        assert!(matches!(result, Err(PairingError::InvalidVerifier)));
    }
}
