// Path: crates/crypto/src/trust.rs
//! The per-node trust store.
//!
//! The store owns the authoritative set of trusted peers; pairing is the
//! only path that adds to it. Mutations are serialized and flushed to
//! the node state file before the lock is released.

use gantry_types::error::PersistError;
use gantry_types::model::TrustedPeer;
use gantry_types::persist::StateHandle;
use gantry_types::time::now_unix_ms;
use std::sync::Arc;

/// Fingerprint-keyed set of peers accepted on the data plane.
#[derive(Debug)]
pub struct TrustStore {
    state: Arc<StateHandle>,
}

impl TrustStore {
    /// Wraps the shared node state handle.
    pub fn new(state: Arc<StateHandle>) -> Self {
        Self { state }
    }

    /// Whether a fingerprint is trusted.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.state
            .read(|s| s.trusted_peers.iter().any(|p| p.fingerprint == fingerprint))
    }

    /// Looks up a peer by fingerprint.
    pub fn get(&self, fingerprint: &str) -> Option<TrustedPeer> {
        self.state.read(|s| {
            s.trusted_peers
                .iter()
                .find(|p| p.fingerprint == fingerprint)
                .cloned()
        })
    }

    /// All trusted peers.
    pub fn list(&self) -> Vec<TrustedPeer> {
        self.state.read(|s| s.trusted_peers.clone())
    }

    /// Adds or refreshes a peer. An existing entry with the same
    /// fingerprint keeps its `first_seen`; everything else is replaced.
    pub fn promote(&self, mut peer: TrustedPeer) -> Result<(), PersistError> {
        self.state.update(|s| {
            peer.last_seen = now_unix_ms();
            if let Some(existing) = s
                .trusted_peers
                .iter_mut()
                .find(|p| p.fingerprint == peer.fingerprint)
            {
                peer.first_seen = existing.first_seen;
                *existing = peer;
            } else {
                peer.first_seen = peer.last_seen;
                s.trusted_peers.push(peer);
            }
        })
    }

    /// Removes a peer by fingerprint; returns whether one was present.
    pub fn remove(&self, fingerprint: &str) -> Result<bool, PersistError> {
        self.state.update(|s| {
            let before = s.trusted_peers.len();
            s.trusted_peers.retain(|p| p.fingerprint != fingerprint);
            s.trusted_peers.len() != before
        })
    }

    /// Records that a trusted peer was seen at an address.
    pub fn touch(&self, fingerprint: &str, address: Option<String>) -> Result<(), PersistError> {
        self.state.update(|s| {
            if let Some(peer) = s
                .trusted_peers
                .iter_mut()
                .find(|p| p.fingerprint == fingerprint)
            {
                peer.last_seen = now_unix_ms();
                if address.is_some() {
                    peer.last_known_address = address;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &std::path::Path) -> TrustStore {
        let handle = StateHandle::load_or_default(dir.join("config.json")).unwrap();
        TrustStore::new(Arc::new(handle))
    }

    fn peer(fingerprint: &str) -> TrustedPeer {
        TrustedPeer {
            peer_id: fingerprint.to_string(),
            display_name: "other-host".into(),
            fingerprint: fingerprint.to_string(),
            last_known_address: None,
            first_seen: 0,
            last_seen: 0,
            peer_cert_pem: "-----BEGIN CERTIFICATE-----".into(),
        }
    }

    #[test]
    fn promote_contains_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(!store.contains("ab12"));
        store.promote(peer("ab12")).unwrap();
        assert!(store.contains("ab12"));
        assert_eq!(store.list().len(), 1);

        assert!(store.remove("ab12").unwrap());
        assert!(!store.contains("ab12"));
        assert!(!store.remove("ab12").unwrap());
    }

    #[test]
    fn promote_preserves_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store.promote(peer("cd34")).unwrap();
        let first = store.get("cd34").unwrap().first_seen;
        store.promote(peer("cd34")).unwrap();
        let entry = store.get("cd34").unwrap();
        assert_eq!(entry.first_seen, first);
        assert!(entry.last_seen >= first);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        store_in(dir.path()).promote(peer("ef56")).unwrap();
        // A second handle over the same file sees the persisted peer.
        assert!(store_in(dir.path()).contains("ef56"));
    }
}
