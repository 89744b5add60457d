// Path: crates/worker/src/data_server.rs
//! The worker's data-plane listener.
//!
//! Serves direct chunk streams over mutual TLS. A connecting peer must
//! present a certificate whose fingerprint is either in the trust store
//! or on the session allow-list (populated from the fingerprint named in
//! a target-role start command).

use crate::receiver::{receive_loop, DirectChunkStream};
use crate::store::ResourceStore;
use gantry_crypto::tls::{server_tls_config, AllowList, AnyOf, FingerprintAuthorizer};
use gantry_crypto::{Identity, TrustStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// The mutual-TLS chunk-stream listener.
pub struct DataServer {
    identity: Arc<Identity>,
    trust: Arc<TrustStore>,
    allow: Arc<AllowList>,
    store: Arc<dyn ResourceStore>,
}

impl DataServer {
    /// A listener over this node's identity and stores.
    pub fn new(
        identity: Arc<Identity>,
        trust: Arc<TrustStore>,
        allow: Arc<AllowList>,
        store: Arc<dyn ResourceStore>,
    ) -> Self {
        Self {
            identity,
            trust,
            allow,
            store,
        }
    }

    /// Accepts connections until cancellation. Listen failure is fatal
    /// at startup.
    pub async fn run(
        self: Arc<Self>,
        listen_addr: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let authorizer: Arc<dyn FingerprintAuthorizer> = Arc::new(AnyOf(vec![
            self.trust.clone() as Arc<dyn FingerprintAuthorizer>,
            self.allow.clone() as Arc<dyn FingerprintAuthorizer>,
        ]));
        let tls = server_tls_config(&self.identity, authorizer)?;
        let acceptor = TlsAcceptor::from(tls);
        let listener = TcpListener::bind(listen_addr).await?;
        tracing::info!(listen = %listener.local_addr()?, "data-plane listener ready");

        loop {
            let (tcp, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let acceptor = acceptor.clone();
            let store = self.store.clone();
            let conn_cancel = cancel.child_token();
            tokio::spawn(async move {
                let stream = match acceptor.accept(tcp).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(peer = %peer_addr, error = %e, "data-plane handshake failed");
                        return;
                    }
                };
                tracing::debug!(peer = %peer_addr, "data-plane connection accepted");
                let mut io = DirectChunkStream::new(stream);
                match receive_loop(store, &mut io, &conn_cancel).await {
                    Ok(bytes) => {
                        tracing::info!(peer = %peer_addr, bytes, "data-plane connection finished");
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer_addr, error = %e, "data-plane connection aborted");
                    }
                }
            });
        }
    }
}
