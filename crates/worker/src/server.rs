// Path: crates/worker/src/server.rs
//! Worker startup: identity, stores and engine, the data listener, the
//! optional pairing endpoint, and the connector loop.

use crate::connector::Connector;
use crate::data_server::DataServer;
use crate::executor::{Executor, RetryPolicy};
use crate::store::{FsResourceStore, ResourceStore};
use gantry_crypto::tls::AllowList;
use gantry_crypto::{Identity, TrustStore};
use gantry_ipc::v1::pairing_server::PairingServer;
use gantry_pairing::{PairingManager, PairingService};
use gantry_transfer::{EngineConfig, TransferEngine};
use gantry_types::config::WorkerConfig;
use gantry_types::persist::StateHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handles to a running worker, for the binary and for tests.
pub struct WorkerNode {
    /// This worker's identity.
    pub identity: Arc<Identity>,
    /// Persisted node state.
    pub state: Arc<StateHandle>,
    /// The transfer engine.
    pub engine: Arc<TransferEngine>,
    /// The resource store backing migrations.
    pub store: Arc<dyn ResourceStore>,
}

/// Starts the worker's background services and returns once the
/// connector loop ends (cancellation or controller shutdown). Startup
/// failures (identity, state, listen, missing enrollment credential)
/// surface here and are fatal.
pub async fn run_worker(config: WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let (_node, connector) = prepare_worker(config, cancel.clone())?;
    connector.run(cancel).await
}

/// Redeems a pairing code against a peer's pairing endpoint: performs
/// the ephemeral key exchange and promotes the peer's certificate into
/// this node's trust store. Used for the peer-to-peer topology, where
/// no controller mediates trust.
pub async fn pair_with(config: &WorkerConfig, peer_url: &str, code: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.node.data_dir)?;
    let state = Arc::new(StateHandle::load_or_default(
        config.node.data_dir.join("config.json"),
    )?);
    let common_name = if config.name.is_empty() {
        crate::host::hostname()
    } else {
        config.name.clone()
    };
    let identity = Arc::new(Identity::load_or_generate(
        &config.node.data_dir,
        &common_name,
    )?);
    let trust = Arc::new(TrustStore::new(state));
    let manager = PairingManager::new(identity, trust, common_name);

    let redeem = manager.begin_redeem(code);
    let envelope = manager.redeem_envelope(&redeem);
    let mut client =
        gantry_ipc::v1::pairing_client::PairingClient::connect(peer_url.to_string()).await?;
    let reply = client.exchange(envelope).await?.into_inner();
    let outcome = manager.complete_redeem(redeem, reply)?;

    tracing::info!(
        peer = %outcome.peer_fingerprint,
        name = %outcome.peer_display_name,
        "paired with peer"
    );
    println!("paired with {} ({})", outcome.peer_display_name, outcome.peer_fingerprint);
    Ok(())
}

/// Builds the worker's services and spawns everything except the
/// connector loop, which is returned for the caller to drive.
pub fn prepare_worker(
    config: WorkerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<(WorkerNode, Connector)> {
    std::fs::create_dir_all(&config.node.data_dir)?;

    let state = Arc::new(StateHandle::load_or_default(
        config.node.data_dir.join("config.json"),
    )?);

    if config.enrollment_token.is_none() && state.read(|s| s.auth_token.is_none()) {
        anyhow::bail!("no enrollment token configured and no stored auth token to re-attach with");
    }

    let common_name = if config.name.is_empty() {
        crate::host::hostname()
    } else {
        config.name.clone()
    };
    let identity = Arc::new(Identity::load_or_generate(
        &config.node.data_dir,
        &common_name,
    )?);
    let trust = Arc::new(TrustStore::new(state.clone()));
    let allow = Arc::new(AllowList::new());

    let engine = Arc::new(TransferEngine::new(
        &config.node.data_dir,
        EngineConfig {
            chunk_size_default: config.node.chunk_size_default,
            verify_checksums: config.node.verify_checksums,
            max_concurrent: config.node.max_concurrent,
            transfer_timeout: std::time::Duration::from_secs(config.node.transfer_timeout_secs),
        },
    ));
    let store: Arc<dyn ResourceStore> = Arc::new(FsResourceStore::new(&config.node.data_dir));
    let executor = Arc::new(Executor::new(
        store.clone(),
        engine.clone(),
        identity.clone(),
        allow.clone(),
        RetryPolicy {
            max_retries: config.node.max_retries,
            backoff: std::time::Duration::from_secs(config.node.retry_backoff_secs),
            max_backoff: std::time::Duration::from_secs(config.node.retry_max_backoff_secs),
        },
    ));

    // Data-plane listener.
    {
        let server = Arc::new(DataServer::new(
            identity.clone(),
            trust.clone(),
            allow,
            store.clone(),
        ));
        let listen = config.data_address.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(&listen, cancel.clone()).await {
                tracing::error!(error = %e, "data-plane listener terminated");
                cancel.cancel();
            }
        });
    }

    // Optional pairing endpoint for peer-to-peer trust bootstrap.
    if let Some(pairing_addr) = config.pairing_addr.clone() {
        let manager = Arc::new(PairingManager::new(
            identity.clone(),
            trust.clone(),
            common_name.clone(),
        ));
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let addr = match pairing_addr.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::error!(addr = %pairing_addr, error = %e, "bad pairing address");
                    return;
                }
            };
            let result = tonic::transport::Server::builder()
                .add_service(PairingServer::new(PairingService::new(manager)))
                .serve_with_shutdown(addr, cancel.cancelled())
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "pairing endpoint terminated");
            }
        });
    }

    let connector = Connector::new(
        config,
        state.clone(),
        identity.fingerprint().to_string(),
        store.clone(),
        executor,
    );

    Ok((
        WorkerNode {
            identity,
            state,
            engine,
            store,
        },
        connector,
    ))
}
