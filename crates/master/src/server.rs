// Path: crates/master/src/server.rs
//! Controller startup: long-lived tables in dependency order, background
//! sweeper, and the gRPC listener.

use crate::admin::AdminService;
use crate::control::ControlPlaneService;
use crate::orchestrator::Orchestrator;
use crate::registry::{mint_token, Registry, RegistryConfig};
use crate::relay::RelayTable;
use gantry_crypto::{Identity, TrustStore};
use gantry_ipc::v1::admin_server::AdminServer;
use gantry_ipc::v1::control_plane_server::ControlPlaneServer;
use gantry_ipc::v1::pairing_server::PairingServer;
use gantry_pairing::{PairingManager, PairingService};
use gantry_types::config::MasterConfig;
use gantry_types::persist::StateHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

/// Handles to a running controller, for the binary and for tests.
pub struct MasterNode {
    /// The worker registry.
    pub registry: Arc<Registry>,
    /// The migration orchestrator.
    pub orchestrator: Arc<Orchestrator>,
    /// The relay table.
    pub relay: Arc<RelayTable>,
    /// The pairing manager.
    pub pairing: Arc<PairingManager>,
    /// Persisted node state.
    pub state: Arc<StateHandle>,
    /// Actually bound listen address.
    pub local_addr: SocketAddr,
}

/// Binds the controller and spawns its serve task. Startup failures
/// (identity load, state load, listen) surface here and are fatal.
pub async fn start_master(
    config: MasterConfig,
    cancel: CancellationToken,
) -> anyhow::Result<(MasterNode, JoinHandle<()>)> {
    std::fs::create_dir_all(&config.node.data_dir)?;

    // Long-lived state, in dependency order: node state and trust store
    // first, then registry, orchestrator, relay.
    let state = Arc::new(StateHandle::load_or_default(
        config.node.data_dir.join("config.json"),
    )?);
    let identity = Arc::new(Identity::load_or_generate(&config.node.data_dir, "gantry-master")?);
    let trust = Arc::new(TrustStore::new(state.clone()));
    let pairing = Arc::new(PairingManager::new(
        identity.clone(),
        trust.clone(),
        "gantry-master".to_string(),
    ));

    let enrollment_token = match config
        .enrollment_token
        .clone()
        .or_else(|| state.read(|s| s.enrollment_token.clone()))
    {
        Some(token) => token,
        None => {
            let token = mint_token();
            tracing::info!("generated fleet enrollment token");
            token
        }
    };
    state.update(|s| s.enrollment_token = Some(enrollment_token.clone()))?;

    let registry = Arc::new(Registry::new(
        RegistryConfig {
            worker_timeout: config.worker_timeout(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            inventory_interval: Duration::from_secs(config.inventory_interval_secs),
            max_workers: config.max_workers,
        },
        enrollment_token,
    ));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    let advertise_url = config.advertise_url.clone().unwrap_or_else(|| {
        let host = if local_addr.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            local_addr.ip().to_string()
        };
        format!("http://{host}:{}", local_addr.port())
    });

    let orchestrator = Arc::new(Orchestrator::new(registry.clone(), advertise_url.clone()));
    let relay = Arc::new(RelayTable::new(registry.clone()));
    orchestrator.set_relay(relay.clone());

    // Sweeper: purge unresponsive workers and cancel their jobs.
    let mut purged = registry.spawn_sweeper(cancel.clone());
    {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    purged_worker = purged.recv() => match purged_worker {
                        Some(worker_id) => {
                            orchestrator
                                .cancel_for_worker(&worker_id, "worker heartbeat lost")
                                .await;
                        }
                        None => break,
                    },
                }
            }
        });
    }

    let control = ControlPlaneService::new(registry.clone(), orchestrator.clone(), relay.clone());
    let admin = AdminService::new(
        registry.clone(),
        orchestrator.clone(),
        pairing.clone(),
        state.clone(),
    );
    let pairing_svc = PairingService::new(pairing.clone());

    tracing::info!(
        listen = %local_addr,
        advertise = %advertise_url,
        fingerprint = %identity.fingerprint(),
        "controller listening"
    );

    let shutdown = cancel.clone();
    let task = tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .http2_keepalive_interval(Some(Duration::from_secs(30)))
            .http2_keepalive_timeout(Some(Duration::from_secs(10)))
            .add_service(ControlPlaneServer::new(control))
            .add_service(PairingServer::new(pairing_svc))
            .add_service(AdminServer::new(admin))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "controller server terminated");
        }
    });

    Ok((
        MasterNode {
            registry,
            orchestrator,
            relay,
            pairing,
            state,
            local_addr,
        },
        task,
    ))
}

/// Runs the controller until cancellation.
pub async fn run_master(config: MasterConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let (_node, task) = start_master(config, cancel).await?;
    task.await?;
    Ok(())
}
