// Path: crates/worker/src/executor.rs
//! Migration execution on the worker.
//!
//! As SOURCE: opens the data channel (direct mutual TLS, or relayed when
//! the command names a proxy address), walks the strategy's phases, and
//! reports progress and completion back through the connector. As
//! TARGET: authorizes the source fingerprint and, in relay mode,
//! consumes the spliced chunk stream.

use crate::channel::{DirectChannel, RelayedChannel};
use crate::receiver::{receive_loop, RelayChunkStream};
use crate::store::ResourceStore;
use gantry_crypto::tls::AllowList;
use gantry_crypto::Identity;
use gantry_ipc::v1 as proto;
use gantry_transfer::{DataChannel, TransferEngine};
use gantry_types::error::TransferError;
use gantry_types::model::{
    MigrationMode, MigrationPhase, MigrationStrategy, ResourceKind, ResourceRefs,
};
use gantry_types::time::now_unix_ms;
use gantry_types::ErrorCode;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Reports flowing from the executor to the connector, which is the
/// sole writer of control-stream frames.
#[derive(Debug)]
pub enum ExecutorEvent {
    /// A progress update for the job.
    Progress(proto::MigrationProgress),
    /// The terminal report for the job.
    Complete(proto::MigrationComplete),
}

/// The worker identity issued at registration.
#[derive(Debug, Clone)]
pub struct WorkerCredentials {
    /// Assigned worker id.
    pub worker_id: String,
    /// Per-worker auth token.
    pub auth_token: String,
}

/// How transient transfer failures are retried: the paused transfer is
/// re-driven from its checkpoint over a freshly dialed channel.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a paused transfer is reported as failed.
    pub max_retries: u32,
    /// Initial backoff between attempts.
    pub backoff: std::time::Duration,
    /// Backoff ceiling.
    pub max_backoff: std::time::Duration,
}

/// Executes start and cancel commands dispatched off the control stream.
pub struct Executor {
    store: Arc<dyn ResourceStore>,
    engine: Arc<TransferEngine>,
    identity: Arc<Identity>,
    allow: Arc<AllowList>,
    retry: RetryPolicy,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Executor {
    /// An executor over this worker's stores and identity.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        engine: Arc<TransferEngine>,
        identity: Arc<Identity>,
        allow: Arc<AllowList>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            engine,
            identity,
            allow,
            retry,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Number of migrations currently executing.
    pub async fn active_count(&self) -> u32 {
        self.active.lock().await.len() as u32
    }

    /// Observes a cancel command: fires the migration's token.
    pub async fn cancel_migration(&self, migration_id: &str, reason: &str) {
        if let Some(token) = self.active.lock().await.get(migration_id) {
            tracing::info!(migration = %migration_id, reason, "cancelling migration");
            token.cancel();
        }
    }

    /// Dispatches a start command onto its own task.
    pub fn spawn_start(
        self: &Arc<Self>,
        credentials: WorkerCredentials,
        command: proto::StartMigration,
        events: mpsc::Sender<ExecutorEvent>,
        parent: &CancellationToken,
    ) {
        let executor = Arc::clone(self);
        let token = parent.child_token();
        tokio::spawn(async move {
            let migration_id = command.migration_id.clone();
            {
                let mut active = executor.active.lock().await;
                if active.contains_key(&migration_id) {
                    tracing::warn!(migration = %migration_id, "duplicate start command ignored");
                    return;
                }
                active.insert(migration_id.clone(), token.clone());
            }
            executor
                .run_migration(credentials, command, events, token)
                .await;
            executor.active.lock().await.remove(&migration_id);
        });
    }

    async fn run_migration(
        &self,
        credentials: WorkerCredentials,
        command: proto::StartMigration,
        events: mpsc::Sender<ExecutorEvent>,
        cancel: CancellationToken,
    ) {
        match proto::MigrationRole::try_from(command.role) {
            Ok(proto::MigrationRole::Source) => {
                self.run_source(credentials, command, events, cancel).await;
            }
            Ok(proto::MigrationRole::Target) => {
                self.run_target(credentials, command, events, cancel).await;
            }
            _ => {
                tracing::warn!(
                    migration = %command.migration_id,
                    "start command without a role ignored"
                );
            }
        }
    }

    /// Opens the data channel, retrying briefly: the target's start
    /// command races ours, and the dial fails until the target has
    /// authorized our fingerprint.
    async fn open_source_channel(
        &self,
        credentials: &WorkerCredentials,
        command: &proto::StartMigration,
    ) -> Result<Box<dyn DataChannel + Send>, TransferError> {
        const DIAL_ATTEMPTS: u32 = 5;
        let mut last_err = None;
        for attempt in 0..DIAL_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(500 * attempt as u64)).await;
            }
            match self.dial(credentials, command).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    tracing::debug!(
                        migration = %command.migration_id,
                        attempt,
                        error = %e,
                        "data channel dial failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| TransferError::Transport("data channel dial failed".into())))
    }

    async fn dial(
        &self,
        credentials: &WorkerCredentials,
        command: &proto::StartMigration,
    ) -> Result<Box<dyn DataChannel + Send>, TransferError> {
        if !command.proxy_address.is_empty() {
            let channel = RelayedChannel::connect(
                &command.proxy_address,
                &command.migration_id,
                &credentials.worker_id,
                &credentials.auth_token,
                proto::MigrationRole::Source,
            )
            .await?;
            Ok(Box::new(channel))
        } else {
            let channel = DirectChannel::connect(
                &command.peer_address,
                &self.identity,
                &command.peer_fingerprint,
            )
            .await?;
            Ok(Box::new(channel))
        }
    }

    async fn run_source(
        &self,
        credentials: WorkerCredentials,
        command: proto::StartMigration,
        events: mpsc::Sender<ExecutorEvent>,
        cancel: CancellationToken,
    ) {
        let migration_id = command.migration_id.clone();
        tracing::info!(migration = %migration_id, "starting migration as source");

        let result = self
            .drive_source(&credentials, &command, &events, &cancel)
            .await;
        let complete = match result {
            Ok(bytes_transferred) => proto::MigrationComplete {
                migration_id: migration_id.clone(),
                success: true,
                error: String::new(),
                bytes_transferred,
            },
            Err(e) => {
                tracing::warn!(migration = %migration_id, code = e.code(), error = %e, "migration failed at source");
                proto::MigrationComplete {
                    migration_id: migration_id.clone(),
                    success: false,
                    error: format!("{}: {e}", e.code()),
                    bytes_transferred: 0,
                }
            }
        };
        if events
            .send(ExecutorEvent::Complete(complete))
            .await
            .is_err()
        {
            tracing::warn!(migration = %migration_id, "completion report lost: control session gone");
        }
    }

    async fn drive_source(
        &self,
        credentials: &WorkerCredentials,
        command: &proto::StartMigration,
        events: &mpsc::Sender<ExecutorEvent>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let resources: ResourceRefs = command.resources.clone().unwrap_or_default().into();
        let strategy = MigrationStrategy::from_str(&command.strategy).unwrap_or_default();
        let mode = MigrationMode::from_str(&command.mode).unwrap_or_default();
        let destination = command.peer_fingerprint.as_str();

        // Total up front so progress fractions are meaningful.
        let mut total_bytes = 0u64;
        for (kind, id) in walk(&resources, strategy) {
            total_bytes += self.store.size_of(kind, &id).await?;
        }

        let mut channel = self.open_source_channel(credentials, command).await?;
        let progress = |phase: MigrationPhase, done: u64| proto::MigrationProgress {
            migration_id: command.migration_id.clone(),
            phase: phase.to_string(),
            progress: if total_bytes == 0 {
                1.0
            } else {
                done as f64 / total_bytes as f64
            },
            bytes_transferred: done,
            total_bytes,
        };
        let _ = events
            .send(ExecutorEvent::Progress(progress(
                MigrationPhase::Initializing,
                0,
            )))
            .await;

        let mut done = 0u64;
        let outcome: Result<(), TransferError> = async {
            for phase in strategy.phases() {
                let _ = events
                    .send(ExecutorEvent::Progress(progress(*phase, done)))
                    .await;
                for (kind, id) in phase_resources(&resources, *phase) {
                    // Transient failures pause the transfer with its
                    // checkpoint intact; retry over a fresh channel and
                    // let the engine resume from the last acked offset.
                    let mut attempt = 0u32;
                    let total = loop {
                        let opened = self.store.open_reader(kind, &id).await?;
                        let total = opened.total_bytes;
                        let result = self
                            .engine
                            .send_resource(
                                channel.as_mut(),
                                kind,
                                &id,
                                destination,
                                opened.reader,
                                total,
                                cancel,
                                |_, _| {},
                            )
                            .await;
                        match result {
                            Ok(_) => break total,
                            Err(e) if e.is_permanent() || matches!(e, TransferError::Cancelled) => {
                                return Err(e)
                            }
                            Err(e) if attempt >= self.retry.max_retries => return Err(e),
                            Err(e) => {
                                attempt += 1;
                                let backoff = (self.retry.backoff * 2u32.pow(attempt - 1))
                                    .min(self.retry.max_backoff);
                                tracing::warn!(
                                    migration = %command.migration_id,
                                    kind = %kind,
                                    resource = %id,
                                    attempt,
                                    error = %e,
                                    "transfer paused; retrying"
                                );
                                tokio::select! {
                                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                                    _ = tokio::time::sleep(backoff) => {}
                                }
                                channel = self.open_source_channel(credentials, command).await?;
                            }
                        }
                    };
                    done += total;
                    let _ = events
                        .send(ExecutorEvent::Progress(progress(*phase, done)))
                        .await;
                    tracing::info!(
                        migration = %command.migration_id,
                        kind = %kind,
                        resource = %id,
                        "resource sent"
                    );
                }
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                if mode == MigrationMode::Move {
                    for (kind, id) in walk(&resources, strategy) {
                        self.store.remove(kind, &id).await?;
                    }
                }
                let _ = events
                    .send(ExecutorEvent::Progress(progress(
                        MigrationPhase::Finalizing,
                        done,
                    )))
                    .await;
                let _ = channel.close("migration complete").await;
                Ok(done)
            }
            Err(e) => {
                let _ = channel.close(&format!("{}: {e}", e.code())).await;
                Err(e)
            }
        }
    }

    async fn run_target(
        &self,
        credentials: WorkerCredentials,
        command: proto::StartMigration,
        events: mpsc::Sender<ExecutorEvent>,
        cancel: CancellationToken,
    ) {
        let migration_id = command.migration_id.clone();
        tracing::info!(migration = %migration_id, "starting migration as target");

        // Authorize the incoming source for the data plane; the trust
        // invariant stays fingerprint-based even inside a fleet.
        self.allow.allow(command.peer_fingerprint.clone());

        if command.proxy_address.is_empty() {
            // Direct mode: the data listener serves the source when it
            // dials in; nothing further to drive here.
            return;
        }

        let result = async {
            let mut channel = RelayedChannel::connect(
                &command.proxy_address,
                &migration_id,
                &credentials.worker_id,
                &credentials.auth_token,
                proto::MigrationRole::Target,
            )
            .await?;
            let mut io = RelayChunkStream::new(&mut channel);
            receive_loop(self.store.clone(), &mut io, &cancel).await
        }
        .await;

        self.allow.revoke(&command.peer_fingerprint);

        if let Err(e) = result {
            tracing::warn!(
                migration = %migration_id,
                code = e.code(),
                error = %e,
                "migration failed at target"
            );
            let _ = events
                .send(ExecutorEvent::Complete(proto::MigrationComplete {
                    migration_id,
                    success: false,
                    error: format!("{}: {e}", e.code()),
                    bytes_transferred: 0,
                }))
                .await;
        }
    }
}

/// The resources one phase carries, in order. Network definitions move
/// with the container phase.
fn phase_resources(refs: &ResourceRefs, phase: MigrationPhase) -> Vec<(ResourceKind, String)> {
    match phase {
        MigrationPhase::Volumes => refs
            .volumes
            .iter()
            .map(|id| (ResourceKind::Volume, id.clone()))
            .collect(),
        MigrationPhase::Images => refs
            .images
            .iter()
            .map(|id| (ResourceKind::Image, id.clone()))
            .collect(),
        MigrationPhase::Containers => refs
            .containers
            .iter()
            .map(|id| (ResourceKind::Container, id.clone()))
            .chain(
                refs.networks
                    .iter()
                    .map(|id| (ResourceKind::Network, id.clone())),
            )
            .collect(),
        MigrationPhase::Initializing | MigrationPhase::Finalizing => Vec::new(),
    }
}

/// Every resource the migration touches, in strategy order.
fn walk(refs: &ResourceRefs, strategy: MigrationStrategy) -> Vec<(ResourceKind, String)> {
    strategy
        .phases()
        .iter()
        .flat_map(|phase| phase_resources(refs, *phase))
        .collect()
}

/// Builds an authenticated heartbeat frame.
pub fn heartbeat_frame(
    credentials: &WorkerCredentials,
    status: &str,
    active: u32,
    stats: gantry_types::model::SystemStats,
) -> proto::WorkerFrame {
    proto::WorkerFrame {
        worker_id: credentials.worker_id.clone(),
        auth_token: credentials.auth_token.clone(),
        payload: Some(proto::worker_frame::Payload::Heartbeat(proto::Heartbeat {
            timestamp_ms: now_unix_ms(),
            status: status.to_string(),
            active_migration_count: active,
            system_stats: Some(stats.into()),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_cover_all_resource_kinds() {
        let refs = ResourceRefs {
            containers: vec!["web".into()],
            images: vec!["nginx".into()],
            volumes: vec!["data".into()],
            networks: vec!["front".into()],
        };
        let all = walk(&refs, MigrationStrategy::Cold);
        assert_eq!(
            all,
            vec![
                (ResourceKind::Volume, "data".to_string()),
                (ResourceKind::Image, "nginx".to_string()),
                (ResourceKind::Container, "web".to_string()),
                (ResourceKind::Network, "front".to_string()),
            ]
        );

        // Warm pre-copies images before volumes.
        let warm = walk(&refs, MigrationStrategy::Warm);
        assert_eq!(warm[0], (ResourceKind::Image, "nginx".to_string()));
    }
}
