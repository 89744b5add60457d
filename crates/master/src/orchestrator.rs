// Path: crates/master/src/orchestrator.rs
//! The migration orchestrator: owns the job table and drives each job's
//! state machine from the progress and completion frames relayed off the
//! control streams.

use crate::registry::Registry;
use crate::relay::RelayTable;
use gantry_ipc::v1 as proto;
use gantry_types::error::OrchestratorError;
use gantry_types::model::{
    MigrationJob, MigrationMode, MigrationPhase, MigrationStatus, MigrationStrategy, ResourceRefs,
};
use gantry_types::time::now_unix_ms;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A validated migration request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Worker the resources move from.
    pub source_worker_id: String,
    /// Worker the resources move to.
    pub target_worker_id: String,
    /// Resources to move; must not be empty.
    pub resources: ResourceRefs,
    /// Copy or move semantics.
    pub mode: MigrationMode,
    /// Phase-ordering strategy.
    pub strategy: MigrationStrategy,
    /// Route the data plane through the controller relay.
    pub via_relay: bool,
}

/// Owns every migration job on this controller.
pub struct Orchestrator {
    registry: Arc<Registry>,
    jobs: RwLock<HashMap<Uuid, Arc<RwLock<MigrationJob>>>>,
    /// Address workers dial for relayed channels (the controller's own
    /// gRPC endpoint).
    relay_address: String,
    /// Set after startup; the relay is instantiated after the
    /// orchestrator per the startup dependency order.
    relay: OnceLock<Arc<RelayTable>>,
}

impl Orchestrator {
    /// An empty orchestrator over the given registry.
    pub fn new(registry: Arc<Registry>, relay_address: String) -> Self {
        Self {
            registry,
            jobs: RwLock::new(HashMap::new()),
            relay_address,
            relay: OnceLock::new(),
        }
    }

    /// Wires in the relay table once it exists.
    pub fn set_relay(&self, relay: Arc<RelayTable>) {
        let _ = self.relay.set(relay);
    }

    /// Validates preconditions, records the job, and issues the paired
    /// start commands: target first (so it can authenticate the source),
    /// then source. A command-delivery failure flips the job to failed.
    pub async fn start(&self, request: StartRequest) -> Result<MigrationJob, OrchestratorError> {
        let (source, source_online) = self
            .registry
            .get(&request.source_worker_id)
            .await
            .ok_or_else(|| OrchestratorError::WorkerNotFound(request.source_worker_id.clone()))?;
        let (target, target_online) = self
            .registry
            .get(&request.target_worker_id)
            .await
            .ok_or_else(|| OrchestratorError::WorkerNotFound(request.target_worker_id.clone()))?;
        if !source_online {
            return Err(OrchestratorError::WorkerOffline(source.id));
        }
        if !target_online {
            return Err(OrchestratorError::WorkerOffline(target.id));
        }
        if request.resources.is_empty() {
            return Err(OrchestratorError::EmptyResourceSet);
        }

        let job = MigrationJob::new(
            source.id.clone(),
            target.id.clone(),
            request.resources.clone(),
            request.mode,
            request.strategy,
            now_unix_ms(),
        );
        let job_id = job.id;
        let handle = Arc::new(RwLock::new(job.clone()));
        self.jobs.write().await.insert(job_id, handle.clone());

        tracing::info!(
            migration = %job_id,
            source = %source.id,
            target = %target.id,
            strategy = %request.strategy,
            via_relay = request.via_relay,
            "migration accepted"
        );

        let proxy_address = if request.via_relay {
            self.relay_address.clone()
        } else {
            String::new()
        };

        // Target first: it needs the source fingerprint before the
        // source dials in.
        let target_cmd = proto::StartMigration {
            migration_id: job_id.to_string(),
            role: proto::MigrationRole::Target as i32,
            resources: Some(request.resources.clone().into()),
            mode: request.mode.to_string(),
            strategy: request.strategy.to_string(),
            peer_fingerprint: source.fingerprint.clone(),
            peer_address: String::new(),
            proxy_address: proxy_address.clone(),
        };
        let source_cmd = proto::StartMigration {
            migration_id: job_id.to_string(),
            role: proto::MigrationRole::Source as i32,
            resources: Some(request.resources.into()),
            mode: request.mode.to_string(),
            strategy: request.strategy.to_string(),
            peer_fingerprint: target.fingerprint.clone(),
            peer_address: target.data_address.clone(),
            proxy_address,
        };

        let launch = async {
            self.registry
                .send_command(&target.id, start_frame(target_cmd))
                .await?;
            self.registry
                .send_command(&source.id, start_frame(source_cmd))
                .await?;
            Ok::<(), gantry_types::error::RegistryError>(())
        };

        let mut guard = handle.write().await;
        match launch.await {
            Ok(()) => {
                guard.status = MigrationStatus::Running;
            }
            Err(e) => {
                tracing::warn!(migration = %job_id, error = %e, "start command delivery failed");
                guard.status = MigrationStatus::Failed;
                guard.completed_at = Some(now_unix_ms());
                guard.error = Some(format!("start command delivery failed: {e}"));
            }
        }
        Ok(guard.clone())
    }

    /// A point-in-time copy of one job.
    pub async fn get(&self, id: Uuid) -> Option<MigrationJob> {
        let handle = self.jobs.read().await.get(&id).cloned()?;
        let job = handle.read().await.clone();
        Some(job)
    }

    /// Point-in-time copies of all jobs.
    pub async fn list(&self) -> Vec<MigrationJob> {
        let handles: Vec<_> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            jobs.push(handle.read().await.clone());
        }
        jobs
    }

    /// Applies a progress frame. The source-role worker is authoritative;
    /// progress from the target is logged and dropped. Within a phase the
    /// fraction never decreases.
    pub async fn update_progress(
        &self,
        worker_id: &str,
        progress: &proto::MigrationProgress,
    ) -> Result<(), OrchestratorError> {
        let id = parse_job_id(&progress.migration_id)?;
        let handle = self
            .jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::JobNotFound(progress.migration_id.clone()))?;
        let mut job = handle.write().await;
        if job.status.is_terminal() {
            return Ok(());
        }
        if job.source_worker_id != worker_id {
            tracing::debug!(
                migration = %id,
                worker = %worker_id,
                "ignoring progress from non-authoritative endpoint"
            );
            return Ok(());
        }

        job.status = MigrationStatus::Running;
        match MigrationPhase::from_str(&progress.phase) {
            Ok(phase) if phase != job.phase => {
                job.phase = phase;
                job.progress = progress.progress.clamp(0.0, 1.0);
            }
            Ok(_) => {
                job.progress = job.progress.max(progress.progress.clamp(0.0, 1.0));
            }
            Err(_) => {
                tracing::warn!(migration = %id, phase = %progress.phase, "unknown phase in progress frame");
            }
        }
        job.bytes_transferred = job.bytes_transferred.max(progress.bytes_transferred);
        if progress.total_bytes > 0 {
            job.total_bytes = progress.total_bytes;
        }
        Ok(())
    }

    /// Applies a completion frame. Success is accepted from the source
    /// only; failure from either endpoint fails the job. Terminal states
    /// are sticky and `completed_at` is set exactly once.
    pub async fn complete(
        &self,
        worker_id: &str,
        complete: &proto::MigrationComplete,
    ) -> Result<(), OrchestratorError> {
        let id = parse_job_id(&complete.migration_id)?;
        let handle = self
            .jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::JobNotFound(complete.migration_id.clone()))?;
        let mut job = handle.write().await;
        if job.status.is_terminal() {
            return Ok(());
        }

        if complete.success {
            if job.source_worker_id != worker_id {
                tracing::debug!(
                    migration = %id,
                    worker = %worker_id,
                    "ignoring success report from non-authoritative endpoint"
                );
                return Ok(());
            }
            job.status = MigrationStatus::Completed;
            job.progress = 1.0;
            job.phase = MigrationPhase::Finalizing;
            job.bytes_transferred = job.bytes_transferred.max(complete.bytes_transferred);
            tracing::info!(migration = %id, bytes = job.bytes_transferred, "migration completed");
        } else {
            job.status = MigrationStatus::Failed;
            job.error = Some(if complete.error.is_empty() {
                "migration failed".to_string()
            } else {
                complete.error.clone()
            });
            tracing::warn!(migration = %id, error = %complete.error, "migration failed");
        }
        if job.completed_at.is_none() {
            job.completed_at = Some(now_unix_ms());
        }
        Ok(())
    }

    /// Cancels a pending or running job and fans CancelMigration out to
    /// both workers. Command delivery is best-effort; the local status
    /// transition happens regardless.
    pub async fn cancel(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<MigrationJob, OrchestratorError> {
        let handle = self
            .jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;

        let (source_id, target_id, snapshot) = {
            let mut job = handle.write().await;
            if job.status.is_terminal() {
                return Err(OrchestratorError::NotCancellable {
                    status: job.status.to_string(),
                });
            }
            job.status = MigrationStatus::Cancelled;
            job.error = Some(reason.to_string());
            if job.completed_at.is_none() {
                job.completed_at = Some(now_unix_ms());
            }
            (
                job.source_worker_id.clone(),
                job.target_worker_id.clone(),
                job.clone(),
            )
        };

        tracing::info!(migration = %id, reason, "migration cancelled");

        let frame = |reason: &str| proto::ControllerFrame {
            payload: Some(proto::controller_frame::Payload::CancelMigration(
                proto::CancelMigration {
                    migration_id: id.to_string(),
                    reason: reason.to_string(),
                },
            )),
        };
        for worker in [&source_id, &target_id] {
            if let Err(e) = self.registry.send_command(worker, frame(reason)).await {
                tracing::debug!(migration = %id, worker = %worker, error = %e, "cancel fan-out skipped");
            }
        }
        if let Some(relay) = self.relay.get() {
            relay.cancel_channel(&id.to_string()).await;
        }
        Ok(snapshot)
    }

    /// Cancels every non-terminal job touching a worker; used when the
    /// sweeper purges an unresponsive worker.
    pub async fn cancel_for_worker(&self, worker_id: &str, reason: &str) {
        let ids: Vec<Uuid> = self
            .list()
            .await
            .into_iter()
            .filter(|j| {
                !j.status.is_terminal()
                    && (j.source_worker_id == worker_id || j.target_worker_id == worker_id)
            })
            .map(|j| j.id)
            .collect();
        for id in ids {
            if let Err(e) = self.cancel(id, reason).await {
                tracing::debug!(migration = %id, error = %e, "liveness cancel skipped");
            }
        }
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, OrchestratorError> {
    Uuid::parse_str(raw).map_err(|_| OrchestratorError::JobNotFound(raw.to_string()))
}

fn start_frame(cmd: proto::StartMigration) -> proto::ControllerFrame {
    proto::ControllerFrame {
        payload: Some(proto::controller_frame::Payload::StartMigration(cmd)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn fleet() -> (Arc<Registry>, Orchestrator, Vec<String>, Vec<mpsc::Receiver<proto::ControllerFrame>>) {
        let registry = Arc::new(Registry::new(
            RegistryConfig {
                worker_timeout: Duration::from_secs(30),
                heartbeat_interval: Duration::from_secs(10),
                inventory_interval: Duration::from_secs(60),
                max_workers: 8,
            },
            "fleet-secret".into(),
        ));
        let mut ids = Vec::new();
        let mut streams = Vec::new();
        for name in ["src", "dst"] {
            let grant = registry
                .register(&proto::RegisterWorkerRequest {
                    enrollment_token: "fleet-secret".into(),
                    worker_name: name.into(),
                    hostname: format!("{name}.local"),
                    data_address: format!("{name}:7711"),
                    fingerprint: format!("{name}-fp"),
                    labels: HashMap::new(),
                    version: "0.3.0".into(),
                })
                .await
                .unwrap();
            let (tx, rx) = mpsc::channel(8);
            registry.attach_stream(&grant.worker_id, tx).await.unwrap();
            ids.push(grant.worker_id);
            streams.push(rx);
        }
        let orchestrator = Orchestrator::new(registry.clone(), "http://master:7710".into());
        (registry, orchestrator, ids, streams)
    }

    fn volume_request(ids: &[String]) -> StartRequest {
        StartRequest {
            source_worker_id: ids[0].clone(),
            target_worker_id: ids[1].clone(),
            resources: ResourceRefs {
                volumes: vec!["data".into()],
                ..Default::default()
            },
            mode: MigrationMode::Copy,
            strategy: MigrationStrategy::Cold,
            via_relay: false,
        }
    }

    #[tokio::test]
    async fn start_issues_target_then_source_commands() {
        let (_registry, orchestrator, ids, mut streams) = fleet().await;
        let job = orchestrator.start(volume_request(&ids)).await.unwrap();
        assert_eq!(job.status, MigrationStatus::Running);

        // Target got its command first, carrying the source fingerprint.
        let target_frame = streams[1].recv().await.unwrap();
        match target_frame.payload {
            Some(proto::controller_frame::Payload::StartMigration(cmd)) => {
                assert_eq!(cmd.role, proto::MigrationRole::Target as i32);
                assert_eq!(cmd.peer_fingerprint, "src-fp");
                assert!(cmd.peer_address.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        let source_frame = streams[0].recv().await.unwrap();
        match source_frame.payload {
            Some(proto::controller_frame::Payload::StartMigration(cmd)) => {
                assert_eq!(cmd.role, proto::MigrationRole::Source as i32);
                assert_eq!(cmd.peer_fingerprint, "dst-fp");
                assert_eq!(cmd.peer_address, "dst:7711");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn preconditions_record_no_job() {
        let (_registry, orchestrator, ids, _streams) = fleet().await;

        let mut empty = volume_request(&ids);
        empty.resources = ResourceRefs::default();
        assert!(matches!(
            orchestrator.start(empty).await,
            Err(OrchestratorError::EmptyResourceSet)
        ));

        let mut unknown = volume_request(&ids);
        unknown.source_worker_id = "ghost".into();
        assert!(matches!(
            orchestrator.start(unknown).await,
            Err(OrchestratorError::WorkerNotFound(_))
        ));

        assert!(orchestrator.list().await.is_empty());
    }

    #[tokio::test]
    async fn undeliverable_command_fails_the_job() {
        let (registry, orchestrator, ids, _streams) = fleet().await;
        // Tear down the target's stream; the target command cannot be sent.
        let entry = registry.get(&ids[1]).await.unwrap().0;
        let (replacement, rx) = mpsc::channel(1);
        drop(rx);
        registry.attach_stream(&entry.id, replacement).await.unwrap();

        let job = orchestrator.start(volume_request(&ids)).await.unwrap();
        assert_eq!(job.status, MigrationStatus::Failed);
        assert!(job.error.unwrap().contains("delivery failed"));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn progress_is_monotonic_within_a_phase_and_source_authoritative() {
        let (_registry, orchestrator, ids, _streams) = fleet().await;
        let job = orchestrator.start(volume_request(&ids)).await.unwrap();
        let progress = |phase: &str, fraction: f64| proto::MigrationProgress {
            migration_id: job.id.to_string(),
            phase: phase.into(),
            progress: fraction,
            bytes_transferred: 0,
            total_bytes: 0,
        };

        orchestrator
            .update_progress(&ids[0], &progress("volumes", 0.5))
            .await
            .unwrap();
        // A stale lower fraction in the same phase does not move backwards.
        orchestrator
            .update_progress(&ids[0], &progress("volumes", 0.2))
            .await
            .unwrap();
        assert_eq!(orchestrator.get(job.id).await.unwrap().progress, 0.5);

        // Target-side progress is not authoritative.
        orchestrator
            .update_progress(&ids[1], &progress("volumes", 0.9))
            .await
            .unwrap();
        assert_eq!(orchestrator.get(job.id).await.unwrap().progress, 0.5);

        // A new phase resets the fraction.
        orchestrator
            .update_progress(&ids[0], &progress("images", 0.1))
            .await
            .unwrap();
        let snapshot = orchestrator.get(job.id).await.unwrap();
        assert_eq!(snapshot.phase, MigrationPhase::Images);
        assert_eq!(snapshot.progress, 0.1);
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let (_registry, orchestrator, ids, _streams) = fleet().await;
        let job = orchestrator.start(volume_request(&ids)).await.unwrap();

        orchestrator
            .complete(
                &ids[0],
                &proto::MigrationComplete {
                    migration_id: job.id.to_string(),
                    success: true,
                    error: String::new(),
                    bytes_transferred: 42,
                },
            )
            .await
            .unwrap();
        let done = orchestrator.get(job.id).await.unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        let completed_at = done.completed_at.unwrap();

        // A late failure report cannot reopen the job.
        orchestrator
            .complete(
                &ids[1],
                &proto::MigrationComplete {
                    migration_id: job.id.to_string(),
                    success: false,
                    error: "late".into(),
                    bytes_transferred: 0,
                },
            )
            .await
            .unwrap();
        let still = orchestrator.get(job.id).await.unwrap();
        assert_eq!(still.status, MigrationStatus::Completed);
        assert_eq!(still.completed_at.unwrap(), completed_at);

        assert!(matches!(
            orchestrator.cancel(job.id, "operator").await,
            Err(OrchestratorError::NotCancellable { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_fans_out_to_both_workers() {
        let (_registry, orchestrator, ids, mut streams) = fleet().await;
        let job = orchestrator.start(volume_request(&ids)).await.unwrap();
        // Drain the start commands.
        let _ = streams[0].recv().await;
        let _ = streams[1].recv().await;

        let cancelled = orchestrator.cancel(job.id, "operator request").await.unwrap();
        assert_eq!(cancelled.status, MigrationStatus::Cancelled);
        assert_eq!(cancelled.error.as_deref(), Some("operator request"));

        for stream in streams.iter_mut() {
            match stream.recv().await.unwrap().payload {
                Some(proto::controller_frame::Payload::CancelMigration(c)) => {
                    assert_eq!(c.migration_id, job.id.to_string());
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn worker_purge_cancels_its_jobs() {
        let (_registry, orchestrator, ids, _streams) = fleet().await;
        let job = orchestrator.start(volume_request(&ids)).await.unwrap();

        orchestrator
            .cancel_for_worker(&ids[0], "worker purged after liveness loss")
            .await;
        let snapshot = orchestrator.get(job.id).await.unwrap();
        assert_eq!(snapshot.status, MigrationStatus::Cancelled);
    }
}
