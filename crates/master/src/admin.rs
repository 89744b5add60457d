// Path: crates/master/src/admin.rs
//! The operator surface: worker listing, enrollment-token management,
//! migration start/get/list/cancel, pairing code generation. The
//! HTTP/JSON gateway and UI sit on top of this contract.

use crate::orchestrator::{Orchestrator, StartRequest};
use crate::registry::Registry;
use gantry_ipc::v1 as proto;
use gantry_ipc::v1::admin_server::Admin;
use gantry_pairing::PairingManager;
use gantry_types::error::OrchestratorError;
use gantry_types::model::{MigrationMode, MigrationStrategy};
use gantry_types::persist::StateHandle;
use gantry_types::ErrorCode;
use std::str::FromStr;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uuid::Uuid;

/// Implementation of the `Admin` gRPC service.
pub struct AdminService {
    registry: Arc<Registry>,
    orchestrator: Arc<Orchestrator>,
    pairing: Arc<PairingManager>,
    state: Arc<StateHandle>,
}

impl AdminService {
    /// Wires the service over the controller's long-lived tables.
    pub fn new(
        registry: Arc<Registry>,
        orchestrator: Arc<Orchestrator>,
        pairing: Arc<PairingManager>,
        state: Arc<StateHandle>,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            pairing,
            state,
        }
    }
}

fn orchestrator_status(e: OrchestratorError) -> Status {
    let message = format!("{}: {e}", e.code());
    match e {
        OrchestratorError::WorkerNotFound(_) | OrchestratorError::JobNotFound(_) => {
            Status::not_found(message)
        }
        OrchestratorError::WorkerOffline(_) | OrchestratorError::NotCancellable { .. } => {
            Status::failed_precondition(message)
        }
        OrchestratorError::EmptyResourceSet | OrchestratorError::UnknownStrategy(_) => {
            Status::invalid_argument(message)
        }
        OrchestratorError::Command(_) => Status::unavailable(message),
    }
}

#[tonic::async_trait]
impl Admin for AdminService {
    async fn list_workers(
        &self,
        request: Request<proto::ListWorkersRequest>,
    ) -> Result<Response<proto::ListWorkersResponse>, Status> {
        let online_only = request.into_inner().online_only;
        let workers = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|(_, online)| *online || !online_only)
            .map(|(worker, online)| proto::WorkerInfo {
                id: worker.id,
                name: worker.name,
                hostname: worker.hostname,
                data_address: worker.data_address,
                fingerprint: worker.fingerprint,
                labels: worker.labels,
                version: worker.version,
                status: worker.status.to_string(),
                online,
                last_heartbeat_ms_ago: worker.last_heartbeat.elapsed().as_millis() as u64,
                system_stats: worker.system_stats.map(Into::into),
                inventory: worker.inventory,
            })
            .collect();
        Ok(Response::new(proto::ListWorkersResponse { workers }))
    }

    async fn get_enrollment_token(
        &self,
        _request: Request<proto::GetEnrollmentTokenRequest>,
    ) -> Result<Response<proto::GetEnrollmentTokenResponse>, Status> {
        Ok(Response::new(proto::GetEnrollmentTokenResponse {
            enrollment_token: self.registry.enrollment_token().await,
        }))
    }

    async fn rotate_enrollment_token(
        &self,
        _request: Request<proto::RotateEnrollmentTokenRequest>,
    ) -> Result<Response<proto::GetEnrollmentTokenResponse>, Status> {
        let fresh = self.registry.rotate_enrollment_token().await;
        self.state
            .update(|s| s.enrollment_token = Some(fresh.clone()))
            .map_err(|e| Status::internal(format!("{}: {e}", e.code())))?;
        Ok(Response::new(proto::GetEnrollmentTokenResponse {
            enrollment_token: fresh,
        }))
    }

    async fn start_migration_job(
        &self,
        request: Request<proto::StartMigrationJobRequest>,
    ) -> Result<Response<proto::MigrationJobInfo>, Status> {
        let req = request.into_inner();
        let mode = MigrationMode::from_str(&req.mode.to_ascii_lowercase())
            .map_err(|e| Status::invalid_argument(e))?;
        let strategy = MigrationStrategy::from_str(&req.strategy.to_ascii_lowercase())
            .map_err(|_| {
                orchestrator_status(OrchestratorError::UnknownStrategy(req.strategy.clone()))
            })?;
        let job = self
            .orchestrator
            .start(StartRequest {
                source_worker_id: req.source_worker_id,
                target_worker_id: req.target_worker_id,
                resources: req.resources.unwrap_or_default().into(),
                mode,
                strategy,
                via_relay: req.via_relay,
            })
            .await
            .map_err(orchestrator_status)?;
        Ok(Response::new((&job).into()))
    }

    async fn get_migration_job(
        &self,
        request: Request<proto::GetMigrationJobRequest>,
    ) -> Result<Response<proto::MigrationJobInfo>, Status> {
        let raw = request.into_inner().id;
        let id = Uuid::parse_str(&raw)
            .map_err(|_| Status::invalid_argument(format!("not a migration id: {raw}")))?;
        let job = self
            .orchestrator
            .get(id)
            .await
            .ok_or_else(|| orchestrator_status(OrchestratorError::JobNotFound(raw)))?;
        Ok(Response::new((&job).into()))
    }

    async fn list_migration_jobs(
        &self,
        _request: Request<proto::ListMigrationJobsRequest>,
    ) -> Result<Response<proto::ListMigrationJobsResponse>, Status> {
        let jobs = self
            .orchestrator
            .list()
            .await
            .iter()
            .map(Into::into)
            .collect();
        Ok(Response::new(proto::ListMigrationJobsResponse { jobs }))
    }

    async fn cancel_migration_job(
        &self,
        request: Request<proto::CancelMigrationJobRequest>,
    ) -> Result<Response<proto::MigrationJobInfo>, Status> {
        let req = request.into_inner();
        let id = Uuid::parse_str(&req.id)
            .map_err(|_| Status::invalid_argument(format!("not a migration id: {}", req.id)))?;
        let reason = if req.reason.is_empty() {
            "cancelled by operator".to_string()
        } else {
            req.reason
        };
        let job = self
            .orchestrator
            .cancel(id, &reason)
            .await
            .map_err(orchestrator_status)?;
        Ok(Response::new((&job).into()))
    }

    async fn generate_pairing_code(
        &self,
        _request: Request<proto::GeneratePairingCodeRequest>,
    ) -> Result<Response<proto::GeneratePairingCodeResponse>, Status> {
        let (code, expires_at_ms) = self.pairing.generate_code();
        Ok(Response::new(proto::GeneratePairingCodeResponse {
            code,
            expires_at_ms,
        }))
    }
}
