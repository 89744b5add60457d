// Path: crates/pairing/src/service.rs
//! tonic service wrapper over the pairing manager.

use crate::PairingManager;
use gantry_ipc::v1 as proto;
use gantry_ipc::v1::pairing_server::Pairing;
use gantry_types::error::PairingError;
use gantry_types::ErrorCode;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Implementation of the `Pairing` gRPC service.
pub struct PairingService {
    manager: Arc<PairingManager>,
}

impl PairingService {
    /// Serves exchanges against the given manager.
    pub fn new(manager: Arc<PairingManager>) -> Self {
        Self { manager }
    }
}

fn pairing_status(e: PairingError) -> Status {
    let message = format!("{}: {e}", e.code());
    match e {
        PairingError::RateLimited { .. } => Status::resource_exhausted(message),
        PairingError::ExpiredCode
        | PairingError::UnknownSession
        | PairingError::AlreadyCompleted => Status::failed_precondition(message),
        PairingError::InvalidVerifier | PairingError::MalformedCertificate(_) => {
            Status::invalid_argument(message)
        }
        PairingError::Transport(_) => Status::internal(message),
    }
}

#[tonic::async_trait]
impl Pairing for PairingService {
    async fn exchange(
        &self,
        request: Request<proto::PairingEnvelope>,
    ) -> Result<Response<proto::PairingEnvelope>, Status> {
        let source = request
            .remote_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let envelope = request.into_inner();
        let (reply, _outcome) = self
            .manager
            .handle_exchange(&source, envelope)
            .map_err(pairing_status)?;
        Ok(Response::new(reply))
    }
}
