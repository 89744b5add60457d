// Path: crates/master/src/control.rs
//! The controller's gRPC surface for workers: registration, the
//! per-worker bidirectional control stream, inventory reports, and the
//! relay endpoint.

use crate::orchestrator::Orchestrator;
use crate::registry::Registry;
use crate::relay::RelayTable;
use gantry_ipc::v1 as proto;
use gantry_ipc::v1::control_plane_server::ControlPlane;
use gantry_types::ErrorCode;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

/// Outbound control-stream queue depth per worker.
const STREAM_BUFFER: usize = 64;

/// Implementation of the `ControlPlane` gRPC service.
pub struct ControlPlaneService {
    registry: Arc<Registry>,
    orchestrator: Arc<Orchestrator>,
    relay: Arc<RelayTable>,
}

impl ControlPlaneService {
    /// Wires the service over the controller's long-lived tables.
    pub fn new(
        registry: Arc<Registry>,
        orchestrator: Arc<Orchestrator>,
        relay: Arc<RelayTable>,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            relay,
        }
    }

    /// Processes worker frames until the stream ends. Heartbeats are
    /// answered on this task; progress and completion frames go to the
    /// orchestrator. Every frame is authenticated individually.
    async fn read_worker_frames(
        registry: Arc<Registry>,
        orchestrator: Arc<Orchestrator>,
        mut inbound: Streaming<proto::WorkerFrame>,
        outbound: mpsc::Sender<proto::ControllerFrame>,
    ) {
        let mut attached_worker: Option<String> = None;
        loop {
            let frame = match inbound.message().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "control stream read error");
                    break;
                }
            };

            if let Err(e) = registry
                .authenticate(&frame.worker_id, &frame.auth_token)
                .await
            {
                tracing::warn!(
                    worker = %frame.worker_id,
                    code = e.code(),
                    "rejected control frame; closing stream"
                );
                break;
            }

            // The first authenticated frame binds this stream to the
            // worker, replacing any prior handle.
            if attached_worker.as_deref() != Some(frame.worker_id.as_str()) {
                if registry
                    .attach_stream(&frame.worker_id, outbound.clone())
                    .await
                    .is_err()
                {
                    break;
                }
                attached_worker = Some(frame.worker_id.clone());
            }

            let worker_id = frame.worker_id;
            match frame.payload {
                Some(proto::worker_frame::Payload::Heartbeat(heartbeat)) => {
                    if registry.record_heartbeat(&worker_id, &heartbeat).await.is_err() {
                        break;
                    }
                    let ack = proto::ControllerFrame {
                        payload: Some(proto::controller_frame::Payload::HeartbeatAck(
                            proto::HeartbeatAck {
                                echoed_timestamp_ms: heartbeat.timestamp_ms,
                                healthy: true,
                            },
                        )),
                    };
                    if outbound.send(ack).await.is_err() {
                        break;
                    }
                }
                Some(proto::worker_frame::Payload::Progress(progress)) => {
                    if let Err(e) = orchestrator.update_progress(&worker_id, &progress).await {
                        tracing::debug!(
                            worker = %worker_id,
                            migration = %progress.migration_id,
                            code = e.code(),
                            "dropped progress frame"
                        );
                    }
                }
                Some(proto::worker_frame::Payload::Complete(complete)) => {
                    if let Err(e) = orchestrator.complete(&worker_id, &complete).await {
                        tracing::debug!(
                            worker = %worker_id,
                            migration = %complete.migration_id,
                            code = e.code(),
                            "dropped completion frame"
                        );
                    }
                }
                Some(proto::worker_frame::Payload::Error(error)) => {
                    tracing::warn!(
                        worker = %worker_id,
                        code = %error.code,
                        message = %error.message,
                        "worker reported an error"
                    );
                }
                None => {
                    tracing::debug!(worker = %worker_id, "empty control frame ignored");
                }
            }
        }

        if let Some(worker_id) = attached_worker {
            registry.detach_stream(&worker_id, &outbound).await;
            tracing::info!(worker = %worker_id, "control stream closed");
        }
    }
}

#[tonic::async_trait]
impl ControlPlane for ControlPlaneService {
    async fn register_worker(
        &self,
        request: Request<proto::RegisterWorkerRequest>,
    ) -> Result<Response<proto::RegisterWorkerResponse>, Status> {
        let remote = request
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let req = request.into_inner();

        // Registration failures are part of the response contract, not
        // transport errors.
        let response = match self.registry.register(&req).await {
            Ok(grant) => proto::RegisterWorkerResponse {
                success: true,
                worker_id: grant.worker_id,
                auth_token: grant.auth_token,
                heartbeat_interval_ms: grant.heartbeat_interval.as_millis() as u64,
                inventory_interval_ms: grant.inventory_interval.as_millis() as u64,
                error: String::new(),
            },
            Err(e) => {
                tracing::warn!(
                    remote = %remote,
                    worker_name = %req.worker_name,
                    code = e.code(),
                    "registration rejected"
                );
                proto::RegisterWorkerResponse {
                    success: false,
                    worker_id: String::new(),
                    auth_token: String::new(),
                    heartbeat_interval_ms: 0,
                    inventory_interval_ms: 0,
                    error: format!("{}: {e}", e.code()),
                }
            }
        };
        Ok(Response::new(response))
    }

    type ControlStreamStream =
        Pin<Box<dyn Stream<Item = Result<proto::ControllerFrame, Status>> + Send + 'static>>;

    async fn control_stream(
        &self,
        request: Request<Streaming<proto::WorkerFrame>>,
    ) -> Result<Response<Self::ControlStreamStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<proto::ControllerFrame>(STREAM_BUFFER);

        tokio::spawn(Self::read_worker_frames(
            self.registry.clone(),
            self.orchestrator.clone(),
            inbound,
            tx,
        ));

        let outbound = ReceiverStream::new(rx).map(Ok::<_, Status>);
        Ok(Response::new(
            Box::pin(outbound) as Self::ControlStreamStream
        ))
    }

    async fn report_inventory(
        &self,
        request: Request<proto::InventoryReport>,
    ) -> Result<Response<proto::InventoryAck>, Status> {
        let report = request.into_inner();
        self.registry
            .authenticate(&report.worker_id, &report.auth_token)
            .await
            .map_err(|e| Status::unauthenticated(format!("{}: {e}", e.code())))?;
        let inventory = report
            .inventory
            .ok_or_else(|| Status::invalid_argument("inventory report without inventory"))?;
        self.registry
            .record_inventory(&report.worker_id, inventory)
            .await
            .map_err(|e| Status::not_found(format!("{}: {e}", e.code())))?;
        Ok(Response::new(proto::InventoryAck { accepted: true }))
    }

    type RelayChannelStream =
        Pin<Box<dyn Stream<Item = Result<proto::ProxyFrame, Status>> + Send + 'static>>;

    async fn relay_channel(
        &self,
        request: Request<Streaming<proto::ProxyFrame>>,
    ) -> Result<Response<Self::RelayChannelStream>, Status> {
        let inbound = request.into_inner();
        let rx = self.relay.clone().serve_stream(inbound).await?;
        let outbound: Self::RelayChannelStream = Box::pin(ReceiverStream::new(rx));
        Ok(Response::new(outbound))
    }
}
