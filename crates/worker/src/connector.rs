// Path: crates/worker/src/connector.rs
//! The worker's control-plane client: registration, the held control
//! stream, and the heartbeat / inventory / receive loops. Reconnects
//! with exponential backoff, re-presenting the issued auth token so the
//! worker keeps its identity across restarts.

use crate::executor::{heartbeat_frame, Executor, ExecutorEvent, WorkerCredentials};
use crate::host;
use crate::store::ResourceStore;
use gantry_ipc::v1 as proto;
use gantry_ipc::v1::control_plane_client::ControlPlaneClient;
use gantry_types::config::WorkerConfig;
use gantry_types::persist::StateHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;

/// Registration deadline.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);
/// Sessions are recycled after this long, forcing a clean reconnect.
const MAX_SESSION_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Control-stream outbound queue depth.
const STREAM_BUFFER: usize = 64;

/// How a control session ended.
enum SessionEnd {
    /// Stream dropped or aged out; reconnect.
    Disconnected,
    /// The controller ordered a shutdown; stop the agent.
    Shutdown,
}

/// Holds the control stream and its loops.
pub struct Connector {
    config: WorkerConfig,
    state: Arc<StateHandle>,
    fingerprint: String,
    store: Arc<dyn ResourceStore>,
    executor: Arc<Executor>,
}

impl Connector {
    /// A connector for this worker's identity and stores.
    pub fn new(
        config: WorkerConfig,
        state: Arc<StateHandle>,
        fingerprint: String,
        store: Arc<dyn ResourceStore>,
        executor: Arc<Executor>,
    ) -> Self {
        Self {
            config,
            state,
            fingerprint,
            store,
            executor,
        }
    }

    /// Runs until cancellation or a controller-ordered shutdown,
    /// reconnecting with exponential backoff in between sessions.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut backoff = self.config.reconnect_interval();
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.session(&cancel).await {
                Ok(SessionEnd::Shutdown) => {
                    tracing::info!("controller ordered shutdown");
                    cancel.cancel();
                    return Ok(());
                }
                Ok(SessionEnd::Disconnected) => {
                    // The session was established; start backoff over.
                    backoff = self.config.reconnect_interval();
                    tracing::info!("control session ended; reconnecting");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "control session failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_reconnect_interval());
        }
    }

    async fn session(&self, cancel: &CancellationToken) -> anyhow::Result<SessionEnd> {
        let channel = Channel::from_shared(self.config.master_url.clone())?
            .connect()
            .await?;
        let mut client = ControlPlaneClient::new(channel.clone());

        let (credentials, grant) = self.register(&mut client).await?;
        self.state.update(|s| {
            s.worker_id = Some(credentials.worker_id.clone());
            s.auth_token = Some(credentials.auth_token.clone());
        })?;
        tracing::info!(worker = %credentials.worker_id, "registered with controller");

        let (interval_tx, interval_rx) = watch::channel((
            Duration::from_millis(grant.heartbeat_interval_ms.max(1000)),
            Duration::from_millis(grant.inventory_interval_ms.max(1000)),
        ));

        // The connector is the sole writer of control-stream frames;
        // the heartbeat loop and executor events funnel through this
        // queue.
        let (frame_tx, frame_rx) = mpsc::channel::<proto::WorkerFrame>(STREAM_BUFFER);
        frame_tx
            .send(heartbeat_frame(
                &credentials,
                "idle",
                0,
                host::system_stats(),
            ))
            .await?;
        let response = client
            .control_stream(Request::new(ReceiverStream::new(frame_rx)))
            .await?;
        let mut inbound = response.into_inner();

        let session_cancel = cancel.child_token();
        let _session_guard = session_cancel.clone().drop_guard();

        self.spawn_heartbeat_loop(
            credentials.clone(),
            frame_tx.clone(),
            interval_rx.clone(),
            session_cancel.clone(),
        );
        self.spawn_inventory_loop(
            credentials.clone(),
            ControlPlaneClient::new(channel),
            interval_rx,
            session_cancel.clone(),
        );

        let (event_tx, mut event_rx) = mpsc::channel::<ExecutorEvent>(STREAM_BUFFER);
        let max_age = tokio::time::sleep(MAX_SESSION_AGE);
        tokio::pin!(max_age);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Disconnected),
                _ = &mut max_age => {
                    tracing::info!("control session reached maximum age; recycling");
                    return Ok(SessionEnd::Disconnected);
                }
                event = event_rx.recv() => {
                    // The executor side never closes while this loop runs.
                    let Some(event) = event else { continue };
                    let payload = match event {
                        ExecutorEvent::Progress(p) => proto::worker_frame::Payload::Progress(p),
                        ExecutorEvent::Complete(c) => proto::worker_frame::Payload::Complete(c),
                    };
                    let frame = proto::WorkerFrame {
                        worker_id: credentials.worker_id.clone(),
                        auth_token: credentials.auth_token.clone(),
                        payload: Some(payload),
                    };
                    if frame_tx.send(frame).await.is_err() {
                        return Ok(SessionEnd::Disconnected);
                    }
                }
                message = inbound.message() => {
                    let frame = match message {
                        Ok(Some(frame)) => frame,
                        Ok(None) => return Ok(SessionEnd::Disconnected),
                        Err(status) => {
                            tracing::warn!(error = %status, "control stream error");
                            return Ok(SessionEnd::Disconnected);
                        }
                    };
                    match frame.payload {
                        Some(proto::controller_frame::Payload::HeartbeatAck(ack)) => {
                            tracing::trace!(echoed = ack.echoed_timestamp_ms, "heartbeat acknowledged");
                        }
                        Some(proto::controller_frame::Payload::StartMigration(cmd)) => {
                            self.executor.spawn_start(
                                credentials.clone(),
                                cmd,
                                event_tx.clone(),
                                cancel,
                            );
                        }
                        Some(proto::controller_frame::Payload::CancelMigration(cmd)) => {
                            self.executor
                                .cancel_migration(&cmd.migration_id, &cmd.reason)
                                .await;
                        }
                        Some(proto::controller_frame::Payload::UpdateConfig(update)) => {
                            interval_tx.send_modify(|(heartbeat, inventory)| {
                                if let Some(ms) = update.heartbeat_interval_ms {
                                    *heartbeat = Duration::from_millis(ms.max(1000));
                                }
                                if let Some(ms) = update.inventory_interval_ms {
                                    *inventory = Duration::from_millis(ms.max(1000));
                                }
                            });
                            tracing::info!("intervals updated by controller");
                        }
                        Some(proto::controller_frame::Payload::Shutdown(order)) => {
                            tracing::info!(reason = %order.reason, "shutdown ordered");
                            return Ok(SessionEnd::Shutdown);
                        }
                        None => {}
                    }
                }
            }
        }
    }

    /// Registers, preferring the previously issued auth token so the
    /// worker re-attaches to its identity; falls back to the configured
    /// enrollment token when the stored credential is stale.
    async fn register(
        &self,
        client: &mut ControlPlaneClient<Channel>,
    ) -> anyhow::Result<(WorkerCredentials, proto::RegisterWorkerResponse)> {
        let stored = self.state.read(|s| s.auth_token.clone());
        let configured = self.config.enrollment_token.clone();
        let mut tried = Vec::new();

        for token in [stored, configured].into_iter().flatten() {
            if tried.contains(&token) {
                continue;
            }
            tried.push(token.clone());

            let request = proto::RegisterWorkerRequest {
                enrollment_token: token,
                worker_name: if self.config.name.is_empty() {
                    host::hostname()
                } else {
                    self.config.name.clone()
                },
                hostname: host::hostname(),
                data_address: self.config.data_address.clone(),
                fingerprint: self.fingerprint.clone(),
                labels: self.config.labels.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            let response = tokio::time::timeout(
                REGISTER_TIMEOUT,
                client.register_worker(Request::new(request)),
            )
            .await
            .map_err(|_| anyhow::anyhow!("registration timed out"))??
            .into_inner();

            if response.success {
                let credentials = WorkerCredentials {
                    worker_id: response.worker_id.clone(),
                    auth_token: response.auth_token.clone(),
                };
                return Ok((credentials, response));
            }
            tracing::warn!(error = %response.error, "registration attempt rejected");
        }
        anyhow::bail!("registration rejected by controller")
    }

    fn spawn_heartbeat_loop(
        &self,
        credentials: WorkerCredentials,
        frame_tx: mpsc::Sender<proto::WorkerFrame>,
        intervals: watch::Receiver<(Duration, Duration)>,
        cancel: CancellationToken,
    ) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            loop {
                let interval = intervals.borrow().0;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let active = executor.active_count().await;
                let status = if active > 0 { "busy" } else { "idle" };
                let frame =
                    heartbeat_frame(&credentials, status, active, host::system_stats());
                if frame_tx.send(frame).await.is_err() {
                    return;
                }
            }
        });
    }

    fn spawn_inventory_loop(
        &self,
        credentials: WorkerCredentials,
        mut client: ControlPlaneClient<Channel>,
        intervals: watch::Receiver<(Duration, Duration)>,
        cancel: CancellationToken,
    ) {
        let store = self.store.clone();
        tokio::spawn(async move {
            // Immediate scan, then periodic reports.
            loop {
                match store.inventory().await {
                    Ok(inventory) => {
                        let report = proto::InventoryReport {
                            worker_id: credentials.worker_id.clone(),
                            auth_token: credentials.auth_token.clone(),
                            inventory: Some(inventory),
                        };
                        if let Err(status) =
                            client.report_inventory(Request::new(report)).await
                        {
                            tracing::debug!(error = %status, "inventory report failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "inventory scan failed");
                    }
                }
                let interval = intervals.borrow().1;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }
}
