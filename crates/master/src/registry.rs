// Path: crates/master/src/registry.rs
//! The worker fleet registry.
//!
//! Exclusively owns the id-to-worker mapping. The map sits behind a
//! reader/writer lock whose writers are worker lifecycle events; each
//! worker's outbound control stream is guarded by its own mutex so
//! command frames on a single stream are serialized.

use gantry_ipc::v1 as proto;
use gantry_types::error::RegistryError;
use gantry_types::model::{SystemStats, WorkerStatus};
use gantry_types::time::now_unix_ms;
use rand::RngCore;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Registry tuning, taken from the master configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Liveness window; a worker is online while its last heartbeat is
    /// younger than this.
    pub worker_timeout: Duration,
    /// Heartbeat interval handed to workers at registration.
    pub heartbeat_interval: Duration,
    /// Inventory interval handed to workers at registration.
    pub inventory_interval: Duration,
    /// Registration capacity.
    pub max_workers: usize,
}

/// A registered worker.
#[derive(Debug, Clone)]
pub struct Worker {
    /// Assigned identifier.
    pub id: String,
    /// Advertised name.
    pub name: String,
    /// Reported hostname.
    pub hostname: String,
    /// Data-plane endpoint other workers dial.
    pub data_address: String,
    /// Certificate fingerprint presented at registration.
    pub fingerprint: String,
    /// Operator labels.
    pub labels: HashMap<String, String>,
    /// Agent version string.
    pub version: String,
    /// Last status reported in a heartbeat.
    pub status: WorkerStatus,
    /// Per-worker credential; unique across the registry.
    pub auth_token: String,
    /// Unix milliseconds at registration.
    pub registered_at_ms: u64,
    /// Monotonic instant of the last heartbeat (or registration).
    pub last_heartbeat: Instant,
    /// Monotonic instant of the last inventory report.
    pub last_inventory: Option<Instant>,
    /// Cached inventory from the last report.
    pub inventory: Option<proto::Inventory>,
    /// Cached host statistics from the last heartbeat.
    pub system_stats: Option<SystemStats>,
    /// Active migration count from the last heartbeat.
    pub active_migrations: u32,
}

struct WorkerEntry {
    worker: RwLock<Worker>,
    /// The held control stream, if any. Exactly one may be attached at a
    /// time; a new attach atomically replaces the prior handle.
    outbound: Mutex<Option<mpsc::Sender<proto::ControllerFrame>>>,
}

/// Credentials and intervals returned by a successful registration.
#[derive(Debug, Clone)]
pub struct RegistrationGrant {
    /// Assigned worker id.
    pub worker_id: String,
    /// Per-worker auth token.
    pub auth_token: String,
    /// Heartbeat interval the worker should use.
    pub heartbeat_interval: Duration,
    /// Inventory interval the worker should use.
    pub inventory_interval: Duration,
}

/// The fleet registry.
pub struct Registry {
    config: RegistryConfig,
    enrollment_token: RwLock<String>,
    workers: RwLock<HashMap<String, Arc<WorkerEntry>>>,
    /// auth_token -> worker_id index for per-frame authentication.
    tokens: RwLock<HashMap<String, String>>,
}

impl Registry {
    /// An empty registry accepting the given enrollment token.
    pub fn new(config: RegistryConfig, enrollment_token: String) -> Self {
        Self {
            config,
            enrollment_token: RwLock::new(enrollment_token),
            workers: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// The currently accepted enrollment token.
    pub async fn enrollment_token(&self) -> String {
        self.enrollment_token.read().await.clone()
    }

    /// Replaces the enrollment token, returning the new value. Already
    /// registered workers keep their auth tokens.
    pub async fn rotate_enrollment_token(&self) -> String {
        let fresh = mint_token();
        *self.enrollment_token.write().await = fresh.clone();
        tracing::info!("enrollment token rotated");
        fresh
    }

    /// Registers a worker, or re-attaches one presenting a live auth
    /// token as its enrollment credential.
    pub async fn register(
        &self,
        request: &proto::RegisterWorkerRequest,
    ) -> Result<RegistrationGrant, RegistryError> {
        // Re-attach path: a previously issued auth token is accepted in
        // place of the enrollment token and maps onto the same identity.
        if let Some(worker_id) = self
            .tokens
            .read()
            .await
            .get(&request.enrollment_token)
            .cloned()
        {
            return self.reattach(&worker_id, request).await;
        }

        if request.enrollment_token != *self.enrollment_token.read().await {
            return Err(RegistryError::BadEnrollmentToken);
        }

        let mut workers = self.workers.write().await;
        let mut tokens = self.tokens.write().await;
        if workers.len() >= self.config.max_workers {
            return Err(RegistryError::FleetFull {
                max: self.config.max_workers,
            });
        }

        let auth_token = loop {
            let candidate = mint_token();
            if !tokens.contains_key(&candidate) {
                break candidate;
            }
        };
        let worker_id = uuid::Uuid::new_v4().to_string();

        let worker = Worker {
            id: worker_id.clone(),
            name: request.worker_name.clone(),
            hostname: request.hostname.clone(),
            data_address: request.data_address.clone(),
            fingerprint: request.fingerprint.clone(),
            labels: request.labels.clone(),
            version: request.version.clone(),
            status: WorkerStatus::Idle,
            auth_token: auth_token.clone(),
            registered_at_ms: now_unix_ms(),
            last_heartbeat: Instant::now(),
            last_inventory: None,
            inventory: None,
            system_stats: None,
            active_migrations: 0,
        };
        workers.insert(
            worker_id.clone(),
            Arc::new(WorkerEntry {
                worker: RwLock::new(worker),
                outbound: Mutex::new(None),
            }),
        );
        tokens.insert(auth_token.clone(), worker_id.clone());

        tracing::info!(
            worker = %worker_id,
            name = %request.worker_name,
            data_address = %request.data_address,
            "worker registered"
        );

        Ok(RegistrationGrant {
            worker_id,
            auth_token,
            heartbeat_interval: self.config.heartbeat_interval,
            inventory_interval: self.config.inventory_interval,
        })
    }

    async fn reattach(
        &self,
        worker_id: &str,
        request: &proto::RegisterWorkerRequest,
    ) -> Result<RegistrationGrant, RegistryError> {
        let entry = self.entry(worker_id).await?;
        let mut worker = entry.worker.write().await;
        worker.name = request.worker_name.clone();
        worker.hostname = request.hostname.clone();
        worker.data_address = request.data_address.clone();
        worker.fingerprint = request.fingerprint.clone();
        worker.labels = request.labels.clone();
        worker.version = request.version.clone();
        worker.last_heartbeat = Instant::now();

        tracing::info!(worker = %worker_id, "worker re-attached with prior auth token");

        Ok(RegistrationGrant {
            worker_id: worker_id.to_string(),
            auth_token: worker.auth_token.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            inventory_interval: self.config.inventory_interval,
        })
    }

    /// Authenticates a frame: the token must be known and must belong to
    /// the claimed worker id.
    pub async fn authenticate(
        &self,
        worker_id: &str,
        auth_token: &str,
    ) -> Result<(), RegistryError> {
        match self.tokens.read().await.get(auth_token) {
            Some(owner) if owner == worker_id => Ok(()),
            Some(_) => Err(RegistryError::WorkerIdMismatch),
            None => Err(RegistryError::BadAuthToken),
        }
    }

    /// Resolves an auth token to its worker id.
    pub async fn worker_for_token(&self, auth_token: &str) -> Option<String> {
        self.tokens.read().await.get(auth_token).cloned()
    }

    async fn entry(&self, worker_id: &str) -> Result<Arc<WorkerEntry>, RegistryError> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .cloned()
            .ok_or_else(|| RegistryError::WorkerNotFound(worker_id.to_string()))
    }

    /// Attaches a control stream, replacing any prior handle.
    pub async fn attach_stream(
        &self,
        worker_id: &str,
        sender: mpsc::Sender<proto::ControllerFrame>,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(worker_id).await?;
        let mut outbound = entry.outbound.lock().await;
        if outbound.is_some() {
            tracing::info!(worker = %worker_id, "replacing held control stream");
        }
        *outbound = Some(sender);
        Ok(())
    }

    /// Detaches a control stream, but only when the held handle is the
    /// one being torn down — a replacement attach wins.
    pub async fn detach_stream(
        &self,
        worker_id: &str,
        sender: &mpsc::Sender<proto::ControllerFrame>,
    ) {
        if let Ok(entry) = self.entry(worker_id).await {
            let mut outbound = entry.outbound.lock().await;
            if outbound
                .as_ref()
                .map(|held| held.same_channel(sender))
                .unwrap_or(false)
            {
                *outbound = None;
            }
        }
    }

    /// Sends a command frame on the worker's held stream.
    pub async fn send_command(
        &self,
        worker_id: &str,
        frame: proto::ControllerFrame,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(worker_id).await?;
        let outbound = entry.outbound.lock().await;
        match outbound.as_ref() {
            Some(sender) => sender
                .send(frame)
                .await
                .map_err(|e| RegistryError::SendFailed(e.to_string())),
            None => Err(RegistryError::NotConnected(worker_id.to_string())),
        }
    }

    /// Records a heartbeat. `last_heartbeat` never moves backwards.
    pub async fn record_heartbeat(
        &self,
        worker_id: &str,
        heartbeat: &proto::Heartbeat,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(worker_id).await?;
        let mut worker = entry.worker.write().await;
        worker.last_heartbeat = Instant::now();
        worker.active_migrations = heartbeat.active_migration_count;
        if let Ok(status) = WorkerStatus::from_str(&heartbeat.status) {
            worker.status = status;
        }
        if let Some(stats) = &heartbeat.system_stats {
            worker.system_stats = Some(stats.clone().into());
        }
        Ok(())
    }

    /// Caches an inventory report.
    pub async fn record_inventory(
        &self,
        worker_id: &str,
        inventory: proto::Inventory,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(worker_id).await?;
        let mut worker = entry.worker.write().await;
        worker.inventory = Some(inventory);
        worker.last_inventory = Some(Instant::now());
        Ok(())
    }

    /// A point-in-time copy of one worker, plus its liveness.
    pub async fn get(&self, worker_id: &str) -> Option<(Worker, bool)> {
        let entry = self.workers.read().await.get(worker_id).cloned()?;
        let worker = entry.worker.read().await.clone();
        let online = worker.last_heartbeat.elapsed() < self.config.worker_timeout;
        Some((worker, online))
    }

    /// Point-in-time copies of every worker, plus liveness.
    pub async fn list(&self) -> Vec<(Worker, bool)> {
        let entries: Vec<Arc<WorkerEntry>> =
            self.workers.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let worker = entry.worker.read().await.clone();
            let online = worker.last_heartbeat.elapsed() < self.config.worker_timeout;
            out.push((worker, online));
        }
        out
    }

    /// Whether a worker is currently online.
    pub async fn is_online(&self, worker_id: &str) -> bool {
        matches!(self.get(worker_id).await, Some((_, true)))
    }

    /// Number of registered workers.
    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes a worker and its token.
    pub async fn remove(&self, worker_id: &str) -> Option<Worker> {
        let entry = self.workers.write().await.remove(worker_id)?;
        let worker = entry.worker.read().await.clone();
        self.tokens.write().await.remove(&worker.auth_token);
        Some(worker)
    }

    /// Spawns the background sweeper: every half liveness window it
    /// purges workers silent for three windows, reporting the purged ids
    /// on the returned channel so the orchestrator can cancel their jobs.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<String> {
        let registry = Arc::clone(self);
        let (purged_tx, purged_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.worker_timeout / 2);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let stale_after = registry.config.worker_timeout * 3;
                let stale: Vec<String> = registry
                    .list()
                    .await
                    .into_iter()
                    .filter(|(w, _)| w.last_heartbeat.elapsed() > stale_after)
                    .map(|(w, _)| w.id)
                    .collect();
                for worker_id in stale {
                    if registry.remove(&worker_id).await.is_some() {
                        tracing::warn!(worker = %worker_id, "purged unresponsive worker");
                        let _ = purged_tx.send(worker_id).await;
                    }
                }
            }
        });
        purged_rx
    }
}

/// A fresh 32-byte cryptographically random token, hex-encoded.
pub(crate) fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
