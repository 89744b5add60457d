// Path: crates/transfer/src/engine.rs
//! The transfer table: in-memory records plus their on-disk checkpoints.

use crate::checkpoint::{CheckpointStore, TransferCheckpoint, TransferStatus};
use gantry_types::error::TransferError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Engine tuning, taken from the node configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunk size before dynamic sizing kicks in.
    pub chunk_size_default: usize,
    /// Whether end-of-transfer SHA-256 digests are compared.
    pub verify_checksums: bool,
    /// Simultaneous transfers.
    pub max_concurrent: usize,
    /// Wall-clock bound on a single resource transfer.
    pub transfer_timeout: std::time::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size_default: crate::DEFAULT_CHUNK_SIZE,
            verify_checksums: true,
            max_concurrent: 4,
            transfer_timeout: std::time::Duration::from_secs(3600),
        }
    }
}

/// Owns every transfer record on this node and the checkpoint directory.
pub struct TransferEngine {
    pub(crate) store: CheckpointStore,
    pub(crate) config: EngineConfig,
    pub(crate) limiter: Arc<Semaphore>,
    records: Mutex<HashMap<String, TransferCheckpoint>>,
}

impl TransferEngine {
    /// An engine rooted at the node data directory.
    pub fn new(data_dir: &Path, config: EngineConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store: CheckpointStore::new(data_dir),
            config,
            limiter,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// The checkpoint directory handle.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.store
    }

    /// Current view of a transfer record.
    pub fn snapshot(&self, transfer_id: &str) -> Option<TransferCheckpoint> {
        self.records
            .lock()
            .ok()
            .and_then(|map| map.get(transfer_id).cloned())
    }

    /// All records the engine currently tracks.
    pub fn list(&self) -> Vec<TransferCheckpoint> {
        self.records
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn track(&self, record: &TransferCheckpoint) {
        if let Ok(mut map) = self.records.lock() {
            map.insert(record.transfer_id.clone(), record.clone());
        }
    }

    /// Flushes a record and mirrors it into the in-memory table.
    pub(crate) fn flush(&self, record: &TransferCheckpoint) -> Result<(), TransferError> {
        self.store.save(record)?;
        self.track(record);
        Ok(())
    }

    /// Marks a record terminal or paused after an error, persisting the
    /// checkpoint in either case. Permanent errors fail the transfer;
    /// transient ones (and cancellation) pause it.
    pub(crate) fn settle_error(
        &self,
        mut record: TransferCheckpoint,
        error: TransferError,
    ) -> TransferError {
        record.status = if error.is_permanent() {
            TransferStatus::Failed
        } else {
            TransferStatus::Paused
        };
        record.updated_at_ms = gantry_types::time::now_unix_ms();
        if let Err(flush_err) = self.flush(&record) {
            tracing::warn!(
                transfer = %record.transfer_id,
                error = %flush_err,
                "failed to persist checkpoint while settling a transfer error"
            );
        }
        error
    }
}
