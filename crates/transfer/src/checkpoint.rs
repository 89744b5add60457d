// Path: crates/transfer/src/checkpoint.rs
//! On-disk transfer checkpoints.
//!
//! A transfer record is flushed to `<data_dir>/checkpoints/<id>.json`
//! every hundred acknowledged chunks and on every status transition.
//! The file is removed after a successful completion and retained on
//! pause, failure and cancellation so the transfer can resume.

use gantry_types::error::TransferError;
use gantry_types::model::ResourceKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifecycle state of a transfer. Completed and failed are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Created but not yet streaming.
    Pending,
    /// Chunks are in flight.
    Active,
    /// Interrupted by a transient error; resumable.
    Paused,
    /// All bytes acknowledged and digests verified.
    Completed,
    /// Permanent error; checkpoint retained for inspection.
    Failed,
}

/// One acknowledged chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    /// Offset immediately after the acknowledged chunk. Strictly
    /// increasing across the list.
    pub offset: u64,
    /// XXH3-64 of the acknowledged chunk payload.
    pub checksum: u64,
    /// Unix milliseconds at acknowledgement.
    pub timestamp_ms: u64,
    /// Whether the receiver confirmed the checksum.
    pub verified: bool,
}

/// The persisted transfer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCheckpoint {
    /// Deterministic transfer id (see [`crate::transfer_id`]).
    pub transfer_id: String,
    /// Kind of resource being moved.
    pub kind: ResourceKind,
    /// Resource identifier on the source host.
    pub resource_id: String,
    /// Fingerprint of the destination peer.
    pub destination: String,
    /// Total stream length in bytes.
    pub total_bytes: u64,
    /// Bytes acknowledged; equals the last checkpoint's offset.
    pub transferred_bytes: u64,
    /// Chunk size in use when the record was written.
    pub chunk_size: usize,
    /// Lifecycle state at the time of the flush.
    pub status: TransferStatus,
    /// Acknowledged chunk history.
    pub checkpoints: Vec<ChunkCheckpoint>,
    /// Observed throughput of the current run, bytes per second.
    #[serde(default)]
    pub speed_bytes_per_sec: f64,
    /// Unix milliseconds of the last flush.
    pub updated_at_ms: u64,
}

impl TransferCheckpoint {
    /// Whether this record can seed a resumed transfer: offsets must
    /// reconcile and the previous run must not have completed.
    pub fn resumable(&self) -> bool {
        if self.status == TransferStatus::Completed {
            return false;
        }
        let last = self.checkpoints.last().map(|c| c.offset).unwrap_or(0);
        last == self.transferred_bytes
            && self.transferred_bytes <= self.total_bytes
            && self.checkpoints.windows(2).all(|w| w[0].offset < w[1].offset)
    }
}

/// Directory of checkpoint files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// A store rooted at `<data_dir>/checkpoints`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("checkpoints"),
        }
    }

    fn path(&self, transfer_id: &str) -> PathBuf {
        self.dir.join(format!("{transfer_id}.json"))
    }

    /// Loads a checkpoint, if one exists.
    pub fn load(&self, transfer_id: &str) -> Result<Option<TransferCheckpoint>, TransferError> {
        gantry_types::persist::read_json(&self.path(transfer_id))
            .map_err(|e| TransferError::Checkpoint(e.to_string()))
    }

    /// Flushes a checkpoint atomically.
    pub fn save(&self, checkpoint: &TransferCheckpoint) -> Result<(), TransferError> {
        gantry_types::persist::write_json_atomic(&self.path(&checkpoint.transfer_id), checkpoint)
            .map_err(|e| TransferError::Checkpoint(e.to_string()))
    }

    /// Removes a checkpoint after successful completion.
    pub fn remove(&self, transfer_id: &str) -> Result<(), TransferError> {
        match std::fs::remove_file(self.path(transfer_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::Checkpoint(e.to_string())),
        }
    }

    /// Whether a checkpoint file exists for the id.
    pub fn exists(&self, transfer_id: &str) -> bool {
        self.path(transfer_id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, status: TransferStatus) -> TransferCheckpoint {
        TransferCheckpoint {
            transfer_id: id.to_string(),
            kind: ResourceKind::Volume,
            resource_id: "data".into(),
            destination: "fp".into(),
            total_bytes: 4096,
            transferred_bytes: 2048,
            chunk_size: 1024,
            status,
            checkpoints: vec![
                ChunkCheckpoint {
                    offset: 1024,
                    checksum: 1,
                    timestamp_ms: 1,
                    verified: true,
                },
                ChunkCheckpoint {
                    offset: 2048,
                    checksum: 2,
                    timestamp_ms: 2,
                    verified: true,
                },
            ],
            speed_bytes_per_sec: 0.0,
            updated_at_ms: 2,
        }
    }

    #[test]
    fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        assert!(store.load("t1").unwrap().is_none());
        store.save(&sample("t1", TransferStatus::Paused)).unwrap();
        let loaded = store.load("t1").unwrap().unwrap();
        assert_eq!(loaded.transferred_bytes, 2048);
        assert!(store.exists("t1"));

        store.remove("t1").unwrap();
        assert!(!store.exists("t1"));
        // Removing twice is fine.
        store.remove("t1").unwrap();
    }

    #[test]
    fn resumability_rules() {
        assert!(sample("t", TransferStatus::Paused).resumable());
        assert!(sample("t", TransferStatus::Failed).resumable());
        assert!(!sample("t", TransferStatus::Completed).resumable());

        let mut torn = sample("t", TransferStatus::Paused);
        torn.transferred_bytes = 9999;
        assert!(!torn.resumable());

        let mut disordered = sample("t", TransferStatus::Paused);
        disordered.checkpoints.reverse();
        assert!(!disordered.resumable());
    }
}
