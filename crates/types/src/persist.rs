// Path: crates/types/src/persist.rs
//! Atomic JSON persistence for node state files.
//!
//! Every on-disk write in Gantry (node state, trust store, transfer
//! checkpoints) goes through the same tempfile + rename pattern so a
//! crash can never leave a half-written file behind.

use crate::error::PersistError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Reads and decodes a JSON file. Returns `Ok(None)` when the file does
/// not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PersistError::Read {
                path: path.display().to_string(),
                source: e,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PersistError::Decode {
            path: path.display().to_string(),
            source: e,
        })
}

/// Serializes a value to pretty JSON and writes it atomically: the bytes
/// land in a tempfile in the destination directory, are flushed, and the
/// tempfile is renamed over the destination.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let display = path.display().to_string();
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| PersistError::Encode {
        path: display.clone(),
        source: e,
    })?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| PersistError::Write {
        path: display.clone(),
        source: e,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PersistError::Write {
        path: display.clone(),
        source: e,
    })?;
    tmp.write_all(&bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PersistError::Write {
            path: display.clone(),
            source: e,
        })?;
    tmp.persist(path).map_err(|e| PersistError::Write {
        path: display,
        source: e.error,
    })?;
    Ok(())
}

/// Shared handle over the persisted node state file. Mutations run under
/// a lock and are flushed atomically before the lock is released, so the
/// on-disk file always reflects the last completed update.
pub struct StateHandle {
    path: std::path::PathBuf,
    state: parking_lot::Mutex<crate::model::NodeState>,
}

impl StateHandle {
    /// Loads the state file, or starts from defaults when it is absent.
    pub fn load_or_default(path: std::path::PathBuf) -> Result<Self, PersistError> {
        let state = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            state: parking_lot::Mutex::new(state),
        })
    }

    /// Runs a read-only closure over the current state.
    pub fn read<R>(&self, f: impl FnOnce(&crate::model::NodeState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Mutates the state and persists the result atomically.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut crate::model::NodeState) -> R,
    ) -> Result<R, PersistError> {
        let mut guard = self.state.lock();
        let out = f(&mut guard);
        write_json_atomic(&self.path, &*guard)?;
        Ok(out)
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
