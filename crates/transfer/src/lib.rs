// Path: crates/transfer/src/lib.rs
//! The Gantry transfer engine.
//!
//! A producer chops a resource byte stream into chunks, each carrying an
//! XXH3-64 checksum and its offset; the consumer verifies continuity and
//! checksum before committing bytes, and acknowledges each chunk before
//! the next is sent. Acknowledged progress is checkpointed to disk so an
//! interrupted transfer resumes from its last acknowledged offset, and a
//! running SHA-256 over the whole stream is compared end-to-end on
//! completion.

pub mod channel;
pub mod checkpoint;
pub mod chunk;
pub mod engine;
pub mod recv;
pub mod send;
pub mod sizer;

pub use channel::DataChannel;
pub use engine::{EngineConfig, TransferEngine};
pub use recv::{AckData, InboundChunk, ReceiveSession};
pub use send::SendOutcome;

/// Receivers must accept any chunk size within these bounds.
pub const MIN_CHUNK_SIZE: usize = 256 * 1024;
/// Upper bound for dynamic chunk growth.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Starting chunk size before dynamic sizing kicks in.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Checkpoints between on-disk flushes of the transfer record.
pub const CHECKPOINT_FLUSH_EVERY: u64 = 100;

/// Deterministic transfer identifier: a transfer restarted with the same
/// resource and destination finds its previous checkpoint file.
pub fn transfer_id(
    kind: gantry_types::model::ResourceKind,
    resource_id: &str,
    destination_fingerprint: &str,
) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(kind.to_string().as_bytes());
    hasher.update(b"/");
    hasher.update(resource_id.as_bytes());
    hasher.update(b"/");
    hasher.update(destination_fingerprint.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
