// Path: crates/types/src/error/mod.rs
//! Core error types for Gantry.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
///
/// Codes are part of the wire contract: they are carried in `WorkerError`
/// frames and in terminal migration records, and must never change once
/// released.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors raised by the identity / trust layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The identity keypair or certificate could not be loaded. Fatal at startup.
    #[error("Failed to load identity: {0}")]
    IdentityLoad(String),
    /// The identity keypair or certificate could not be written to disk.
    #[error("Failed to persist identity: {0}")]
    IdentityPersist(String),
    /// A certificate could not be parsed or encoded.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
    /// The presented peer certificate's fingerprint is neither pinned nor trusted.
    #[error("Untrusted peer fingerprint: {fingerprint}")]
    UntrustedPeer {
        /// Lowercase-hex SHA-256 of the presented DER certificate.
        fingerprint: String,
    },
    /// A TLS configuration could not be constructed.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    /// Key derivation failed.
    #[error("Key derivation failed: {0}")]
    Kdf(String),
}

impl ErrorCode for CryptoError {
    fn code(&self) -> &'static str {
        match self {
            Self::IdentityLoad(_) => "CRYPTO_IDENTITY_LOAD",
            Self::IdentityPersist(_) => "CRYPTO_IDENTITY_PERSIST",
            Self::InvalidCertificate(_) => "CRYPTO_INVALID_CERT",
            Self::UntrustedPeer { .. } => "CRYPTO_UNTRUSTED_PEER",
            Self::TlsConfig(_) => "CRYPTO_TLS_CONFIG",
            Self::Kdf(_) => "CRYPTO_KDF_FAILED",
        }
    }
}

/// Errors raised by the short-code pairing protocol. None of these
/// auto-retry; each is surfaced to the caller with its code.
#[derive(Debug, Error)]
pub enum PairingError {
    /// The pairing code has passed its expiry window.
    #[error("Pairing code expired")]
    ExpiredCode,
    /// The verifier hash did not match the received public key and code.
    #[error("Pairing verifier mismatch")]
    InvalidVerifier,
    /// The peer certificate carried in the pairing message is unusable.
    #[error("Malformed peer certificate: {0}")]
    MalformedCertificate(String),
    /// The source address exceeded the attempt budget and is banned.
    #[error("Rate limited; retry in {retry_after_secs}s")]
    RateLimited {
        /// Seconds remaining on the ban.
        retry_after_secs: u64,
    },
    /// No open pairing session matches the received message.
    #[error("No matching pairing session")]
    UnknownSession,
    /// The session has already completed; pairing codes are single-use.
    #[error("Pairing session already used")]
    AlreadyCompleted,
    /// The pairing exchange failed at the transport layer.
    #[error("Pairing transport error: {0}")]
    Transport(String),
}

impl ErrorCode for PairingError {
    fn code(&self) -> &'static str {
        match self {
            Self::ExpiredCode => "PAIRING_EXPIRED_CODE",
            Self::InvalidVerifier => "PAIRING_INVALID_VERIFIER",
            Self::MalformedCertificate(_) => "PAIRING_MALFORMED_CERT",
            Self::RateLimited { .. } => "PAIRING_RATE_LIMITED",
            Self::UnknownSession => "PAIRING_UNKNOWN_SESSION",
            Self::AlreadyCompleted => "PAIRING_SESSION_USED",
            Self::Transport(_) => "PAIRING_TRANSPORT",
        }
    }
}

/// Errors raised by the transfer engine.
///
/// Checksum, offset and digest variants are permanent: the transfer moves
/// to `failed` and keeps its checkpoint for inspection. Transport errors
/// are transient: the transfer moves to `paused` and may be resumed.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A chunk's checksum did not match its payload.
    #[error("Checksum mismatch at offset {offset}")]
    ChecksumMismatch {
        /// Offset of the offending chunk.
        offset: u64,
    },
    /// A chunk arrived out of order.
    #[error("Offset discontinuity: expected {expected}, got {got}")]
    OffsetDiscontinuity {
        /// The offset the receiver was waiting for.
        expected: u64,
        /// The offset actually carried by the chunk.
        got: u64,
    },
    /// The end-to-end SHA-256 digests disagree.
    #[error("Stream digest mismatch: sender {sender}, receiver {receiver}")]
    DigestMismatch {
        /// Digest computed by the sending side.
        sender: String,
        /// Digest computed by the receiving side.
        receiver: String,
    },
    /// The receiver refused a chunk.
    #[error("Transfer rejected at offset {offset}: {reason}")]
    Rejected {
        /// Offset of the rejected chunk.
        offset: u64,
        /// Receiver-provided reason.
        reason: String,
    },
    /// The underlying channel failed mid-transfer.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The channel ended before the final chunk was delivered.
    #[error("Stream truncated: {got} of {expected} bytes delivered")]
    TruncatedStream {
        /// Bytes the transfer was expected to carry.
        expected: u64,
        /// Bytes actually acknowledged.
        got: u64,
    },
    /// The checkpoint file could not be read or written.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    /// The resource backing the transfer could not be opened or written.
    #[error("Resource error: {0}")]
    Resource(String),
    /// Cooperative cancellation was observed.
    #[error("Transfer cancelled")]
    Cancelled,
    /// Invariant violation inside the engine.
    #[error("Internal transfer error: {0}")]
    Internal(String),
}

impl ErrorCode for TransferError {
    fn code(&self) -> &'static str {
        match self {
            Self::ChecksumMismatch { .. } => "TRANSFER_CHECKSUM_MISMATCH",
            Self::OffsetDiscontinuity { .. } => "TRANSFER_OFFSET_DISCONTINUITY",
            Self::DigestMismatch { .. } => "TRANSFER_DIGEST_MISMATCH",
            Self::Rejected { .. } => "TRANSFER_REJECTED",
            Self::Transport(_) => "TRANSFER_TRANSPORT",
            Self::TruncatedStream { .. } => "TRANSFER_TRUNCATED",
            Self::Checkpoint(_) => "TRANSFER_CHECKPOINT",
            Self::Resource(_) => "TRANSFER_RESOURCE",
            Self::Cancelled => "TRANSFER_CANCELLED",
            Self::Internal(_) => "TRANSFER_INTERNAL",
        }
    }
}

impl TransferError {
    /// Whether the failure is permanent. Permanent failures move the
    /// transfer to `failed`; everything else pauses it with the
    /// checkpoint retained.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::OffsetDiscontinuity { .. }
                | Self::DigestMismatch { .. }
                | Self::Rejected { .. }
                | Self::Internal(_)
        )
    }
}

/// Errors raised by the worker registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The enrollment token presented at registration is not valid.
    #[error("Invalid enrollment token")]
    BadEnrollmentToken,
    /// The auth token on a frame does not identify a registered worker.
    #[error("Invalid auth token")]
    BadAuthToken,
    /// The frame's worker id does not match the token's owner.
    #[error("Worker id does not match auth token")]
    WorkerIdMismatch,
    /// No worker with the given id is registered.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),
    /// The worker has no attached control stream.
    #[error("Worker not connected: {0}")]
    NotConnected(String),
    /// The registry is at `max_workers` capacity.
    #[error("Registry full: limit {max}")]
    FleetFull {
        /// Configured worker limit.
        max: usize,
    },
    /// The command could not be written to the worker's stream.
    #[error("Command send failed: {0}")]
    SendFailed(String),
}

impl ErrorCode for RegistryError {
    fn code(&self) -> &'static str {
        match self {
            Self::BadEnrollmentToken => "REGISTRY_BAD_ENROLLMENT",
            Self::BadAuthToken => "REGISTRY_BAD_AUTH_TOKEN",
            Self::WorkerIdMismatch => "REGISTRY_WORKER_ID_MISMATCH",
            Self::WorkerNotFound(_) => "REGISTRY_WORKER_NOT_FOUND",
            Self::NotConnected(_) => "REGISTRY_NOT_CONNECTED",
            Self::FleetFull { .. } => "REGISTRY_FLEET_FULL",
            Self::SendFailed(_) => "REGISTRY_SEND_FAILED",
        }
    }
}

/// Errors raised by the migration orchestrator. Precondition variants are
/// reported synchronously to the initiating call and record no job.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The named worker is not registered.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),
    /// The named worker has not heartbeated within the liveness window.
    #[error("Worker offline: {0}")]
    WorkerOffline(String),
    /// The migration request names no resources.
    #[error("Migration request has an empty resource set")]
    EmptyResourceSet,
    /// The requested strategy name is not recognized.
    #[error("Unknown migration strategy: {0}")]
    UnknownStrategy(String),
    /// No migration with the given id exists.
    #[error("Migration not found: {0}")]
    JobNotFound(String),
    /// The job is not in a cancellable state.
    #[error("Migration in state {status} cannot be cancelled")]
    NotCancellable {
        /// The job's current status.
        status: String,
    },
    /// A start or cancel command could not be delivered.
    #[error("Command delivery failed: {0}")]
    Command(#[from] RegistryError),
}

impl ErrorCode for OrchestratorError {
    fn code(&self) -> &'static str {
        match self {
            Self::WorkerNotFound(_) => "ORCH_WORKER_NOT_FOUND",
            Self::WorkerOffline(_) => "ORCH_WORKER_OFFLINE",
            Self::EmptyResourceSet => "ORCH_EMPTY_RESOURCES",
            Self::UnknownStrategy(_) => "ORCH_UNKNOWN_STRATEGY",
            Self::JobNotFound(_) => "ORCH_JOB_NOT_FOUND",
            Self::NotCancellable { .. } => "ORCH_NOT_CANCELLABLE",
            Self::Command(_) => "ORCH_COMMAND_FAILED",
        }
    }
}

/// Errors raised by the controller-hosted relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The first frame on a relay stream was not a handshake.
    #[error("Relay stream opened without a handshake frame")]
    MissingHandshake,
    /// The handshake's auth token did not authenticate a worker.
    #[error("Relay handshake not authenticated")]
    Unauthenticated,
    /// A second stream claimed a role already held on this migration.
    #[error("Duplicate {role} handshake for migration")]
    DuplicateRole {
        /// The role both streams claimed.
        role: String,
    },
    /// A frame type that the relay does not forward.
    #[error("Unexpected relay frame: {0}")]
    UnexpectedFrame(String),
    /// The opposite side of the channel is gone.
    #[error("Relay channel closed")]
    ChannelClosed,
}

impl ErrorCode for RelayError {
    fn code(&self) -> &'static str {
        match self {
            Self::MissingHandshake => "RELAY_MISSING_HANDSHAKE",
            Self::Unauthenticated => "RELAY_UNAUTHENTICATED",
            Self::DuplicateRole { .. } => "RELAY_DUPLICATE_ROLE",
            Self::UnexpectedFrame(_) => "RELAY_UNEXPECTED_FRAME",
            Self::ChannelClosed => "RELAY_CHANNEL_CLOSED",
        }
    }
}

/// Errors raised while reading or writing persisted node state.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// Path of the offending file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file could not be written atomically.
    #[error("Failed to write {path}: {source}")]
    Write {
        /// Path of the offending file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file contents could not be decoded.
    #[error("Failed to decode {path}: {source}")]
    Decode {
        /// Path of the offending file.
        path: String,
        /// Underlying decode error.
        source: serde_json::Error,
    },
    /// The value could not be encoded.
    #[error("Failed to encode {path}: {source}")]
    Encode {
        /// Path of the offending file.
        path: String,
        /// Underlying encode error.
        source: serde_json::Error,
    },
}

impl ErrorCode for PersistError {
    fn code(&self) -> &'static str {
        match self {
            Self::Read { .. } => "PERSIST_READ",
            Self::Write { .. } => "PERSIST_WRITE",
            Self::Decode { .. } => "PERSIST_DECODE",
            Self::Encode { .. } => "PERSIST_ENCODE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let codes = [
            PairingError::ExpiredCode.code(),
            PairingError::InvalidVerifier.code(),
            PairingError::RateLimited { retry_after_secs: 1 }.code(),
            TransferError::ChecksumMismatch { offset: 0 }.code(),
            TransferError::Transport(String::new()).code(),
            RelayError::DuplicateRole { role: "source".into() }.code(),
            RegistryError::BadEnrollmentToken.code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn transient_and_permanent_split() {
        assert!(TransferError::ChecksumMismatch { offset: 42 }.is_permanent());
        assert!(TransferError::OffsetDiscontinuity { expected: 1, got: 2 }.is_permanent());
        assert!(!TransferError::Transport("reset".into()).is_permanent());
        assert!(!TransferError::Cancelled.is_permanent());
    }
}
